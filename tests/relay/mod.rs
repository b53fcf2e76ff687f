//! Shared relay integration tests.
//!
//! Each test takes two relays attached to the same backend under different
//! server names, standing in for two processes of one cluster.

pub mod relay_tests;
