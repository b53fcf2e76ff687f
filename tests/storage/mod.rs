//! Shared storage integration tests.
//!
//! Tests the SnapshotStore interface against all implementations.
//! Each implementation module imports these test functions and runs them.

pub mod snapshot_store_tests;

/// Retention limit every store under contract test must be built with.
pub const CONTRACT_MAX_SNAPSHOTS: usize = 3;
