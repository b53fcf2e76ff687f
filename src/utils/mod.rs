//! Startup helpers shared by the binaries and embedding processes.

pub mod bootstrap;
pub mod retry;
