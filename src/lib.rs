//! Handoff - cross-server player state synchronization
//!
//! Keeps exactly one authoritative copy of a user's state in play while
//! their session moves between independent server processes that share only
//! a durable snapshot store and an ephemeral relay.

pub mod adapter;
pub mod config;
pub mod relay;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod sync;
pub mod utils;

pub use config::Config;
pub use session::{JoinOutcome, PlatformDataProvider, SaveHook, SessionOrchestrator};
pub use snapshot::{Payload, SaveCause, Snapshot, UpdateCause, User};
pub use sync::{create_syncer, DataSyncer, SyncContext, SyncError};
