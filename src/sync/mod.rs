//! Synchronization strategies.
//!
//! A [`DataSyncer`] decides, on join, whether a user's state comes from a
//! relay hand-off or from the durable store, and on quit where the exported
//! state is written. Two strategies exist:
//!
//! - [`DelaySyncer`]: waits a fixed latency before reading. No lock.
//! - [`LockstepSyncer`]: a cluster-wide checkout flag serializes ownership.
//!
//! Per user, across the cluster, state moves through
//! `UNOWNED -> IN_TRANSIT -> OWNED -> UNOWNED`. Different users never
//! contend with each other.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use crate::adapter::{AdapterError, DataAdapter};
use crate::config::{Config, SyncMode};
use crate::relay::{Relay, RelayError};
use crate::snapshot::{Snapshot, User};
use crate::storage::{SnapshotStore, StorageError};

mod delay;
mod lockstep;

pub use delay::DelaySyncer;
pub use lockstep::LockstepSyncer;

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by a synchronization cycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// State could not be produced or consumed. The prior snapshot is untouched.
    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StorageError),

    #[error("Relay unavailable: {0}")]
    RelayUnavailable(RelayError),

    /// Join resolution did not finish in bounded time.
    #[error("Synchronization incomplete: {0}")]
    Incomplete(String),

    #[error("Synchronization cancelled")]
    Cancelled,
}

impl From<RelayError> for SyncError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Adapter(e) => SyncError::Serialization(e.to_string()),
            other => SyncError::RelayUnavailable(other),
        }
    }
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Where a join found the user's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResolution {
    /// Consumed from the relay hand-off cache.
    Handoff(Snapshot),
    /// Latest snapshot from the durable store.
    Stored(Snapshot),
    /// The user never had a snapshot.
    NewUser,
}

impl JoinResolution {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            JoinResolution::Handoff(s) | JoinResolution::Stored(s) => Some(s),
            JoinResolution::NewUser => None,
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            JoinResolution::Handoff(_) => "relay",
            JoinResolution::Stored(_) => "store",
            JoinResolution::NewUser => "none",
        }
    }
}

/// Everything a strategy needs, passed explicitly instead of held globally.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn SnapshotStore>,
    pub relay: Arc<dyn Relay>,
    pub adapter: Arc<dyn DataAdapter>,
}

impl SyncContext {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SnapshotStore>,
        relay: Arc<dyn Relay>,
        adapter: Arc<dyn DataAdapter>,
    ) -> Self {
        Self {
            config,
            store,
            relay,
            adapter,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    /// Persist a snapshot, ensuring the user exists first.
    ///
    /// Failures are logged at error level: a lost write here is lost data.
    #[tracing::instrument(name = "sync.store_write", skip_all, fields(user = %user.uuid))]
    pub async fn save_to_store(&self, user: &User, snapshot: &Snapshot) -> Result<()> {
        let result = async {
            self.store.ensure_user(user).await?;
            self.store.add_snapshot(user.uuid, snapshot).await
        }
        .await;

        if let Err(e) = &result {
            error!(
                user = %user.uuid,
                username = %user.username,
                cause = %snapshot.save_cause(),
                version = %snapshot.version_id(),
                error = %e,
                "Failed to persist snapshot"
            );
        }
        Ok(result?)
    }

    /// Resolve from the durable store alone.
    pub async fn load_from_store(&self, user: &User) -> Result<JoinResolution> {
        match self.store.get_latest_snapshot(user.uuid).await {
            Ok(Some(snapshot)) => Ok(JoinResolution::Stored(snapshot)),
            Ok(None) => {
                debug!(user = %user.uuid, "No stored snapshot");
                Ok(JoinResolution::NewUser)
            }
            Err(e) => {
                error!(user = %user.uuid, error = %e, "Failed to read latest snapshot");
                Err(e.into())
            }
        }
    }
}

/// A join/quit strategy.
#[async_trait]
pub trait DataSyncer: Send + Sync {
    fn mode(&self) -> SyncMode;

    /// Called once when the process starts.
    async fn initialize(&self) -> Result<()>;

    /// Called once when the process stops, after every user was flushed.
    async fn terminate(&self) -> Result<()>;

    /// Decide where the joining user's state comes from.
    async fn resolve_join(&self, user: &User) -> Result<JoinResolution>;

    /// Give up this process's claim on a user without saving.
    ///
    /// Used when a join is abandoned or a session ends before it was ever
    /// synchronized.
    async fn release_claim(&self, user: &User);

    /// Persist the snapshot exported when the user left.
    async fn save_on_quit(&self, user: &User, snapshot: Snapshot) -> Result<()>;

    /// Another process released a user's checkout flag.
    fn on_checkout_cleared(&self, _user: Uuid) {}
}

/// Build the strategy selected by the configuration.
pub fn create_syncer(ctx: SyncContext) -> Arc<dyn DataSyncer> {
    match ctx.config.sync.mode {
        SyncMode::Delay => Arc::new(DelaySyncer::new(ctx)),
        SyncMode::Lockstep => Arc::new(LockstepSyncer::new(ctx)),
    }
}
