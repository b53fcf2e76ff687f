//! Durable snapshot storage.
//!
//! The durable store keeps an append-only, per-user history of snapshots and
//! is the source of truth whenever no live session owns a user. Retention is
//! enforced inside the same write that appends a snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{StorageConfig, StorageType};
use crate::snapshot::{Snapshot, User};

pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MockSnapshotStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSnapshotStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSnapshotStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("User not found: {0}")]
    UnknownUser(Uuid),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Retention policy applied on every snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Maximum number of unpinned snapshots kept per user.
    pub max_snapshots: usize,
    /// When set, a new unpinned snapshot replaces the newest unpinned one
    /// taken within this window instead of adding to the history.
    pub backup_frequency: Option<chrono::Duration>,
}

impl Retention {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            max_snapshots: max_snapshots.max(1),
            backup_frequency: None,
        }
    }

    pub fn with_backup_frequency_hours(mut self, hours: u64) -> Self {
        self.backup_frequency = match hours {
            0 => None,
            h => Some(chrono::Duration::hours(h as i64)),
        };
        self
    }

    /// Cutoff after which an existing snapshot is rotated out by `incoming`.
    pub(crate) fn rotation_cutoff(
        &self,
        incoming: &Snapshot,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        if incoming.is_pinned() {
            return None;
        }
        self.backup_frequency.map(|window| incoming.timestamp() - window)
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::new(16)
    }
}

impl From<&StorageConfig> for Retention {
    fn from(config: &StorageConfig) -> Self {
        Retention::new(config.max_snapshots)
            .with_backup_frequency_hours(config.backup_frequency_hours)
    }
}

/// Interface for durable snapshot persistence.
///
/// Implementations:
/// - `SqliteSnapshotStore`: SQLite storage
/// - `PostgresSnapshotStore`: PostgreSQL storage
/// - `MockSnapshotStore`: In-memory store for tests and single-process setups
///
/// Connectivity failures are always returned as errors. Nothing here retries.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert the user, or refresh their username if they already exist.
    async fn ensure_user(&self, user: &User) -> Result<()>;

    /// Look up a user by uuid.
    async fn get_user(&self, uuid: Uuid) -> Result<Option<User>>;

    /// Look up a user by username, ignoring case.
    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>>;

    /// List every known user.
    async fn get_all_users(&self) -> Result<Vec<User>>;

    /// Append a snapshot and prune history beyond the retention limit.
    ///
    /// The user must have been ensured first. Readers never observe the
    /// history over the limit.
    async fn add_snapshot(&self, user: Uuid, snapshot: &Snapshot) -> Result<()>;

    /// The newest snapshot, or `None` if the user never had one.
    async fn get_latest_snapshot(&self, user: Uuid) -> Result<Option<Snapshot>>;

    /// All retained snapshots, newest first.
    async fn get_snapshot_history(&self, user: Uuid) -> Result<Vec<Snapshot>>;

    /// A specific snapshot by version id.
    async fn get_snapshot(&self, user: Uuid, version_id: Uuid) -> Result<Option<Snapshot>>;

    /// Delete a specific snapshot. Returns whether it existed.
    async fn delete_snapshot(&self, user: Uuid, version_id: Uuid) -> Result<bool>;

    /// Set the retention pin of a snapshot. Returns whether it existed.
    async fn set_pinned(&self, user: Uuid, version_id: Uuid, pinned: bool) -> Result<bool>;
}

/// Initialize the durable store based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
    cluster_id: &str,
) -> std::result::Result<Arc<dyn SnapshotStore>, Box<dyn std::error::Error + Send + Sync>> {
    let retention = Retention::from(config);
    info!(
        storage = ?config.storage_type,
        max_snapshots = retention.max_snapshots,
        "Initializing snapshot store"
    );

    match config.storage_type {
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            if let Some(parent) = std::path::Path::new(&config.sqlite.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.sqlite.path))
                    .await?;
            let store = SqliteSnapshotStore::new(pool, cluster_id, retention);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            let pool = sqlx::PgPool::connect(&config.postgres.uri).await?;
            let store = PostgresSnapshotStore::new(pool, cluster_id, retention);
            store.init().await?;
            Ok(Arc::new(store))
        }
        StorageType::Memory => Ok(Arc::new(MockSnapshotStore::with_retention(retention))),
        #[allow(unreachable_patterns)]
        other => {
            error!(storage = ?other, "Storage backend requested but its feature is not enabled");
            Err(format!("Storage backend {:?} not enabled", other).into())
        }
    }
}
