//! Capabilities the embedding platform supplies.

use async_trait::async_trait;

use crate::snapshot::{Payload, Snapshot, UpdateCause, User};
use crate::sync::SyncError;

/// Result type for platform provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors reported by the platform layer.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Failed to export state for {user}: {reason}")]
    Export { user: String, reason: String },

    #[error("Failed to apply state for {user}: {reason}")]
    Apply { user: String, reason: String },

    #[error("User is not online: {0}")]
    Offline(String),
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Extracts and applies opaque user state.
///
/// The orchestrator never looks inside a payload; everything it knows about
/// a user's state comes through this trait.
#[async_trait]
pub trait PlatformDataProvider: Send + Sync {
    /// Serialize the user's live state.
    async fn export(&self, user: &User) -> Result<Payload>;

    /// Replace the user's live state with a snapshot.
    async fn apply(&self, user: &User, snapshot: &Snapshot, cause: UpdateCause) -> Result<()>;

    /// Whether payloads of this format version can be applied.
    fn supports_format(&self, _format_version: u32) -> bool {
        true
    }
}

/// Consulted before a snapshot is persisted. Returning `false` vetoes it.
///
/// Snapshots whose cause does not fire save hooks skip this entirely.
#[async_trait]
pub trait SaveHook: Send + Sync {
    async fn before_save(&self, user: &User, snapshot: &Snapshot) -> bool;
}
