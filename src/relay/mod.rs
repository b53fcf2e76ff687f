//! Ephemeral relay: pub/sub broadcast, hand-off cache and checkout flags.
//!
//! This module contains:
//! - `Relay` trait: the cluster-shared, short-lived state
//! - `MessageHandler` trait: for processing relay broadcasts
//! - Key layout shared by all backends
//! - Implementations: in-process channel, Redis
//!
//! The checkout flag and the hand-off cache are the only cluster-shared
//! mutable state. Both live here, never in a process's own memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;
use uuid::Uuid;

use crate::adapter::{AdapterError, DataAdapter};
use crate::config::{Config, RelayType};
use crate::snapshot::Snapshot;

pub mod channel;
mod message;
#[cfg(feature = "redis")]
pub mod redis;

pub use channel::{ChannelHub, ChannelRelay};
pub use message::{MessageType, RelayMessage, Target};
#[cfg(feature = "redis")]
pub use self::redis::RedisRelay;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur during relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay closed")]
    Closed,

    #[error("Snapshot encoding error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Message encoding error: {0}")]
    Message(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Observed state of a user's checkout flag.
///
/// A relay failure is the third state: the caller cannot know, and is told
/// so through `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutState {
    Unclaimed,
    /// Owned by the named process.
    Claimed(String),
}

impl CheckoutState {
    pub fn is_claimed(&self) -> bool {
        matches!(self, CheckoutState::Claimed(_))
    }
}

/// Handler for relay broadcasts addressed to this process.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: RelayMessage) -> BoxFuture<'static, ()>;
}

/// Interface for the ephemeral relay.
///
/// Implementations:
/// - `ChannelRelay`: in-process, for tests and single-process setups
/// - `RedisRelay`: Redis keys with TTLs plus Redis pub/sub
#[async_trait]
pub trait Relay: Send + Sync {
    /// Name of the process this relay connection belongs to.
    fn server_name(&self) -> &str;

    /// Broadcast a message to the cluster.
    async fn publish(&self, message: RelayMessage) -> Result<()>;

    /// Start delivering broadcasts to `handler`.
    ///
    /// Messages from other clusters and this process's own messages are
    /// dropped before the handler sees them.
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Leave a snapshot for whichever process the user joins next.
    async fn set_user_data(&self, user: Uuid, snapshot: &Snapshot, ttl: Duration) -> Result<()>;

    /// Consume the pending hand-off. A second call returns `None`.
    async fn take_user_data(&self, user: Uuid) -> Result<Option<Snapshot>>;

    /// Mark that the user is switching servers.
    async fn set_server_switch(&self, user: Uuid, ttl: Duration) -> Result<()>;

    /// Consume the server-switch marker.
    async fn take_server_switch(&self, user: Uuid) -> Result<bool>;

    async fn get_checked_out(&self, user: Uuid) -> Result<CheckoutState>;

    /// Atomically claim the user for this process if nobody holds them.
    ///
    /// Returns whether this call made the claim.
    async fn try_check_out(&self, user: Uuid) -> Result<bool>;

    /// Unconditionally set or clear the flag on behalf of this process.
    async fn set_checked_out(&self, user: Uuid, checked_out: bool) -> Result<()>;

    /// Clear the flag only if this process holds it.
    async fn release_checkout(&self, user: Uuid) -> Result<bool>;

    /// Clear every flag held by `server`. Returns the released users.
    async fn clear_checked_out_for_server(&self, server: &str) -> Result<Vec<Uuid>>;

    /// Stop consumers and drop the connection.
    async fn close(&self) -> Result<()>;
}

/// Key layout shared by the relay backends.
#[derive(Debug, Clone)]
pub(crate) struct Keys {
    prefix: String,
}

impl Keys {
    pub(crate) fn new(cluster_id: &str) -> Self {
        let prefix = if cluster_id.is_empty() {
            "handoff".to_string()
        } else {
            format!("handoff:{}", cluster_id)
        };
        Self { prefix }
    }

    pub(crate) fn user_data(&self, user: Uuid) -> String {
        format!("{}:data:{}", self.prefix, user)
    }

    pub(crate) fn server_switch(&self, user: Uuid) -> String {
        format!("{}:switch:{}", self.prefix, user)
    }

    #[cfg(feature = "redis")]
    pub(crate) fn checkout(&self, user: Uuid) -> String {
        format!("{}:checkout:{}", self.prefix, user)
    }

    #[cfg(feature = "redis")]
    pub(crate) fn server_claims(&self, server: &str) -> String {
        format!("{}:claims:{}", self.prefix, server)
    }

    #[cfg(feature = "redis")]
    pub(crate) fn channel(&self) -> String {
        format!("{}:messages", self.prefix)
    }
}

/// Initialize the relay based on configuration.
pub async fn init_relay(
    config: &Config,
    adapter: Arc<dyn DataAdapter>,
) -> std::result::Result<Arc<dyn Relay>, Box<dyn std::error::Error + Send + Sync>> {
    info!(relay = ?config.relay.relay_type, server = %config.server_name, "Initializing relay");

    match config.relay.relay_type {
        RelayType::Channel => {
            let hub = ChannelHub::new(&config.cluster_id);
            Ok(Arc::new(ChannelRelay::new(hub, &config.server_name, adapter)))
        }
        #[cfg(feature = "redis")]
        RelayType::Redis => {
            let relay = crate::utils::bootstrap::connect_with_retry(
                "relay",
                &config.relay.redis.url,
                || RedisRelay::new(&config.relay.redis.url, &config.cluster_id, &config.server_name, adapter.clone()),
            )
            .await?;
            Ok(Arc::new(relay))
        }
        #[cfg(not(feature = "redis"))]
        RelayType::Redis => {
            tracing::error!("Redis relay requested but redis feature not enabled");
            Err("Redis relay requires the redis feature".into())
        }
    }
}
