//! Relay message envelope.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a relay broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Ask the owning process for a live user's current data.
    DataRequest,
    /// Reply to a `DataRequest`; `fields[0]` carries the request id.
    DataHandoff,
    /// A user left a process to switch servers.
    ServerSwitchNotice,
    /// A checkout flag was released.
    CheckoutClear,
    /// Apply a newer snapshot to a user online on the target process.
    UpdateUserData,
    /// A process joined the cluster.
    Handshake,
    /// A process left the cluster.
    TerminateHandshake,
}

/// Who a message is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    /// Whichever process currently hosts this user.
    User(Uuid),
    /// A named process.
    Server(String),
    /// Every process in the cluster.
    Cluster,
}

/// Broadcast envelope carried over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: Uuid,
    pub kind: MessageType,
    /// Name of the sending process.
    pub source: String,
    pub cluster_id: String,
    pub target: Target,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default, with = "crate::snapshot::base64_bytes")]
    pub payload: Vec<u8>,
}

impl RelayMessage {
    pub fn new(kind: MessageType, source: impl Into<String>, target: Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.into(),
            cluster_id: String::new(),
            target,
            fields: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Whether a process named `server` hosting `online` should handle this.
    pub fn is_for(&self, server: &str, online: impl Fn(Uuid) -> bool) -> bool {
        match &self.target {
            Target::Cluster => true,
            Target::Server(name) => name == server,
            Target::User(uuid) => online(*uuid),
        }
    }

    /// The request id a `DataHandoff` replies to.
    pub fn reply_to(&self) -> Option<Uuid> {
        self.fields.first().and_then(|f| Uuid::parse_str(f).ok())
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
