//! Versioned user state snapshots.
//!
//! A [`Snapshot`] is the unit that moves between the durable store, the relay
//! hand-off cache and a live session. The payload is opaque: it is produced and
//! consumed by the platform layer and only ever stored, moved and compared
//! as a whole here.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user identity.
///
/// The username is a secondary lookup key and may lag behind the uuid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub uuid: Uuid,
    pub username: String,
}

impl User {
    pub fn new(uuid: Uuid, username: impl Into<String>) -> Self {
        Self {
            uuid,
            username: username.into(),
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.username, self.uuid)
    }
}

/// Externally serialized user state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Format version of `data`, owned by the platform serializer.
    pub format_version: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(format_version: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            format_version,
            data: data.into(),
        }
    }
}

/// Why a snapshot was taken.
///
/// Informational only; never drives synchronization decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaveCause {
    Disconnect,
    ServerSwitch,
    WorldSave,
    Death,
    ServerShutdown,
    NewUser,
    Api,
    Scheduled,
    Backup,
    Converted,
    Other(String),
}

impl SaveCause {
    /// Stable name used in the durable store.
    pub fn as_str(&self) -> &str {
        match self {
            SaveCause::Disconnect => "DISCONNECT",
            SaveCause::ServerSwitch => "SERVER_SWITCH",
            SaveCause::WorldSave => "WORLD_SAVE",
            SaveCause::Death => "DEATH",
            SaveCause::ServerShutdown => "SERVER_SHUTDOWN",
            SaveCause::NewUser => "NEW_USER",
            SaveCause::Api => "API",
            SaveCause::Scheduled => "SCHEDULED",
            SaveCause::Backup => "BACKUP",
            SaveCause::Converted => "CONVERTED",
            SaveCause::Other(name) => name,
        }
    }

    /// Parse a stored cause name. Unknown names are kept as `Other`.
    pub fn parse(name: &str) -> Self {
        match name {
            "DISCONNECT" => SaveCause::Disconnect,
            "SERVER_SWITCH" => SaveCause::ServerSwitch,
            "WORLD_SAVE" => SaveCause::WorldSave,
            "DEATH" => SaveCause::Death,
            "SERVER_SHUTDOWN" => SaveCause::ServerShutdown,
            "NEW_USER" => SaveCause::NewUser,
            "API" => SaveCause::Api,
            "SCHEDULED" => SaveCause::Scheduled,
            "BACKUP" => SaveCause::Backup,
            "CONVERTED" => SaveCause::Converted,
            other => SaveCause::Other(other.to_string()),
        }
    }

    /// Whether save hooks are consulted before persisting with this cause.
    ///
    /// Shutdown saves bypass hooks so nothing can veto the final flush.
    pub fn fires_save_hook(&self) -> bool {
        !matches!(self, SaveCause::ServerShutdown)
    }
}

impl fmt::Display for SaveCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a snapshot is being applied to a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCause {
    /// Resolved by the syncer on join.
    Synchronized,
    /// No prior data existed.
    NewUser,
    /// Pushed by an API write while the user was online.
    Updated,
}

/// Immutable versioned record of a user's state.
///
/// Snapshots are totally ordered by `timestamp`; the durable store breaks ties
/// by insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    owner: Uuid,
    version_id: Uuid,
    timestamp: DateTime<Utc>,
    save_cause: SaveCause,
    server_name: String,
    pinned: bool,
    payload: Payload,
}

impl Snapshot {
    pub fn builder(owner: Uuid, payload: Payload) -> SnapshotBuilder {
        SnapshotBuilder::new(owner, payload)
    }

    /// Rebuild a snapshot from stored fields.
    pub fn from_parts(
        owner: Uuid,
        version_id: Uuid,
        timestamp: DateTime<Utc>,
        save_cause: SaveCause,
        server_name: String,
        pinned: bool,
        payload: Payload,
    ) -> Self {
        Self {
            owner,
            version_id,
            timestamp,
            save_cause,
            server_name,
            pinned,
            payload,
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn version_id(&self) -> Uuid {
        self.version_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn save_cause(&self) -> &SaveCause {
        &self.save_cause
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Pinned snapshots are exempt from retention pruning.
    ///
    /// When read back from a store this reflects the store's retention
    /// metadata at read time.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns the same snapshot carrying different retention metadata.
    pub(crate) fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }
}

/// Builds a new [`Snapshot`] with a fresh version id and the current time.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    owner: Uuid,
    payload: Payload,
    save_cause: SaveCause,
    server_name: String,
    pinned: bool,
    timestamp: Option<DateTime<Utc>>,
}

impl SnapshotBuilder {
    pub fn new(owner: Uuid, payload: Payload) -> Self {
        Self {
            owner,
            payload,
            save_cause: SaveCause::Api,
            server_name: String::new(),
            pinned: false,
            timestamp: None,
        }
    }

    pub fn save_cause(mut self, cause: SaveCause) -> Self {
        self.save_cause = cause;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Override the creation time. Used by imports and tests.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Snapshot {
        Snapshot {
            owner: self.owner,
            version_id: Uuid::new_v4(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            save_cause: self.save_cause,
            server_name: self.server_name,
            pinned: self.pinned,
            payload: self.payload,
        }
    }
}

/// Serde helper encoding byte buffers as base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
