//! Synchronization configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Which join/quit strategy a process runs.
///
/// Every process in a cluster must use the same mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Latency-based hand-off. Cheap, but races when the quit side is slower
    /// than the configured latency.
    Delay,
    /// Checkout flag hand-off. Never loses a write.
    #[default]
    Lockstep,
}

/// What to do when a user joins with no prior data anywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewUserPolicy {
    /// Export the blank state and persist it as a `NEW_USER` snapshot.
    #[default]
    SynthesizeBlank,
    /// Persist nothing until the first real save.
    ExplicitAbsence,
}

/// Synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// Delay strategy: time to wait before reading on join.
    pub network_latency_ms: u64,
    /// Lifetime of a relay hand-off and of the server-switch marker.
    pub handoff_ttl_secs: u64,
    /// How often a waiting join re-checks the relay.
    pub poll_interval_ms: u64,
    /// Upper bound on join resolution.
    pub join_timeout_ms: u64,
    pub new_user_policy: NewUserPolicy,
    /// Persist every online user when the platform saves its world.
    pub save_on_world_save: bool,
    /// Periodic save of every online user. 0 disables.
    pub autosave_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Lockstep,
            network_latency_ms: 500,
            handoff_ttl_secs: 10,
            poll_interval_ms: 50,
            join_timeout_ms: 5000,
            new_user_policy: NewUserPolicy::SynthesizeBlank,
            save_on_world_save: true,
            autosave_interval_secs: 0,
        }
    }
}

impl SyncConfig {
    pub fn network_latency(&self) -> Duration {
        Duration::from_millis(self.network_latency_ms)
    }

    pub fn handoff_ttl(&self) -> Duration {
        Duration::from_secs(self.handoff_ttl_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        match self.autosave_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
