//! Relay configuration types.

use serde::Deserialize;

/// Relay type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayType {
    /// In-process relay. Only processes sharing one hub see each other.
    #[default]
    Channel,
    Redis,
}

/// Relay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    #[serde(rename = "type")]
    pub relay_type: RelayType,
    pub redis: RedisConfig,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Byte adapter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Deflate snapshots before they go over the relay.
    pub compress: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self { compress: true }
    }
}
