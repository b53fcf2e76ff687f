//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod relay;
mod storage;
mod sync;

pub use relay::{AdapterConfig, RedisConfig, RelayConfig, RelayType};
pub use storage::{PostgresConfig, SqliteConfig, StorageConfig, StorageType};
pub use sync::{NewUserPolicy, SyncConfig, SyncMode};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "handoff.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HANDOFF_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HANDOFF";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HANDOFF_LOG";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace shared by every process of one synchronized cluster.
    pub cluster_id: String,
    /// Name of this process. Must be unique within the cluster.
    pub server_name: String,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub relay: RelayConfig,
    pub adapter: AdapterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            server_name: "server".to_string(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
            relay: RelayConfig::default(),
            adapter: AdapterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `handoff.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: in-memory store, short timings.
    pub fn for_test(server_name: &str) -> Self {
        let mut config = Self {
            server_name: server_name.to_string(),
            ..Self::default()
        };
        config.storage.storage_type = StorageType::Memory;
        config.sync.network_latency_ms = 100;
        config.sync.poll_interval_ms = 10;
        config.sync.join_timeout_ms = 1000;
        config
    }
}
