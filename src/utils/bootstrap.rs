//! Bootstrap utilities for handoff binaries and embedding processes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::adapter::adapter_for;
use crate::config::{Config, LOG_ENV_VAR};
use crate::relay::init_relay;
use crate::storage::init_storage;
use crate::sync::SyncContext;

use super::retry::connection_backoff;

/// Initialize tracing with HANDOFF_LOG environment variable.
///
/// Defaults to "info" level if HANDOFF_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a backing service with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "store", "relay")
/// * `address` - The address being connected to
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error after max retries.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = connect
        .retry(connection_backoff())
        .notify(|e: &E, delay: Duration| {
            warn!(
                service = service_name,
                address,
                error = %e,
                ?delay,
                "Connection failed, retrying"
            );
        })
        .await;

    match &result {
        Ok(_) => info!(service = service_name, address, "Connected"),
        Err(e) => tracing::error!(
            service = service_name,
            address,
            error = %e,
            "Giving up on connection"
        ),
    }
    result
}

/// Build the shared context from configuration: store, relay and adapter.
pub async fn build_context(
    config: Config,
) -> Result<SyncContext, Box<dyn std::error::Error + Send + Sync>> {
    let adapter = adapter_for(config.adapter.compress);

    let store = connect_with_retry("store", &format!("{:?}", config.storage.storage_type), || {
        init_storage(&config.storage, &config.cluster_id)
    })
    .await?;

    let relay = init_relay(&config, adapter.clone()).await?;

    Ok(SyncContext::new(Arc::new(config), store, relay, adapter))
}
