//! Latency-based synchronization.
//!
//! On join, sleep for the configured network latency, then read the store
//! unless a server-switch marker says a hand-off is on its way. On quit, mark
//! the switch, leave a hand-off, then append to the store.
//!
//! A reconnect that finishes its latency wait before the quitting process
//! sets the marker reads the store before the quit's write lands. That window
//! is `network_latency_ms` wide and is reported at startup; it is not closed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{DataSyncer, JoinResolution, Result, SyncContext};
use crate::config::SyncMode;
use crate::relay::{MessageType, RelayMessage, Target};
use crate::snapshot::{Snapshot, User};

pub struct DelaySyncer {
    ctx: SyncContext,
}

impl DelaySyncer {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// How long after a quit elsewhere a join may still read stale data.
    pub fn risk_window(&self) -> Duration {
        self.ctx.config.sync.network_latency()
    }

    async fn await_handoff(&self, user: &User) -> Result<JoinResolution> {
        let sync = &self.ctx.config.sync;
        let deadline = Instant::now() + sync.join_timeout();

        loop {
            match self.ctx.relay.take_user_data(user.uuid).await {
                Ok(Some(snapshot)) => return Ok(JoinResolution::Handoff(snapshot)),
                Ok(None) => {}
                Err(e) => {
                    warn!(user = %user.uuid, error = %e, "Hand-off unreadable, reading from store");
                    return self.ctx.load_from_store(user).await;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(user = %user.uuid, "Hand-off did not arrive in time, reading from store");
                return self.ctx.load_from_store(user).await;
            }
            tokio::time::sleep(sync.poll_interval().min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl DataSyncer for DelaySyncer {
    fn mode(&self) -> SyncMode {
        SyncMode::Delay
    }

    async fn initialize(&self) -> Result<()> {
        warn!(
            risk_window_ms = self.risk_window().as_millis() as u64,
            "Delay sync enabled: a join this soon after a quit on another server can read stale data"
        );
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        Ok(())
    }

    #[tracing::instrument(name = "sync.delay.join", skip_all, fields(user = %user.uuid))]
    async fn resolve_join(&self, user: &User) -> Result<JoinResolution> {
        tokio::time::sleep(self.ctx.config.sync.network_latency()).await;

        match self.ctx.relay.take_server_switch(user.uuid).await {
            Ok(true) => {
                debug!(user = %user.uuid, "Server switch in flight, awaiting hand-off");
                self.await_handoff(user).await
            }
            Ok(false) => self.ctx.load_from_store(user).await,
            Err(e) => {
                warn!(user = %user.uuid, error = %e, "Relay unavailable, reading from store");
                self.ctx.load_from_store(user).await
            }
        }
    }

    async fn release_claim(&self, _user: &User) {}

    #[tracing::instrument(name = "sync.delay.quit", skip_all, fields(user = %user.uuid))]
    async fn save_on_quit(&self, user: &User, snapshot: Snapshot) -> Result<()> {
        let relay = &self.ctx.relay;
        let ttl = self.ctx.config.sync.handoff_ttl();

        if let Err(e) = relay.set_server_switch(user.uuid, ttl).await {
            warn!(user = %user.uuid, error = %e, "Failed to set server-switch marker");
        }
        if let Err(e) = relay.set_user_data(user.uuid, &snapshot, ttl).await {
            warn!(user = %user.uuid, error = %e, "Failed to leave hand-off");
        }

        let stored = self.ctx.save_to_store(user, &snapshot).await;

        let notice = RelayMessage::new(
            MessageType::ServerSwitchNotice,
            self.ctx.server_name(),
            Target::Cluster,
        )
        .with_field(user.uuid.to_string());
        if let Err(e) = relay.publish(notice).await {
            debug!(error = %e, "Failed to announce server switch");
        }

        if stored.is_ok() {
            info!(user = %user.uuid, version = %snapshot.version_id(), "Saved on quit");
        }
        stored
    }
}
