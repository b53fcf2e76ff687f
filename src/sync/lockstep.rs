//! Checkout-flag synchronization.
//!
//! A join may only read once it has atomically claimed the user's checkout
//! flag, and a quit releases the flag only after both writes. Whichever
//! process holds the flag owns the user's live state; the flag lives in the
//! relay, so a relay outage refuses joins rather than risk two owners.

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DataSyncer, JoinResolution, Result, SyncContext, SyncError};
use crate::config::SyncMode;
use crate::relay::{CheckoutState, MessageType, RelayMessage, Target};
use crate::snapshot::{Snapshot, User};

pub struct LockstepSyncer {
    ctx: SyncContext,
    released: Notify,
}

impl LockstepSyncer {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            released: Notify::new(),
        }
    }

    /// Release every flag this process holds and tell the cluster.
    async fn sweep(&self) -> Result<()> {
        let server = self.ctx.server_name();
        let released = self.ctx.relay.clear_checked_out_for_server(server).await?;
        if !released.is_empty() {
            warn!(server = %server, count = released.len(), "Released stale checkout flags");
        }
        for user in released {
            self.announce_clear(user).await;
        }
        Ok(())
    }

    async fn announce_clear(&self, user: Uuid) {
        let message = RelayMessage::new(
            MessageType::CheckoutClear,
            self.ctx.server_name(),
            Target::Cluster,
        )
        .with_field(user.to_string());
        if let Err(e) = self.ctx.relay.publish(message).await {
            debug!(user = %user, error = %e, "Failed to announce checkout clear");
        }
    }

    /// Read the user's state once this process holds the flag.
    async fn read_claimed(&self, user: &User) -> Result<JoinResolution> {
        let result = match self.ctx.relay.take_user_data(user.uuid).await {
            Ok(Some(snapshot)) => Ok(JoinResolution::Handoff(snapshot)),
            Ok(None) => self.ctx.load_from_store(user).await,
            Err(e) => Err(SyncError::from(e)),
        };

        if result.is_err() {
            if let Err(e) = self.ctx.relay.release_checkout(user.uuid).await {
                error!(user = %user.uuid, error = %e, "Failed to release checkout after failed join");
            }
        }
        result
    }
}

#[async_trait]
impl DataSyncer for LockstepSyncer {
    fn mode(&self) -> SyncMode {
        SyncMode::Lockstep
    }

    async fn initialize(&self) -> Result<()> {
        self.sweep().await
    }

    async fn terminate(&self) -> Result<()> {
        self.sweep().await
    }

    #[tracing::instrument(name = "sync.lockstep.join", skip_all, fields(user = %user.uuid))]
    async fn resolve_join(&self, user: &User) -> Result<JoinResolution> {
        let sync = &self.ctx.config.sync;
        let deadline = Instant::now() + sync.join_timeout();

        loop {
            let released = self.released.notified();

            match self.ctx.relay.get_checked_out(user.uuid).await? {
                CheckoutState::Unclaimed => {
                    if self.ctx.relay.try_check_out(user.uuid).await? {
                        return self.read_claimed(user).await;
                    }
                    debug!(user = %user.uuid, "Lost checkout race");
                }
                CheckoutState::Claimed(owner) => {
                    debug!(user = %user.uuid, owner = %owner, "Waiting for checkout release");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let owner = self
                    .ctx
                    .relay
                    .get_checked_out(user.uuid)
                    .await
                    .ok()
                    .and_then(|state| match state {
                        CheckoutState::Claimed(owner) => Some(owner),
                        CheckoutState::Unclaimed => None,
                    })
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(SyncError::Incomplete(format!(
                    "user {} still checked out by {} after {:?}",
                    user.uuid,
                    owner,
                    sync.join_timeout()
                )));
            }

            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep(sync.poll_interval().min(deadline - now)) => {}
            }
        }
    }

    async fn release_claim(&self, user: &User) {
        match self.ctx.relay.release_checkout(user.uuid).await {
            Ok(true) => {
                debug!(user = %user.uuid, "Released claim without saving");
                self.announce_clear(user.uuid).await;
            }
            Ok(false) => {}
            Err(e) => error!(user = %user.uuid, error = %e, "Failed to release claim"),
        }
    }

    #[tracing::instrument(name = "sync.lockstep.quit", skip_all, fields(user = %user.uuid))]
    async fn save_on_quit(&self, user: &User, snapshot: Snapshot) -> Result<()> {
        let relay = &self.ctx.relay;
        let stored = self.ctx.save_to_store(user, &snapshot).await;

        if let Err(e) = relay
            .set_user_data(user.uuid, &snapshot, self.ctx.config.sync.handoff_ttl())
            .await
        {
            warn!(user = %user.uuid, error = %e, "Failed to leave hand-off");
        }

        match relay.release_checkout(user.uuid).await {
            Ok(true) => self.announce_clear(user.uuid).await,
            Ok(false) => warn!(user = %user.uuid, "Checkout was not held by this server on quit"),
            Err(e) => error!(user = %user.uuid, error = %e, "Failed to release checkout on quit"),
        }

        if stored.is_ok() {
            info!(user = %user.uuid, version = %snapshot.version_id(), "Saved on quit");
        }
        stored
    }

    fn on_checkout_cleared(&self, _user: Uuid) {
        self.released.notify_waiters();
    }
}
