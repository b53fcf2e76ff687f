//! Session orchestrator.
//!
//! Glue between the platform's event bus and the active [`DataSyncer`]. The
//! platform calls in on join, quit, world save and death; the orchestrator
//! resolves or exports state through the syncer and the
//! [`PlatformDataProvider`], and keeps a user locked until their state has
//! been applied. While locked, [`SessionOrchestrator::should_cancel_event`]
//! tells the platform to suppress the user's actions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::provider::{PlatformDataProvider, SaveHook};
use crate::config::NewUserPolicy;
use crate::relay::{CheckoutState, MessageHandler, MessageType, RelayMessage, Target};
use crate::snapshot::{Payload, SaveCause, Snapshot, UpdateCause, User};
use crate::sync::{DataSyncer, JoinResolution, Result, SyncContext, SyncError};

/// Field value marking a handshake as a reply.
const HANDSHAKE_ACK: &str = "ack";

/// How a join ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A prior snapshot was applied.
    Synchronized {
        /// `"relay"` or `"store"`.
        source: &'static str,
        version: Uuid,
    },
    /// No prior snapshot existed anywhere.
    NewUser {
        /// Whether a `NEW_USER` snapshot was written.
        persisted: bool,
    },
    /// The user left before the join finished.
    Cancelled,
    /// State could not be resolved or applied. The user stays locked.
    Incomplete(String),
}

pub struct SessionOrchestrator {
    ctx: SyncContext,
    syncer: Arc<dyn DataSyncer>,
    provider: Arc<dyn PlatformDataProvider>,
    online: RwLock<HashMap<Uuid, User>>,
    locked: RwLock<HashSet<Uuid>>,
    pending_joins: Mutex<HashMap<Uuid, AbortHandle>>,
    pending_requests: Mutex<HashMap<Uuid, oneshot::Sender<Option<Snapshot>>>>,
    peers: RwLock<HashSet<String>>,
    hooks: RwLock<Vec<Arc<dyn SaveHook>>>,
    disabling: AtomicBool,
    autosave: Mutex<Option<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    pub fn new(
        ctx: SyncContext,
        syncer: Arc<dyn DataSyncer>,
        provider: Arc<dyn PlatformDataProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            syncer,
            provider,
            online: RwLock::new(HashMap::new()),
            locked: RwLock::new(HashSet::new()),
            pending_joins: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            peers: RwLock::new(HashSet::new()),
            hooks: RwLock::new(Vec::new()),
            disabling: AtomicBool::new(false),
            autosave: Mutex::new(None),
        })
    }

    pub async fn add_save_hook(&self, hook: Arc<dyn SaveHook>) {
        self.hooks.write().await.push(hook);
    }

    /// Initialize the syncer, start consuming relay messages and announce
    /// this process to the cluster.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        self.syncer.initialize().await?;

        let dispatcher = Arc::new(Dispatcher {
            orchestrator: Arc::downgrade(self),
        });
        self.ctx.relay.subscribe(dispatcher).await?;

        let hello = RelayMessage::new(
            MessageType::Handshake,
            self.ctx.server_name(),
            Target::Cluster,
        );
        if let Err(e) = self.ctx.relay.publish(hello).await {
            warn!(error = %e, "Failed to announce startup");
        }

        if let Some(period) = self.ctx.config.sync.autosave_interval() {
            let handle = tokio::spawn(autosave_loop(Arc::downgrade(self), period));
            *self.autosave.lock().await = Some(handle);
        }

        info!(
            server = %self.ctx.server_name(),
            mode = ?self.syncer.mode(),
            "Session orchestrator started"
        );
        Ok(())
    }

    /// Flush every online user, release every claim, then close the relay.
    pub async fn shutdown(&self) -> Result<()> {
        self.disabling.store(true, Ordering::SeqCst);

        if let Some(handle) = self.autosave.lock().await.take() {
            handle.abort();
        }
        for (_, join) in self.pending_joins.lock().await.drain() {
            join.abort();
        }

        let users: Vec<User> = self.online.write().await.drain().map(|(_, u)| u).collect();
        let locked = std::mem::take(&mut *self.locked.write().await);

        let mut flushed = 0usize;
        for user in &users {
            if locked.contains(&user.uuid) {
                self.syncer.release_claim(user).await;
                continue;
            }
            match self.capture(user, SaveCause::ServerShutdown).await {
                Ok(snapshot) => match self.syncer.save_on_quit(user, snapshot).await {
                    Ok(()) => flushed += 1,
                    Err(e) => error!(user = %user.uuid, error = %e, "Failed to flush user on shutdown"),
                },
                Err(e) => {
                    error!(user = %user.uuid, error = %e, "Failed to export user on shutdown");
                    self.syncer.release_claim(user).await;
                }
            }
        }
        info!(flushed, online = users.len(), "Flushed online users");

        let terminated = self.syncer.terminate().await;

        let goodbye = RelayMessage::new(
            MessageType::TerminateHandshake,
            self.ctx.server_name(),
            Target::Cluster,
        );
        if let Err(e) = self.ctx.relay.publish(goodbye).await {
            debug!(error = %e, "Failed to announce shutdown");
        }
        self.ctx.relay.close().await?;

        info!(server = %self.ctx.server_name(), "Session orchestrator stopped");
        terminated
    }

    /// Resolve and apply a joining user's state.
    ///
    /// The user is locked until this returns a synchronized or new-user
    /// outcome. A quit while the join is pending cancels it.
    #[tracing::instrument(name = "session.join", skip_all, fields(user = %user.uuid))]
    pub async fn handle_join(self: &Arc<Self>, user: User) -> JoinOutcome {
        if self.disabling.load(Ordering::SeqCst) {
            return JoinOutcome::Incomplete("server is shutting down".to_string());
        }

        self.locked.write().await.insert(user.uuid);
        self.online.write().await.insert(user.uuid, user.clone());

        let this = Arc::clone(self);
        let joining = user.clone();
        let task = tokio::spawn(async move { this.resolve_and_apply(&joining).await });
        self.pending_joins
            .lock()
            .await
            .insert(user.uuid, task.abort_handle());

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => {
                debug!(user = %user.uuid, "Join cancelled");
                JoinOutcome::Cancelled
            }
            Err(e) => JoinOutcome::Incomplete(e.to_string()),
        };
        self.pending_joins.lock().await.remove(&user.uuid);

        match &outcome {
            JoinOutcome::Synchronized { source, version } => {
                info!(user = %user.uuid, source, version = %version, "User synchronized")
            }
            JoinOutcome::NewUser { persisted } => {
                info!(user = %user.uuid, persisted, "New user")
            }
            JoinOutcome::Incomplete(reason) => {
                warn!(user = %user.uuid, reason = %reason, "Synchronization incomplete, user stays locked")
            }
            JoinOutcome::Cancelled => {}
        }
        outcome
    }

    async fn resolve_and_apply(&self, user: &User) -> JoinOutcome {
        let resolution = match self.syncer.resolve_join(user).await {
            Ok(resolution) => resolution,
            Err(e) => return JoinOutcome::Incomplete(e.to_string()),
        };

        let outcome = match &resolution {
            JoinResolution::Handoff(snapshot) | JoinResolution::Stored(snapshot) => {
                let format = snapshot.payload().format_version;
                if !self.provider.supports_format(format) {
                    return JoinOutcome::Incomplete(format!(
                        "unsupported payload format version {}",
                        format
                    ));
                }
                if let Err(e) = self
                    .provider
                    .apply(user, snapshot, UpdateCause::Synchronized)
                    .await
                {
                    return JoinOutcome::Incomplete(e.to_string());
                }
                JoinOutcome::Synchronized {
                    source: resolution.source(),
                    version: snapshot.version_id(),
                }
            }
            JoinResolution::NewUser => match self.initialize_new_user(user).await {
                Ok(persisted) => JoinOutcome::NewUser { persisted },
                Err(e) => return JoinOutcome::Incomplete(e.to_string()),
            },
        };

        self.locked.write().await.remove(&user.uuid);
        outcome
    }

    async fn initialize_new_user(&self, user: &User) -> Result<bool> {
        match self.ctx.config.sync.new_user_policy {
            NewUserPolicy::ExplicitAbsence => Ok(false),
            NewUserPolicy::SynthesizeBlank => {
                let snapshot = self.capture(user, SaveCause::NewUser).await?;
                self.provider
                    .apply(user, &snapshot, UpdateCause::NewUser)
                    .await?;
                // Blank state is recreated on the next join if this write is lost.
                Ok(self.ctx.save_to_store(user, &snapshot).await.is_ok())
            }
        }
    }

    /// Persist the leaving user's state through the syncer.
    #[tracing::instrument(name = "session.quit", skip_all, fields(user = %user.uuid))]
    pub async fn handle_quit(&self, user: &User) -> Result<()> {
        if let Some(join) = self.pending_joins.lock().await.remove(&user.uuid) {
            join.abort();
        }
        self.online.write().await.remove(&user.uuid);
        let was_locked = self.locked.write().await.remove(&user.uuid);

        if was_locked {
            debug!(user = %user.uuid, "User left before synchronizing, nothing to save");
            self.syncer.release_claim(user).await;
            return Ok(());
        }
        if self.disabling.load(Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = match self.capture(user, SaveCause::Disconnect).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(user = %user.uuid, error = %e, "Failed to export user on quit");
                self.syncer.release_claim(user).await;
                return Err(e);
            }
        };

        if !self.permitted(user, &snapshot).await {
            self.syncer.release_claim(user).await;
            return Ok(());
        }
        self.syncer.save_on_quit(user, snapshot).await
    }

    /// Checkpoint every synchronized user. Returns how many were saved.
    pub async fn handle_world_save(&self, users: &[User]) -> usize {
        if !self.ctx.config.sync.save_on_world_save {
            return 0;
        }
        let mut saved = 0;
        for user in users {
            match self.checkpoint(user, SaveCause::WorldSave).await {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => error!(user = %user.uuid, error = %e, "World save failed"),
            }
        }
        debug!(saved, requested = users.len(), "World save finished");
        saved
    }

    /// Checkpoint a user's state at death.
    pub async fn handle_death(&self, user: &User) -> Result<bool> {
        self.checkpoint(user, SaveCause::Death).await
    }

    /// Whether the platform should suppress an event for this user.
    pub async fn should_cancel_event(&self, user: Uuid) -> bool {
        self.disabling.load(Ordering::SeqCst) || self.locked.read().await.contains(&user)
    }

    pub async fn is_locked(&self, user: Uuid) -> bool {
        self.locked.read().await.contains(&user)
    }

    pub async fn online_users(&self) -> Vec<User> {
        self.online.read().await.values().cloned().collect()
    }

    /// Servers that announced themselves and have not left.
    pub async fn peers(&self) -> Vec<String> {
        self.peers.read().await.iter().cloned().collect()
    }

    /// The user's current data, wherever it lives.
    ///
    /// A user synchronized here is exported directly. A user owned by another
    /// server is asked for over the relay; without a reply within the join
    /// timeout, the store's latest snapshot is returned.
    pub async fn request_current_data(&self, user: &User) -> Result<Option<Snapshot>> {
        if self.is_synchronized_here(user.uuid).await {
            return self.capture(user, SaveCause::Api).await.map(Some);
        }

        let server = self.ctx.server_name();
        let has_peers = !self.peers.read().await.is_empty();
        let target = match self.ctx.relay.get_checked_out(user.uuid).await {
            Ok(CheckoutState::Claimed(owner)) if owner == server => None,
            Ok(CheckoutState::Claimed(owner)) => Some(Target::Server(owner)),
            _ if has_peers => Some(Target::User(user.uuid)),
            _ => None,
        };

        if let Some(target) = target {
            if let Some(snapshot) = self.ask_owner(user, target).await {
                return Ok(Some(snapshot));
            }
        }
        Ok(self.ctx.store.get_latest_snapshot(user.uuid).await?)
    }

    async fn ask_owner(&self, user: &User, target: Target) -> Option<Snapshot> {
        let request = RelayMessage::new(MessageType::DataRequest, self.ctx.server_name(), target)
            .with_field(user.uuid.to_string());
        let request_id = request.id;

        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().await.insert(request_id, tx);

        if let Err(e) = self.ctx.relay.publish(request).await {
            warn!(user = %user.uuid, error = %e, "Failed to request live data");
            self.pending_requests.lock().await.remove(&request_id);
            return None;
        }

        match tokio::time::timeout(self.ctx.config.sync.join_timeout(), rx).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(user = %user.uuid, "No reply to data request");
                self.pending_requests.lock().await.remove(&request_id);
                None
            }
        }
    }

    /// Write new state for a user from outside a session.
    ///
    /// The snapshot is persisted first. A user synchronized here gets it
    /// applied immediately; otherwise the owning server is told to apply it
    /// and any pending hand-off is replaced so the next join does not restore
    /// older data.
    pub async fn update_user_data(&self, user: &User, payload: Payload) -> Result<Snapshot> {
        let snapshot = Snapshot::builder(user.uuid, payload)
            .save_cause(SaveCause::Api)
            .server_name(self.ctx.server_name())
            .build();

        if !self.permitted(user, &snapshot).await {
            return Err(SyncError::Cancelled);
        }
        self.ctx.save_to_store(user, &snapshot).await?;

        if self.is_synchronized_here(user.uuid).await {
            self.provider
                .apply(user, &snapshot, UpdateCause::Updated)
                .await?;
            return Ok(snapshot);
        }

        let relay = &self.ctx.relay;
        match relay.take_user_data(user.uuid).await {
            Ok(Some(_)) => {
                if let Err(e) = relay
                    .set_user_data(user.uuid, &snapshot, self.ctx.config.sync.handoff_ttl())
                    .await
                {
                    warn!(user = %user.uuid, error = %e, "Failed to replace pending hand-off");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(user = %user.uuid, error = %e, "Failed to check pending hand-off"),
        }

        let notice = RelayMessage::new(
            MessageType::UpdateUserData,
            self.ctx.server_name(),
            Target::User(user.uuid),
        )
        .with_field(user.uuid.to_string())
        .with_payload(self.ctx.adapter.to_bytes(&snapshot)?);
        if let Err(e) = relay.publish(notice).await {
            warn!(user = %user.uuid, error = %e, "Failed to notify owning server");
        }
        Ok(snapshot)
    }

    async fn is_synchronized_here(&self, user: Uuid) -> bool {
        let online = self.online.read().await.contains_key(&user);
        online && !self.locked.read().await.contains(&user)
    }

    async fn capture(&self, user: &User, cause: SaveCause) -> Result<Snapshot> {
        let payload = self.provider.export(user).await?;
        Ok(Snapshot::builder(user.uuid, payload)
            .save_cause(cause)
            .server_name(self.ctx.server_name())
            .build())
    }

    /// Run save hooks. `false` means a hook vetoed the save.
    async fn permitted(&self, user: &User, snapshot: &Snapshot) -> bool {
        if !snapshot.save_cause().fires_save_hook() {
            return true;
        }
        let hooks = self.hooks.read().await.clone();
        for hook in hooks {
            if !hook.before_save(user, snapshot).await {
                info!(user = %user.uuid, cause = %snapshot.save_cause(), "Save vetoed by hook");
                return false;
            }
        }
        true
    }

    /// Store-only save that leaves checkout state alone.
    async fn checkpoint(&self, user: &User, cause: SaveCause) -> Result<bool> {
        if !self.is_synchronized_here(user.uuid).await {
            return Ok(false);
        }
        let snapshot = self.capture(user, cause).await?;
        if !self.permitted(user, &snapshot).await {
            return Ok(false);
        }
        self.ctx.save_to_store(user, &snapshot).await?;
        Ok(true)
    }

    async fn on_message(&self, message: RelayMessage) {
        let addressed = {
            let online = self.online.read().await;
            message.is_for(self.ctx.server_name(), |uuid| online.contains_key(&uuid))
        };
        if !addressed {
            return;
        }

        match message.kind {
            MessageType::DataRequest => self.answer_data_request(message).await,
            MessageType::DataHandoff => {
                let Some(request) = message.reply_to() else {
                    warn!(source = %message.source, "Data hand-off without request id");
                    return;
                };
                let Some(waiter) = self.pending_requests.lock().await.remove(&request) else {
                    return;
                };
                let snapshot = match self.ctx.adapter.from_bytes(&message.payload) {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) => {
                        warn!(source = %message.source, error = %e, "Unreadable data hand-off");
                        None
                    }
                };
                let _ = waiter.send(snapshot);
            }
            MessageType::UpdateUserData => self.apply_remote_update(message).await,
            MessageType::CheckoutClear => {
                if let Some(user) = first_uuid(&message) {
                    self.syncer.on_checkout_cleared(user);
                }
            }
            MessageType::Handshake => {
                self.peers.write().await.insert(message.source.clone());
                if message.fields.first().map(String::as_str) != Some(HANDSHAKE_ACK) {
                    let ack = RelayMessage::new(
                        MessageType::Handshake,
                        self.ctx.server_name(),
                        Target::Server(message.source.clone()),
                    )
                    .with_field(HANDSHAKE_ACK);
                    if let Err(e) = self.ctx.relay.publish(ack).await {
                        debug!(peer = %message.source, error = %e, "Failed to acknowledge handshake");
                    }
                }
                debug!(peer = %message.source, "Peer joined");
            }
            MessageType::TerminateHandshake => {
                self.peers.write().await.remove(&message.source);
                debug!(peer = %message.source, "Peer left");
            }
            MessageType::ServerSwitchNotice => {
                debug!(source = %message.source, user = ?message.fields.first(), "Server switch");
            }
        }
    }

    async fn answer_data_request(&self, message: RelayMessage) {
        let Some(uuid) = first_uuid(&message) else {
            return;
        };
        if !self.is_synchronized_here(uuid).await {
            return;
        }
        let Some(user) = self.online.read().await.get(&uuid).cloned() else {
            return;
        };

        let bytes = match self.capture(&user, SaveCause::Api).await {
            Ok(snapshot) => match self.ctx.adapter.to_bytes(&snapshot) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(user = %uuid, error = %e, "Failed to encode requested data");
                    return;
                }
            },
            Err(e) => {
                error!(user = %uuid, error = %e, "Failed to export requested data");
                return;
            }
        };

        let reply = RelayMessage::new(
            MessageType::DataHandoff,
            self.ctx.server_name(),
            Target::Server(message.source.clone()),
        )
        .with_field(message.id.to_string())
        .with_payload(bytes);
        if let Err(e) = self.ctx.relay.publish(reply).await {
            warn!(user = %uuid, error = %e, "Failed to answer data request");
        }
    }

    async fn apply_remote_update(&self, message: RelayMessage) {
        let Some(uuid) = first_uuid(&message) else {
            return;
        };
        if !self.is_synchronized_here(uuid).await {
            return;
        }
        let Some(user) = self.online.read().await.get(&uuid).cloned() else {
            return;
        };

        let snapshot = match self.ctx.adapter.from_bytes(&message.payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(user = %uuid, error = %e, "Unreadable user data update");
                return;
            }
        };
        if let Err(e) = self
            .provider
            .apply(&user, &snapshot, UpdateCause::Updated)
            .await
        {
            error!(user = %uuid, error = %e, "Failed to apply user data update");
        }
    }
}

fn first_uuid(message: &RelayMessage) -> Option<Uuid> {
    message.fields.first().and_then(|f| Uuid::parse_str(f).ok())
}

/// Relay handler that forwards to the orchestrator while it is alive.
struct Dispatcher {
    orchestrator: Weak<SessionOrchestrator>,
}

impl MessageHandler for Dispatcher {
    fn handle(&self, message: RelayMessage) -> BoxFuture<'static, ()> {
        let orchestrator = self.orchestrator.clone();
        Box::pin(async move {
            if let Some(orchestrator) = orchestrator.upgrade() {
                orchestrator.on_message(message).await;
            }
        })
    }
}

async fn autosave_loop(orchestrator: Weak<SessionOrchestrator>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(this) = orchestrator.upgrade() else {
            break;
        };
        let mut saved = 0usize;
        for user in this.online_users().await {
            match this.checkpoint(&user, SaveCause::Scheduled).await {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => error!(user = %user.uuid, error = %e, "Autosave failed"),
            }
        }
        debug!(saved, "Autosave finished");
    }
}

#[cfg(test)]
mod tests;
