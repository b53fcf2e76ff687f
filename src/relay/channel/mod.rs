//! In-memory channel-based relay.
//!
//! Uses a tokio broadcast channel for pub/sub and a mutex-guarded map with
//! expiry for the hand-off cache and checkout flags. Every `ChannelRelay`
//! built from the same `ChannelHub` behaves like a process connected to the
//! same Redis, so whole clusters can run inside one test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{CheckoutState, Keys, MessageHandler, Relay, RelayError, RelayMessage, Result};
use crate::adapter::DataAdapter;
use crate::snapshot::Snapshot;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct HubState {
    entries: HashMap<String, Entry>,
    checkouts: HashMap<Uuid, String>,
}

impl HubState {
    /// Inserts an entry, dropping any that have expired.
    fn insert(&mut self, key: String, entry: Entry) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.is_live(now));
        self.entries.insert(key, entry);
    }

    fn take(&mut self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.remove(key)?;
        entry.is_live(Instant::now()).then_some(entry.value)
    }
}

/// Shared state standing in for the relay server.
#[derive(Clone)]
pub struct ChannelHub {
    sender: broadcast::Sender<Arc<RelayMessage>>,
    state: Arc<Mutex<HubState>>,
    keys: Keys,
    cluster_id: String,
}

impl ChannelHub {
    pub fn new(cluster_id: &str) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            state: Arc::new(Mutex::new(HubState::default())),
            keys: Keys::new(cluster_id),
            cluster_id: cluster_id.to_string(),
        }
    }

    /// Number of live hand-off entries. Used by tests.
    pub async fn pending_handoffs(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.entries.values().filter(|e| e.is_live(now)).count()
    }
}

/// One process's connection to a `ChannelHub`.
pub struct ChannelRelay {
    hub: ChannelHub,
    server_name: String,
    adapter: Arc<dyn DataAdapter>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChannelRelay {
    pub fn new(hub: ChannelHub, server_name: &str, adapter: Arc<dyn DataAdapter>) -> Self {
        info!(server = %server_name, cluster = %hub.cluster_id, "Channel relay initialized");
        Self {
            hub,
            server_name: server_name.to_string(),
            adapter,
            consumer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        Ok(())
    }

    async fn put(&self, key: String, value: Vec<u8>, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.hub.state.lock().await.insert(key, entry);
    }
}

#[async_trait]
impl Relay for ChannelRelay {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    #[tracing::instrument(name = "relay.publish", skip_all, fields(kind = ?message.kind))]
    async fn publish(&self, mut message: RelayMessage) -> Result<()> {
        self.ensure_open()?;
        message.cluster_id = self.hub.cluster_id.clone();

        match self.hub.sender.send(Arc::new(message)) {
            Ok(receivers) => debug!(receivers, "Published relay message"),
            Err(_) => debug!("No subscribers for relay message"),
        }
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.ensure_open()?;
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Ok(());
        }

        let mut receiver = self.hub.sender.subscribe();
        let server_name = self.server_name.clone();
        let cluster_id = self.hub.cluster_id.clone();

        *consumer = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if message.cluster_id != cluster_id || message.source == server_name {
                            continue;
                        }
                        handler.handle(message.as_ref().clone()).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Relay consumer lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Relay channel closed, stopping consumer");
                        break;
                    }
                }
            }
        }));

        info!(server = %self.server_name, "Channel relay consumer started");
        Ok(())
    }

    async fn set_user_data(&self, user: Uuid, snapshot: &Snapshot, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let bytes = self.adapter.to_bytes(snapshot)?;
        self.put(self.hub.keys.user_data(user), bytes, ttl).await;
        debug!(user = %user, version = %snapshot.version_id(), "Stored hand-off");
        Ok(())
    }

    async fn take_user_data(&self, user: Uuid) -> Result<Option<Snapshot>> {
        self.ensure_open()?;
        let bytes = self
            .hub
            .state
            .lock()
            .await
            .take(&self.hub.keys.user_data(user));
        match bytes {
            Some(bytes) => Ok(Some(self.adapter.from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_server_switch(&self, user: Uuid, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        self.put(self.hub.keys.server_switch(user), vec![1], ttl).await;
        Ok(())
    }

    async fn take_server_switch(&self, user: Uuid) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock().await;
        Ok(state.take(&self.hub.keys.server_switch(user)).is_some())
    }

    async fn get_checked_out(&self, user: Uuid) -> Result<CheckoutState> {
        self.ensure_open()?;
        let state = self.hub.state.lock().await;
        Ok(match state.checkouts.get(&user) {
            Some(server) => CheckoutState::Claimed(server.clone()),
            None => CheckoutState::Unclaimed,
        })
    }

    async fn try_check_out(&self, user: Uuid) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock().await;
        if state.checkouts.contains_key(&user) {
            return Ok(false);
        }
        state.checkouts.insert(user, self.server_name.clone());
        Ok(true)
    }

    async fn set_checked_out(&self, user: Uuid, checked_out: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock().await;
        if checked_out {
            state.checkouts.insert(user, self.server_name.clone());
        } else {
            state.checkouts.remove(&user);
        }
        Ok(())
    }

    async fn release_checkout(&self, user: Uuid) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock().await;
        if state.checkouts.get(&user) == Some(&self.server_name) {
            state.checkouts.remove(&user);
            return Ok(true);
        }
        Ok(false)
    }

    async fn clear_checked_out_for_server(&self, server: &str) -> Result<Vec<Uuid>> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock().await;
        let released: Vec<Uuid> = state
            .checkouts
            .iter()
            .filter(|(_, owner)| owner.as_str() == server)
            .map(|(user, _)| *user)
            .collect();
        for user in &released {
            state.checkouts.remove(user);
        }
        Ok(released)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.abort();
        }
        info!(server = %self.server_name, "Channel relay closed");
        Ok(())
    }
}
