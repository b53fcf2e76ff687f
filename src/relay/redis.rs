//! Redis relay.
//!
//! Hand-offs and server-switch markers are keys with a TTL read through
//! `GETDEL`. Checkout flags are plain keys holding the owning server's name;
//! each server also keeps a claim set so a crashed server's flags can be
//! swept without a keyspace scan. Broadcasts go over Redis pub/sub.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{CheckoutState, Keys, MessageHandler, Relay, RelayMessage, Result};
use crate::adapter::DataAdapter;
use crate::snapshot::Snapshot;

/// Claim the flag and record it in the server's claim set.
const TRY_CHECK_OUT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
    redis.call('SADD', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

/// Delete the flag only if `ARGV[1]` holds it.
const RELEASE_CHECKOUT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    redis.call('SREM', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

/// Redis-backed relay.
pub struct RedisRelay {
    client: Client,
    conn: ConnectionManager,
    keys: Keys,
    cluster_id: String,
    server_name: String,
    adapter: Arc<dyn DataAdapter>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl RedisRelay {
    /// Create a new Redis relay.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `cluster_id` - Namespace for keys and the broadcast channel
    /// * `server_name` - Name of this process within the cluster
    pub async fn new(
        url: &str,
        cluster_id: &str,
        server_name: &str,
        adapter: Arc<dyn DataAdapter>,
    ) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!(url = %url, cluster = %cluster_id, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            keys: Keys::new(cluster_id),
            cluster_id: cluster_id.to_string(),
            server_name: server_name.to_string(),
            adapter,
            consumer: Mutex::new(None),
        })
    }

    async fn release_for(&self, user: Uuid, server: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i32 = Script::new(RELEASE_CHECKOUT)
            .key(self.keys.checkout(user))
            .key(self.keys.server_claims(server))
            .arg(server)
            .arg(user.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}

#[async_trait]
impl Relay for RedisRelay {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    #[tracing::instrument(name = "relay.publish", skip_all, fields(kind = ?message.kind))]
    async fn publish(&self, mut message: RelayMessage) -> Result<()> {
        message.cluster_id = self.cluster_id.clone();
        let bytes = message.encode()?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(self.keys.channel(), bytes).await?;
        debug!(receivers, "Published relay message");
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Ok(());
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.keys.channel()).await?;

        let server_name = self.server_name.clone();
        let cluster_id = self.cluster_id.clone();

        *consumer = Some(tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Unreadable relay payload");
                        continue;
                    }
                };
                let message = match RelayMessage::decode(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Malformed relay message");
                        continue;
                    }
                };
                if message.cluster_id != cluster_id || message.source == server_name {
                    continue;
                }
                handler.handle(message).await;
            }
            error!("Redis pub/sub stream ended, stopping consumer");
        }));

        info!(server = %self.server_name, "Redis relay consumer started");
        Ok(())
    }

    async fn set_user_data(&self, user: Uuid, snapshot: &Snapshot, ttl: Duration) -> Result<()> {
        let bytes = self.adapter.to_bytes(snapshot)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.keys.user_data(user), bytes, ttl.as_secs().max(1))
            .await?;
        debug!(user = %user, version = %snapshot.version_id(), "Stored hand-off in Redis");
        Ok(())
    }

    async fn take_user_data(&self, user: Uuid) -> Result<Option<Snapshot>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = redis::cmd("GETDEL")
            .arg(self.keys.user_data(user))
            .query_async(&mut conn)
            .await?;
        match bytes {
            Some(bytes) => Ok(Some(self.adapter.from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_server_switch(&self, user: Uuid, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.keys.server_switch(user), 1, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn take_server_switch(&self, user: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let marker: Option<String> = redis::cmd("GETDEL")
            .arg(self.keys.server_switch(user))
            .query_async(&mut conn)
            .await?;
        Ok(marker.is_some())
    }

    async fn get_checked_out(&self, user: Uuid) -> Result<CheckoutState> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = conn.get(self.keys.checkout(user)).await?;
        Ok(match owner {
            Some(server) => CheckoutState::Claimed(server),
            None => CheckoutState::Unclaimed,
        })
    }

    async fn try_check_out(&self, user: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let claimed: i32 = Script::new(TRY_CHECK_OUT)
            .key(self.keys.checkout(user))
            .key(self.keys.server_claims(&self.server_name))
            .arg(&self.server_name)
            .arg(user.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed == 1)
    }

    async fn set_checked_out(&self, user: Uuid, checked_out: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.checkout(user);
        if checked_out {
            let _: () = conn.set(&key, &self.server_name).await?;
            let _: () = conn
                .sadd(self.keys.server_claims(&self.server_name), user.to_string())
                .await?;
            return Ok(());
        }

        let owner: Option<String> = conn.get(&key).await?;
        let _: () = conn.del(&key).await?;
        if let Some(owner) = owner {
            let _: () = conn
                .srem(self.keys.server_claims(&owner), user.to_string())
                .await?;
        }
        Ok(())
    }

    async fn release_checkout(&self, user: Uuid) -> Result<bool> {
        self.release_for(user, &self.server_name).await
    }

    async fn clear_checked_out_for_server(&self, server: &str) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let claims_key = self.keys.server_claims(server);
        let members: Vec<String> = conn.smembers(&claims_key).await?;

        let mut released = Vec::with_capacity(members.len());
        for member in members {
            let Ok(user) = Uuid::parse_str(&member) else {
                warn!(member = %member, "Ignoring malformed claim");
                continue;
            };
            if self.release_for(user, server).await? {
                released.push(user);
            }
        }
        let _: () = conn.del(&claims_key).await?;

        info!(server = %server, released = released.len(), "Cleared checkout flags");
        Ok(released)
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.abort();
        }
        info!(server = %self.server_name, "Redis relay closed");
        Ok(())
    }
}
