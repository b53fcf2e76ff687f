use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::adapter::JsonAdapter;
use crate::config::{Config, SyncMode};
use crate::relay::{ChannelHub, ChannelRelay, Relay};
use crate::session::provider::{self, ProviderError};
use crate::storage::{MockSnapshotStore, SnapshotStore};
use crate::sync::create_syncer;
use crate::sync::test_support::context;

/// Live session state kept in memory.
struct TestProvider {
    live: RwLock<HashMap<Uuid, Payload>>,
    applied: RwLock<Vec<(Uuid, UpdateCause)>>,
    max_format: u32,
    fail_export: AtomicBool,
}

impl TestProvider {
    fn new() -> Arc<Self> {
        Self::with_max_format(1)
    }

    fn with_max_format(max_format: u32) -> Arc<Self> {
        Arc::new(Self {
            live: RwLock::new(HashMap::new()),
            applied: RwLock::new(Vec::new()),
            max_format,
            fail_export: AtomicBool::new(false),
        })
    }

    async fn set(&self, user: Uuid, data: &[u8]) {
        self.live
            .write()
            .await
            .insert(user, Payload::new(1, data.to_vec()));
    }

    async fn get(&self, user: Uuid) -> Option<Vec<u8>> {
        self.live.read().await.get(&user).map(|p| p.data.clone())
    }

    async fn causes(&self, user: Uuid) -> Vec<UpdateCause> {
        self.applied
            .read()
            .await
            .iter()
            .filter(|(u, _)| *u == user)
            .map(|(_, c)| *c)
            .collect()
    }
}

#[async_trait]
impl PlatformDataProvider for TestProvider {
    async fn export(&self, user: &User) -> provider::Result<Payload> {
        if self.fail_export.load(Ordering::SeqCst) {
            return Err(ProviderError::Export {
                user: user.username.clone(),
                reason: "simulated".to_string(),
            });
        }
        Ok(self
            .live
            .read()
            .await
            .get(&user.uuid)
            .cloned()
            .unwrap_or_else(|| Payload::new(1, Vec::new())))
    }

    async fn apply(
        &self,
        user: &User,
        snapshot: &Snapshot,
        cause: UpdateCause,
    ) -> provider::Result<()> {
        self.live
            .write()
            .await
            .insert(user.uuid, snapshot.payload().clone());
        self.applied.write().await.push((user.uuid, cause));
        Ok(())
    }

    fn supports_format(&self, format_version: u32) -> bool {
        format_version <= self.max_format
    }
}

struct Veto;

#[async_trait]
impl SaveHook for Veto {
    async fn before_save(&self, _user: &User, _snapshot: &Snapshot) -> bool {
        false
    }
}

fn orchestrator(
    name: &str,
    store: &Arc<MockSnapshotStore>,
    hub: &ChannelHub,
    provider: Arc<TestProvider>,
    configure: impl FnOnce(&mut Config),
) -> Arc<SessionOrchestrator> {
    let mut ctx = context(name, SyncMode::Lockstep, store.clone(), hub);
    let mut config = (*ctx.config).clone();
    configure(&mut config);
    ctx.config = Arc::new(config);
    let syncer = create_syncer(ctx.clone());
    SessionOrchestrator::new(ctx, syncer, provider)
}

fn observer(hub: &ChannelHub) -> ChannelRelay {
    ChannelRelay::new(hub.clone(), "observer", Arc::new(JsonAdapter))
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn steve() -> User {
    User::new(Uuid::new_v4(), "Steve")
}

#[tokio::test]
async fn test_new_user_synthesizes_blank_snapshot() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let provider = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, provider.clone(), |_| {});
    let user = steve();

    let outcome = alpha.handle_join(user.clone()).await;
    assert_eq!(outcome, JoinOutcome::NewUser { persisted: true });
    assert!(!alpha.is_locked(user.uuid).await);
    assert_eq!(provider.causes(user.uuid).await, vec![UpdateCause::NewUser]);

    let latest = store.get_latest_snapshot(user.uuid).await.unwrap().unwrap();
    assert_eq!(latest.save_cause(), &SaveCause::NewUser);
    assert_eq!(latest.server_name(), "alpha");
}

#[tokio::test]
async fn test_explicit_absence_persists_nothing() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let provider = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, provider.clone(), |c| {
        c.sync.new_user_policy = NewUserPolicy::ExplicitAbsence;
    });
    let user = steve();

    let outcome = alpha.handle_join(user.clone()).await;
    assert_eq!(outcome, JoinOutcome::NewUser { persisted: false });
    assert!(!alpha.should_cancel_event(user.uuid).await);
    assert_eq!(store.write_count().await, 0);
    assert!(provider.causes(user.uuid).await.is_empty());
}

#[tokio::test]
async fn test_quit_then_join_elsewhere_restores_state() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let (on_alpha, on_beta) = (TestProvider::new(), TestProvider::new());
    let alpha = orchestrator("alpha", &store, &hub, on_alpha.clone(), |_| {});
    let beta = orchestrator("beta", &store, &hub, on_beta.clone(), |_| {});
    let user = steve();

    alpha.handle_join(user.clone()).await;
    on_alpha.set(user.uuid, b"diamonds").await;
    alpha.handle_quit(&user).await.unwrap();

    let outcome = beta.handle_join(user.clone()).await;
    assert!(matches!(outcome, JoinOutcome::Synchronized { source: "relay", .. }));
    assert_eq!(on_beta.get(user.uuid).await, Some(b"diamonds".to_vec()));
    assert_eq!(on_beta.causes(user.uuid).await, vec![UpdateCause::Synchronized]);

    let latest = store.get_latest_snapshot(user.uuid).await.unwrap().unwrap();
    assert_eq!(latest.save_cause(), &SaveCause::Disconnect);
    assert_eq!(latest.payload().data, b"diamonds");
}

#[tokio::test]
async fn test_unsupported_format_keeps_user_locked() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let alpha = orchestrator("alpha", &store, &hub, TestProvider::with_max_format(1), |_| {});
    let user = steve();

    store.ensure_user(&user).await.unwrap();
    let future = Snapshot::builder(user.uuid, Payload::new(2, b"future".to_vec())).build();
    store.add_snapshot(user.uuid, &future).await.unwrap();

    let outcome = alpha.handle_join(user.clone()).await;
    assert!(matches!(outcome, JoinOutcome::Incomplete(reason) if reason.contains("2")));
    assert!(alpha.should_cancel_event(user.uuid).await);

    alpha.handle_quit(&user).await.unwrap();
    assert_eq!(store.write_count().await, 1);
    assert_eq!(
        observer(&hub).get_checked_out(user.uuid).await.unwrap(),
        CheckoutState::Unclaimed
    );
}

#[tokio::test]
async fn test_save_hook_veto_skips_quit_save_but_releases_claim() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let alpha = orchestrator("alpha", &store, &hub, TestProvider::new(), |c| {
        c.sync.new_user_policy = NewUserPolicy::ExplicitAbsence;
    });
    alpha.add_save_hook(Arc::new(Veto)).await;
    let user = steve();

    alpha.handle_join(user.clone()).await;
    alpha.handle_quit(&user).await.unwrap();

    assert_eq!(store.write_count().await, 0);
    assert_eq!(
        observer(&hub).get_checked_out(user.uuid).await.unwrap(),
        CheckoutState::Unclaimed
    );
}

#[tokio::test]
async fn test_export_failure_on_quit_surfaces_and_releases() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let provider = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, provider.clone(), |_| {});
    let user = steve();

    alpha.handle_join(user.clone()).await;
    let writes = store.write_count().await;
    provider.fail_export.store(true, Ordering::SeqCst);

    let err = alpha.handle_quit(&user).await.unwrap_err();
    assert!(matches!(err, SyncError::Serialization(_)));
    assert_eq!(store.write_count().await, writes);
    assert_eq!(
        observer(&hub).get_checked_out(user.uuid).await.unwrap(),
        CheckoutState::Unclaimed
    );
}

#[tokio::test]
async fn test_world_save_checkpoints_without_touching_checkout() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let provider = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, provider.clone(), |_| {});
    let user = steve();

    alpha.handle_join(user.clone()).await;
    provider.set(user.uuid, b"checkpoint").await;

    assert_eq!(alpha.handle_world_save(&[user.clone()]).await, 1);
    let latest = store.get_latest_snapshot(user.uuid).await.unwrap().unwrap();
    assert_eq!(latest.save_cause(), &SaveCause::WorldSave);
    assert_eq!(
        observer(&hub).get_checked_out(user.uuid).await.unwrap(),
        CheckoutState::Claimed("alpha".into())
    );

    assert!(alpha.handle_death(&user).await.unwrap());
    let latest = store.get_latest_snapshot(user.uuid).await.unwrap().unwrap();
    assert_eq!(latest.save_cause(), &SaveCause::Death);
}

#[tokio::test]
async fn test_world_save_disabled_and_offline_users_skipped() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let alpha = orchestrator("alpha", &store, &hub, TestProvider::new(), |c| {
        c.sync.save_on_world_save = false;
    });
    let user = steve();

    alpha.handle_join(user.clone()).await;
    let writes = store.write_count().await;
    assert_eq!(alpha.handle_world_save(&[user.clone()]).await, 0);
    assert!(!alpha.handle_death(&steve()).await.unwrap());
    assert_eq!(store.write_count().await, writes);
}

#[tokio::test(start_paused = true)]
async fn test_quit_during_pending_join_cancels_it() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let alpha = orchestrator("alpha", &store, &hub, TestProvider::new(), |_| {});
    let beta = orchestrator("beta", &store, &hub, TestProvider::new(), |_| {});
    let user = steve();

    alpha.handle_join(user.clone()).await;

    let joining = beta.clone();
    let joiner = user.clone();
    let join = tokio::spawn(async move { joining.handle_join(joiner).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(beta.is_locked(user.uuid).await);

    beta.handle_quit(&user).await.unwrap();
    assert_eq!(join.await.unwrap(), JoinOutcome::Cancelled);
    assert!(!beta.is_locked(user.uuid).await);
    assert_eq!(
        observer(&hub).get_checked_out(user.uuid).await.unwrap(),
        CheckoutState::Claimed("alpha".into())
    );
}

#[tokio::test]
async fn test_shutdown_flushes_and_releases() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let provider = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, provider.clone(), |_| {});
    let user = steve();

    alpha.startup().await.unwrap();
    alpha.handle_join(user.clone()).await;
    provider.set(user.uuid, b"final").await;

    alpha.shutdown().await.unwrap();

    let latest = store.get_latest_snapshot(user.uuid).await.unwrap().unwrap();
    assert_eq!(latest.save_cause(), &SaveCause::ServerShutdown);
    assert_eq!(latest.payload().data, b"final");
    assert_eq!(
        observer(&hub).get_checked_out(user.uuid).await.unwrap(),
        CheckoutState::Unclaimed
    );
    assert!(alpha.online_users().await.is_empty());
    assert!(alpha.should_cancel_event(user.uuid).await);
    assert!(matches!(
        alpha.handle_join(user).await,
        JoinOutcome::Incomplete(_)
    ));
}

#[tokio::test]
async fn test_handshake_tracks_peers() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let alpha = orchestrator("alpha", &store, &hub, TestProvider::new(), |_| {});
    let beta = orchestrator("beta", &store, &hub, TestProvider::new(), |_| {});

    alpha.startup().await.unwrap();
    beta.startup().await.unwrap();

    eventually(|| {
        let (alpha, beta) = (alpha.clone(), beta.clone());
        async move { alpha.peers().await == ["beta"] && beta.peers().await == ["alpha"] }
    })
    .await;

    beta.shutdown().await.unwrap();
    eventually(|| {
        let alpha = alpha.clone();
        async move { alpha.peers().await.is_empty() }
    })
    .await;
}

#[tokio::test]
async fn test_request_current_data_asks_owner() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let on_alpha = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, on_alpha.clone(), |_| {});
    let beta = orchestrator("beta", &store, &hub, TestProvider::new(), |_| {});
    let user = steve();

    alpha.startup().await.unwrap();
    beta.startup().await.unwrap();
    alpha.handle_join(user.clone()).await;
    on_alpha.set(user.uuid, b"live").await;

    let current = beta.request_current_data(&user).await.unwrap().unwrap();
    assert_eq!(current.payload().data, b"live");
    assert_eq!(current.server_name(), "alpha");

    let local = alpha.request_current_data(&user).await.unwrap().unwrap();
    assert_eq!(local.payload().data, b"live");
}

#[tokio::test]
async fn test_request_current_data_falls_back_to_store() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let alpha = orchestrator("alpha", &store, &hub, TestProvider::new(), |_| {});
    let user = steve();

    assert_eq!(alpha.request_current_data(&user).await.unwrap(), None);

    store.ensure_user(&user).await.unwrap();
    let stored = Snapshot::builder(user.uuid, Payload::new(1, b"stored".to_vec())).build();
    store.add_snapshot(user.uuid, &stored).await.unwrap();
    assert_eq!(alpha.request_current_data(&user).await.unwrap(), Some(stored));
}

#[tokio::test]
async fn test_update_user_data_reaches_owner() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let on_alpha = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, on_alpha.clone(), |_| {});
    let beta = orchestrator("beta", &store, &hub, TestProvider::new(), |_| {});
    let user = steve();

    alpha.startup().await.unwrap();
    beta.startup().await.unwrap();
    alpha.handle_join(user.clone()).await;

    let written = beta
        .update_user_data(&user, Payload::new(1, b"granted".to_vec()))
        .await
        .unwrap();
    assert_eq!(
        store.get_latest_snapshot(user.uuid).await.unwrap(),
        Some(written)
    );

    eventually(|| {
        let on_alpha = on_alpha.clone();
        let uuid = user.uuid;
        async move { on_alpha.get(uuid).await == Some(b"granted".to_vec()) }
    })
    .await;
    assert!(on_alpha.causes(user.uuid).await.contains(&UpdateCause::Updated));
}

#[tokio::test]
async fn test_update_user_data_replaces_pending_handoff() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let on_alpha = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, on_alpha.clone(), |_| {});
    let on_beta = TestProvider::new();
    let beta = orchestrator("beta", &store, &hub, on_beta.clone(), |_| {});
    let user = steve();

    alpha.handle_join(user.clone()).await;
    on_alpha.set(user.uuid, b"old").await;
    alpha.handle_quit(&user).await.unwrap();

    alpha
        .update_user_data(&user, Payload::new(1, b"new".to_vec()))
        .await
        .unwrap();

    beta.handle_join(user.clone()).await;
    assert_eq!(on_beta.get(user.uuid).await, Some(b"new".to_vec()));
}

#[tokio::test]
async fn test_update_user_data_vetoed() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let alpha = orchestrator("alpha", &store, &hub, TestProvider::new(), |_| {});
    alpha.add_save_hook(Arc::new(Veto)).await;

    let err = alpha
        .update_user_data(&steve(), Payload::new(1, b"nope".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(store.write_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_autosave_checkpoints_online_users() {
    let store = Arc::new(MockSnapshotStore::new());
    let hub = ChannelHub::new("test");
    let provider = TestProvider::new();
    let alpha = orchestrator("alpha", &store, &hub, provider.clone(), |c| {
        c.sync.autosave_interval_secs = 1;
    });
    let user = steve();

    alpha.startup().await.unwrap();
    alpha.handle_join(user.clone()).await;
    provider.set(user.uuid, b"tick").await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let history = store.get_snapshot_history(user.uuid).await.unwrap();
    assert!(history
        .iter()
        .any(|s| s.save_cause() == &SaveCause::Scheduled && s.payload().data == b"tick"));
}
