//! SnapshotStore interface tests.
//!
//! These tests verify the contract of the SnapshotStore trait.
//! Each storage implementation should run these tests with a retention
//! limit of `CONTRACT_MAX_SNAPSHOTS`.

use chrono::{Duration, TimeZone, Utc};
use uuid::Uuid;

use handoff::snapshot::{Payload, SaveCause, Snapshot, User};
use handoff::storage::SnapshotStore;

use super::CONTRACT_MAX_SNAPSHOTS;

/// Create a snapshot taken `minutes` after a fixed epoch.
pub fn make_snapshot(owner: Uuid, minutes: i64) -> Snapshot {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    Snapshot::builder(owner, Payload::new(1, vec![10, 20, minutes as u8]))
        .save_cause(SaveCause::Disconnect)
        .server_name("contract")
        .timestamp(base + Duration::minutes(minutes))
        .build()
}

async fn new_user<S: SnapshotStore>(store: &S, name: &str) -> User {
    let user = User::new(Uuid::new_v4(), name);
    store.ensure_user(&user).await.expect("ensure_user should succeed");
    user
}

// =============================================================================
// Users
// =============================================================================

pub async fn test_ensure_user_and_lookup<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "Contract_Steve").await;

    let by_uuid = store.get_user(user.uuid).await.expect("get_user should succeed");
    assert_eq!(by_uuid, Some(user.clone()));

    let by_name = store
        .get_user_by_name("contract_steve")
        .await
        .expect("get_user_by_name should succeed");
    assert_eq!(by_name, Some(user.clone()), "username lookup ignores case");

    let all = store.get_all_users().await.expect("get_all_users should succeed");
    assert!(all.contains(&user));

    assert_eq!(store.get_user(Uuid::new_v4()).await.unwrap(), None);
}

pub async fn test_ensure_user_refreshes_username<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "contract_old").await;
    let renamed = User::new(user.uuid, "contract_new");
    store.ensure_user(&renamed).await.expect("ensure_user should succeed");

    assert_eq!(store.get_user(user.uuid).await.unwrap(), Some(renamed));
    assert_eq!(store.get_user_by_name("contract_old").await.unwrap(), None);
}

// =============================================================================
// Snapshots
// =============================================================================

pub async fn test_latest_absent_for_new_user<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "contract_empty").await;
    assert_eq!(store.get_latest_snapshot(user.uuid).await.unwrap(), None);
    assert!(store.get_snapshot_history(user.uuid).await.unwrap().is_empty());
}

pub async fn test_add_snapshot_preserves_data<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "contract_roundtrip").await;
    let snapshot = Snapshot::builder(user.uuid, Payload::new(7, vec![0, 1, 2, 255]))
        .save_cause(SaveCause::Other("CUSTOM_PLUGIN".into()))
        .server_name("survival-1")
        .build();
    store.add_snapshot(user.uuid, &snapshot).await.expect("add should succeed");

    let latest = store
        .get_latest_snapshot(user.uuid)
        .await
        .unwrap()
        .expect("snapshot should exist");
    assert_eq!(latest.version_id(), snapshot.version_id());
    assert_eq!(latest.payload(), snapshot.payload());
    assert_eq!(latest.save_cause(), snapshot.save_cause());
    assert_eq!(latest.server_name(), "survival-1");
    assert_eq!(
        latest.timestamp().timestamp_millis(),
        snapshot.timestamp().timestamp_millis()
    );
}

pub async fn test_history_newest_first<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "contract_order").await;
    for minutes in [2, 0, 1] {
        store
            .add_snapshot(user.uuid, &make_snapshot(user.uuid, minutes))
            .await
            .unwrap();
    }

    let history = store.get_snapshot_history(user.uuid).await.unwrap();
    let bytes: Vec<u8> = history.iter().map(|s| s.payload().data[2]).collect();
    assert_eq!(bytes, vec![2, 1, 0]);
}

pub async fn test_pruning_keeps_newest<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "contract_prune").await;
    let writes = CONTRACT_MAX_SNAPSHOTS as i64 + 3;
    let mut last = None;
    for minutes in 0..writes {
        let snapshot = make_snapshot(user.uuid, minutes);
        store.add_snapshot(user.uuid, &snapshot).await.unwrap();
        last = Some(snapshot);
    }

    let history = store.get_snapshot_history(user.uuid).await.unwrap();
    assert_eq!(history.len(), CONTRACT_MAX_SNAPSHOTS);
    let newest = last.unwrap();
    assert_eq!(history[0].version_id(), newest.version_id());
    assert_eq!(
        store.get_latest_snapshot(user.uuid).await.unwrap().map(|s| s.version_id()),
        Some(newest.version_id())
    );
}

pub async fn test_pinned_snapshots_survive_pruning<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "contract_pin").await;
    let keep = make_snapshot(user.uuid, 0);
    store.add_snapshot(user.uuid, &keep).await.unwrap();
    assert!(store
        .set_pinned(user.uuid, keep.version_id(), true)
        .await
        .unwrap());

    for minutes in 1..=(CONTRACT_MAX_SNAPSHOTS as i64 + 2) {
        store
            .add_snapshot(user.uuid, &make_snapshot(user.uuid, minutes))
            .await
            .unwrap();
    }

    let kept = store
        .get_snapshot(user.uuid, keep.version_id())
        .await
        .unwrap()
        .expect("pinned snapshot should survive");
    assert!(kept.is_pinned());
    assert_eq!(kept.payload(), keep.payload());

    let history = store.get_snapshot_history(user.uuid).await.unwrap();
    assert_eq!(history.len(), CONTRACT_MAX_SNAPSHOTS + 1);
}

pub async fn test_get_and_delete_snapshot<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "contract_delete").await;
    let older = make_snapshot(user.uuid, 0);
    let newer = make_snapshot(user.uuid, 1);
    store.add_snapshot(user.uuid, &older).await.unwrap();
    store.add_snapshot(user.uuid, &newer).await.unwrap();

    assert!(store
        .get_snapshot(user.uuid, older.version_id())
        .await
        .unwrap()
        .is_some());
    assert!(store.delete_snapshot(user.uuid, newer.version_id()).await.unwrap());
    assert!(!store.delete_snapshot(user.uuid, newer.version_id()).await.unwrap());

    let latest = store.get_latest_snapshot(user.uuid).await.unwrap().unwrap();
    assert_eq!(latest.version_id(), older.version_id());
}

pub async fn test_unknown_version_and_user<S: SnapshotStore>(store: &S) {
    let user = new_user(store, "contract_unknown").await;
    assert!(store
        .get_snapshot(user.uuid, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
    assert!(!store
        .set_pinned(user.uuid, Uuid::new_v4(), true)
        .await
        .unwrap());

    let stranger = Uuid::new_v4();
    assert!(store
        .add_snapshot(stranger, &make_snapshot(stranger, 0))
        .await
        .is_err());
    assert!(!store.delete_snapshot(stranger, Uuid::new_v4()).await.unwrap());
}

pub async fn test_user_isolation<S: SnapshotStore>(store: &S) {
    let first = new_user(store, "contract_first").await;
    let second = new_user(store, "contract_second").await;
    store
        .add_snapshot(first.uuid, &make_snapshot(first.uuid, 0))
        .await
        .unwrap();

    assert_eq!(store.get_latest_snapshot(second.uuid).await.unwrap(), None);
    let theirs = store.get_latest_snapshot(first.uuid).await.unwrap().unwrap();
    assert!(store
        .get_snapshot(second.uuid, theirs.version_id())
        .await
        .unwrap()
        .is_none());
}

/// Run all SnapshotStore contract tests.
#[macro_export]
macro_rules! run_snapshot_store_tests {
    ($store:expr) => {{
        use $crate::storage::snapshot_store_tests::*;

        // users
        test_ensure_user_and_lookup($store).await;
        println!("  test_ensure_user_and_lookup: PASSED");

        test_ensure_user_refreshes_username($store).await;
        println!("  test_ensure_user_refreshes_username: PASSED");

        // snapshots
        test_latest_absent_for_new_user($store).await;
        println!("  test_latest_absent_for_new_user: PASSED");

        test_add_snapshot_preserves_data($store).await;
        println!("  test_add_snapshot_preserves_data: PASSED");

        test_history_newest_first($store).await;
        println!("  test_history_newest_first: PASSED");

        // retention
        test_pruning_keeps_newest($store).await;
        println!("  test_pruning_keeps_newest: PASSED");

        test_pinned_snapshots_survive_pruning($store).await;
        println!("  test_pinned_snapshots_survive_pruning: PASSED");

        // lookups
        test_get_and_delete_snapshot($store).await;
        println!("  test_get_and_delete_snapshot: PASSED");

        test_unknown_version_and_user($store).await;
        println!("  test_unknown_version_and_user: PASSED");

        test_user_isolation($store).await;
        println!("  test_user_isolation: PASSED");
    }};
}
