//! In-memory snapshot store.
//!
//! Used by tests and by single-process deployments that only need the relay
//! for hand-off. Failure flags let tests simulate an unreachable store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Result, Retention, SnapshotStore, StorageError};
use crate::snapshot::{Snapshot, User};


/// Snapshot with its insertion sequence, used to break timestamp ties.
struct StoredSnapshot {
    seq: u64,
    snapshot: Snapshot,
}

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    snapshots: HashMap<Uuid, Vec<StoredSnapshot>>,
    next_seq: u64,
    writes: usize,
}

impl Inner {
    fn has_user(&self, uuid: Uuid) -> bool {
        self.users.iter().any(|u| u.uuid == uuid)
    }

    /// Newest first.
    fn sorted(&self, user: Uuid) -> Vec<Snapshot> {
        let mut entries: Vec<&StoredSnapshot> = self
            .snapshots
            .get(&user)
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            b.snapshot
                .timestamp()
                .cmp(&a.snapshot.timestamp())
                .then(b.seq.cmp(&a.seq))
        });
        entries.into_iter().map(|e| e.snapshot.clone()).collect()
    }
}

/// Mock snapshot store that keeps every user's history in memory.
#[derive(Default)]
pub struct MockSnapshotStore {
    inner: RwLock<Inner>,
    retention: Retention,
    fail_on_add: RwLock<bool>,
    fail_on_get: RwLock<bool>,
}

impl MockSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Retention) -> Self {
        Self {
            retention,
            ..Self::default()
        }
    }

    pub async fn set_fail_on_add(&self, fail: bool) {
        *self.fail_on_add.write().await = fail;
    }

    pub async fn set_fail_on_get(&self, fail: bool) {
        *self.fail_on_get.write().await = fail;
    }

    /// Number of successful `add_snapshot` calls.
    pub async fn write_count(&self) -> usize {
        self.inner.read().await.writes
    }

    async fn check_get(&self) -> Result<()> {
        if *self.fail_on_get.read().await {
            return Err(StorageError::Unavailable("mock store read failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MockSnapshotStore {
    async fn ensure_user(&self, user: &User) -> Result<()> {
        if *self.fail_on_add.read().await {
            return Err(StorageError::Unavailable("mock store write failure".into()));
        }
        let mut inner = self.inner.write().await;
        match inner.users.iter_mut().find(|u| u.uuid == user.uuid) {
            Some(existing) => existing.username = user.username.clone(),
            None => inner.users.push(user.clone()),
        }
        Ok(())
    }

    async fn get_user(&self, uuid: Uuid) -> Result<Option<User>> {
        self.check_get().await?;
        let inner = self.inner.read().await;
        Ok(inner.users.iter().find(|u| u.uuid == uuid).cloned())
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        self.check_get().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .iter()
            .rev()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn get_all_users(&self) -> Result<Vec<User>> {
        self.check_get().await?;
        Ok(self.inner.read().await.users.clone())
    }

    async fn add_snapshot(&self, user: Uuid, snapshot: &Snapshot) -> Result<()> {
        if *self.fail_on_add.read().await {
            return Err(StorageError::Unavailable("mock store write failure".into()));
        }
        let mut inner = self.inner.write().await;
        if !inner.has_user(user) {
            return Err(StorageError::UnknownUser(user));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.writes += 1;

        let history = inner.snapshots.entry(user).or_default();

        if let Some(cutoff) = self.retention.rotation_cutoff(snapshot) {
            let newest_in_window = history
                .iter()
                .filter(|e| !e.snapshot.is_pinned() && e.snapshot.timestamp() > cutoff)
                .max_by(|a, b| {
                    a.snapshot
                        .timestamp()
                        .cmp(&b.snapshot.timestamp())
                        .then(a.seq.cmp(&b.seq))
                })
                .map(|e| e.seq);
            if let Some(rotated) = newest_in_window {
                history.retain(|e| e.seq != rotated);
            }
        }

        history.push(StoredSnapshot {
            seq,
            snapshot: snapshot.clone(),
        });

        // Drop the oldest unpinned entries beyond the limit.
        let mut unpinned: Vec<(chrono::DateTime<chrono::Utc>, u64)> = history
            .iter()
            .filter(|e| !e.snapshot.is_pinned())
            .map(|e| (e.snapshot.timestamp(), e.seq))
            .collect();
        unpinned.sort_by(|a, b| b.cmp(a));
        let doomed: Vec<u64> = unpinned
            .into_iter()
            .skip(self.retention.max_snapshots)
            .map(|(_, seq)| seq)
            .collect();
        history.retain(|e| !doomed.contains(&e.seq));

        Ok(())
    }

    async fn get_latest_snapshot(&self, user: Uuid) -> Result<Option<Snapshot>> {
        self.check_get().await?;
        Ok(self.inner.read().await.sorted(user).into_iter().next())
    }

    async fn get_snapshot_history(&self, user: Uuid) -> Result<Vec<Snapshot>> {
        self.check_get().await?;
        Ok(self.inner.read().await.sorted(user))
    }

    async fn get_snapshot(&self, user: Uuid, version_id: Uuid) -> Result<Option<Snapshot>> {
        self.check_get().await?;
        let inner = self.inner.read().await;
        Ok(inner.snapshots.get(&user).and_then(|history| {
            history
                .iter()
                .find(|e| e.snapshot.version_id() == version_id)
                .map(|e| e.snapshot.clone())
        }))
    }

    async fn delete_snapshot(&self, user: Uuid, version_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(history) = inner.snapshots.get_mut(&user) else {
            return Ok(false);
        };
        let before = history.len();
        history.retain(|e| e.snapshot.version_id() != version_id);
        Ok(history.len() < before)
    }

    async fn set_pinned(&self, user: Uuid, version_id: Uuid, pinned: bool) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(history) = inner.snapshots.get_mut(&user) else {
            return Ok(false);
        };
        match history
            .iter_mut()
            .find(|e| e.snapshot.version_id() == version_id)
        {
            Some(entry) => {
                entry.snapshot = entry.snapshot.clone().with_pinned(pinned);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
