//! SQLite implementation of the durable snapshot store.

use async_trait::async_trait;
use sea_query::{Expr, Func, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::snapshot::{Payload, SaveCause, Snapshot, User};

use super::schema::{decode_timestamp, encode_timestamp, Snapshots, TableNames, Users};
use super::{Result, Retention, SnapshotStore, StorageError};

/// SQLite implementation of SnapshotStore.
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
    tables: TableNames,
    retention: Retention,
}

impl SqliteSnapshotStore {
    /// Create a new SQLite snapshot store.
    pub fn new(pool: SqlitePool, cluster_id: &str, retention: Retention) -> Self {
        Self {
            pool,
            tables: TableNames::for_cluster(cluster_id),
            retention,
        }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        for statement in self.tables.sqlite_schema() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn user_id(&self, conn: &mut SqliteConnection, uuid: Uuid) -> Result<Option<i64>> {
        let query = Query::select()
            .column(Users::Id)
            .from(self.tables.users_table())
            .and_where(Expr::col(Users::Uuid).eq(uuid.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<i64, _>("id")?),
            None => None,
        })
    }

    fn select_snapshots(&self, user_id: i64) -> sea_query::SelectStatement {
        Query::select()
            .columns([
                Snapshots::VersionId,
                Snapshots::Timestamp,
                Snapshots::SaveCause,
                Snapshots::ServerName,
                Snapshots::Pinned,
                Snapshots::FormatVersion,
                Snapshots::Payload,
            ])
            .from(self.tables.snapshots_table())
            .and_where(Expr::col(Snapshots::UserId).eq(user_id))
            .order_by(Snapshots::Timestamp, Order::Desc)
            .order_by_expr(Expr::cust("rowid"), Order::Desc)
            .to_owned()
    }

    async fn fetch_snapshots(&self, user: Uuid, limit: Option<u64>) -> Result<Vec<Snapshot>> {
        let mut conn = self.pool.acquire().await?;
        let Some(user_id) = self.user_id(&mut conn, user).await? else {
            return Ok(Vec::new());
        };

        let query = {
            let mut select = self.select_snapshots(user_id);
            if let Some(limit) = limit {
                select.limit(limit);
            }
            select.to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
        rows.iter().map(|row| row_to_snapshot(user, row)).collect()
    }
}

fn row_to_snapshot(owner: Uuid, row: &SqliteRow) -> Result<Snapshot> {
    let version_id: String = row.try_get("version_id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let save_cause: String = row.try_get("save_cause")?;
    let server_name: String = row.try_get("server_name")?;
    let pinned: i64 = row.try_get("pinned")?;
    let format_version: i64 = row.try_get("format_version")?;
    let payload: Vec<u8> = row.try_get("payload")?;

    Ok(Snapshot::from_parts(
        owner,
        Uuid::parse_str(&version_id)?,
        decode_timestamp(&timestamp)?,
        SaveCause::parse(&save_cause),
        server_name,
        pinned != 0,
        Payload::new(format_version as u32, payload),
    ))
}

fn row_to_user(row: &SqliteRow) -> Result<User> {
    let uuid: String = row.try_get("uuid")?;
    let username: String = row.try_get("username")?;
    Ok(User::new(Uuid::parse_str(&uuid)?, username))
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn ensure_user(&self, user: &User) -> Result<()> {
        let query = Query::insert()
            .into_table(self.tables.users_table())
            .columns([Users::Uuid, Users::Username])
            .values_panic([user.uuid.to_string().into(), user.username.clone().into()])
            .on_conflict(
                OnConflict::column(Users::Uuid)
                    .update_column(Users::Username)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn get_user(&self, uuid: Uuid) -> Result<Option<User>> {
        let query = Query::select()
            .columns([Users::Uuid, Users::Username])
            .from(self.tables.users_table())
            .and_where(Expr::col(Users::Uuid).eq(uuid.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let query = Query::select()
            .columns([Users::Uuid, Users::Username])
            .from(self.tables.users_table())
            .and_where(
                Expr::expr(Func::lower(Expr::col(Users::Username)))
                    .eq(username.to_ascii_lowercase()),
            )
            .order_by(Users::Id, Order::Desc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn get_all_users(&self) -> Result<Vec<User>> {
        let query = Query::select()
            .columns([Users::Uuid, Users::Username])
            .from(self.tables.users_table())
            .order_by(Users::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_user).collect()
    }

    async fn add_snapshot(&self, user: Uuid, snapshot: &Snapshot) -> Result<()> {
        // Rotation, insert and prune commit together so readers never see the
        // history over the limit.
        let mut tx = self.pool.begin().await?;

        let user_id = self
            .user_id(&mut tx, user)
            .await?
            .ok_or(StorageError::UnknownUser(user))?;

        if let Some(cutoff) = self.retention.rotation_cutoff(snapshot) {
            let rotate = format!(
                "DELETE FROM {t} WHERE rowid = (SELECT rowid FROM {t} \
                 WHERE user_id = ? AND pinned = 0 AND timestamp > ? \
                 ORDER BY timestamp DESC, rowid DESC LIMIT 1)",
                t = self.tables.snapshots
            );
            let rotated = sqlx::query(&rotate)
                .bind(user_id)
                .bind(encode_timestamp(cutoff))
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if rotated > 0 {
                debug!(user = %user, "Rotated snapshot within backup window");
            }
        }

        let pinned = if snapshot.is_pinned() { 1i32 } else { 0i32 };
        let insert = Query::insert()
            .into_table(self.tables.snapshots_table())
            .columns([
                Snapshots::UserId,
                Snapshots::VersionId,
                Snapshots::Timestamp,
                Snapshots::SaveCause,
                Snapshots::ServerName,
                Snapshots::Pinned,
                Snapshots::FormatVersion,
                Snapshots::Payload,
            ])
            .values_panic([
                user_id.into(),
                snapshot.version_id().to_string().into(),
                encode_timestamp(snapshot.timestamp()).into(),
                snapshot.save_cause().as_str().into(),
                snapshot.server_name().into(),
                pinned.into(),
                i64::from(snapshot.payload().format_version).into(),
                snapshot.payload().data.clone().into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&insert).execute(&mut *tx).await?;

        let prune = format!(
            "DELETE FROM {t} WHERE rowid IN (SELECT rowid FROM {t} \
             WHERE user_id = ? AND pinned = 0 \
             ORDER BY timestamp DESC, rowid DESC LIMIT -1 OFFSET ?)",
            t = self.tables.snapshots
        );
        let pruned = sqlx::query(&prune)
            .bind(user_id)
            .bind(self.retention.max_snapshots as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        debug!(
            user = %user,
            version = %snapshot.version_id(),
            cause = %snapshot.save_cause(),
            pruned,
            "Stored snapshot"
        );
        Ok(())
    }

    async fn get_latest_snapshot(&self, user: Uuid) -> Result<Option<Snapshot>> {
        Ok(self.fetch_snapshots(user, Some(1)).await?.into_iter().next())
    }

    async fn get_snapshot_history(&self, user: Uuid) -> Result<Vec<Snapshot>> {
        self.fetch_snapshots(user, None).await
    }

    async fn get_snapshot(&self, user: Uuid, version_id: Uuid) -> Result<Option<Snapshot>> {
        let mut conn = self.pool.acquire().await?;
        let Some(user_id) = self.user_id(&mut conn, user).await? else {
            return Ok(None);
        };

        let query = self
            .select_snapshots(user_id)
            .and_where(Expr::col(Snapshots::VersionId).eq(version_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.as_ref().map(|row| row_to_snapshot(user, row)).transpose()
    }

    async fn delete_snapshot(&self, user: Uuid, version_id: Uuid) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let Some(user_id) = self.user_id(&mut conn, user).await? else {
            return Ok(false);
        };

        let query = Query::delete()
            .from_table(self.tables.snapshots_table())
            .and_where(Expr::col(Snapshots::UserId).eq(user_id))
            .and_where(Expr::col(Snapshots::VersionId).eq(version_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_pinned(&self, user: Uuid, version_id: Uuid, pinned: bool) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let Some(user_id) = self.user_id(&mut conn, user).await? else {
            return Ok(false);
        };

        let query = Query::update()
            .table(self.tables.snapshots_table())
            .value(Snapshots::Pinned, if pinned { 1i32 } else { 0i32 })
            .and_where(Expr::col(Snapshots::UserId).eq(user_id))
            .and_where(Expr::col(Snapshots::VersionId).eq(version_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }
}
