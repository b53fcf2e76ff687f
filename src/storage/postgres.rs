//! PostgreSQL implementation of the durable snapshot store.
//!
//! Mirrors the SQLite backend. Ties on `timestamp` are broken by the `seq`
//! column since PostgreSQL has no stable rowid.

use async_trait::async_trait;
use sea_query::{Expr, Func, OnConflict, Order, PostgresQueryBuilder, Query};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::snapshot::{Payload, SaveCause, Snapshot, User};

use super::schema::{decode_timestamp, encode_timestamp, Snapshots, TableNames, Users};
use super::{Result, Retention, SnapshotStore, StorageError};

/// PostgreSQL implementation of SnapshotStore.
pub struct PostgresSnapshotStore {
    pool: PgPool,
    tables: TableNames,
    retention: Retention,
}

impl PostgresSnapshotStore {
    /// Create a new PostgreSQL snapshot store.
    pub fn new(pool: PgPool, cluster_id: &str, retention: Retention) -> Self {
        Self {
            pool,
            tables: TableNames::for_cluster(cluster_id),
            retention,
        }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        for statement in self.tables.postgres_schema() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn user_id(&self, conn: &mut PgConnection, uuid: Uuid) -> Result<Option<i64>> {
        let query = Query::select()
            .column(Users::Id)
            .from(self.tables.users_table())
            .and_where(Expr::col(Users::Uuid).eq(uuid.to_string()))
            .to_string(PostgresQueryBuilder);

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
            .order_by_expr(Expr::cust("seq"), Order::Desc)
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
            select.to_string(PostgresQueryBuilder)
        };

        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
        rows.iter().map(|row| row_to_snapshot(user, row)).collect()
    }
}

fn row_to_snapshot(owner: Uuid, row: &PgRow) -> Result<Snapshot> {
    let version_id: String = row.try_get("version_id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let save_cause: String = row.try_get("save_cause")?;
    let server_name: String = row.try_get("server_name")?;
    let pinned: bool = row.try_get("pinned")?;
    let format_version: i32 = row.try_get("format_version")?;
    let payload: Vec<u8> = row.try_get("payload")?;

    Ok(Snapshot::from_parts(
        owner,
        Uuid::parse_str(&version_id)?,
        decode_timestamp(&timestamp)?,
        SaveCause::parse(&save_cause),
        server_name,
        pinned,
        Payload::new(format_version as u32, payload),
    ))
}

fn row_to_user(row: &PgRow) -> Result<User> {
    let uuid: String = row.try_get("uuid")?;
    let username: String = row.try_get("username")?;
    Ok(User::new(Uuid::parse_str(&uuid)?, username))
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
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
            .to_string(PostgresQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn get_user(&self, uuid: Uuid) -> Result<Option<User>> {
        let query = Query::select()
            .columns([Users::Uuid, Users::Username])
            .from(self.tables.users_table())
            .and_where(Expr::col(Users::Uuid).eq(uuid.to_string()))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let query = Query::select()
            .columns([Users::Uuid, Users::Username])
            .from(self.tables.users_table())
            .and_where(
                Expr::expr(Func::lower(Expr::col(Users::Username))).eq(username.to_lowercase()),
            )
            .order_by(Users::Id, Order::Desc)
            .limit(1)
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn get_all_users(&self) -> Result<Vec<User>> {
        let query = Query::select()
            .columns([Users::Uuid, Users::Username])
            .from(self.tables.users_table())
            .order_by(Users::Id, Order::Asc)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_user).collect()
    }

    async fn add_snapshot(&self, user: Uuid, snapshot: &Snapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let user_id = self
            .user_id(&mut tx, user)
            .await?
            .ok_or(StorageError::UnknownUser(user))?;

        if let Some(cutoff) = self.retention.rotation_cutoff(snapshot) {
            let rotate = format!(
                "DELETE FROM {t} WHERE seq = (SELECT seq FROM {t} \
                 WHERE user_id = $1 AND pinned = FALSE AND timestamp > $2 \
                 ORDER BY timestamp DESC, seq DESC LIMIT 1)",
                t = self.tables.snapshots
            );
            sqlx::query(&rotate)
                .bind(user_id)
                .bind(encode_timestamp(cutoff))
                .execute(&mut *tx)
                .await?;
        }

        // Bound parameters keep BYTEA encoding in the driver.
        let insert = format!(
            "INSERT INTO {t} (user_id, version_id, timestamp, save_cause, server_name, \
             pinned, format_version, payload) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            t = self.tables.snapshots
        );
        sqlx::query(&insert)
            .bind(user_id)
            .bind(snapshot.version_id().to_string())
            .bind(encode_timestamp(snapshot.timestamp()))
            .bind(snapshot.save_cause().as_str())
            .bind(snapshot.server_name())
            .bind(snapshot.is_pinned())
            .bind(snapshot.payload().format_version as i32)
            .bind(snapshot.payload().data.as_slice())
            .execute(&mut *tx)
            .await?;

        let prune = format!(
            "DELETE FROM {t} WHERE seq IN (SELECT seq FROM {t} \
             WHERE user_id = $1 AND pinned = FALSE \
             ORDER BY timestamp DESC, seq DESC OFFSET $2)",
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
            .to_string(PostgresQueryBuilder);

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
            .to_string(PostgresQueryBuilder);

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
            .value(Snapshots::Pinned, pinned)
            .and_where(Expr::col(Snapshots::UserId).eq(user_id))
            .and_where(Expr::col(Snapshots::VersionId).eq(version_id.to_string()))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }
}
