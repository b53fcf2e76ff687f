//! Database schema definitions using sea-query.
//!
//! Column identifiers are static; table names are derived from the cluster id
//! so independently synchronized clusters can share one database.

use sea_query::{Alias, Iden};

/// Users table columns.
#[derive(Iden)]
pub enum Users {
    #[iden = "id"]
    Id,
    #[iden = "uuid"]
    Uuid,
    #[iden = "username"]
    Username,
}

/// Snapshots table columns.
#[derive(Iden)]
pub enum Snapshots {
    #[iden = "user_id"]
    UserId,
    #[iden = "version_id"]
    VersionId,
    #[iden = "timestamp"]
    Timestamp,
    #[iden = "save_cause"]
    SaveCause,
    #[iden = "server_name"]
    ServerName,
    #[iden = "pinned"]
    Pinned,
    #[iden = "format_version"]
    FormatVersion,
    #[iden = "payload"]
    Payload,
}

/// Cluster-namespaced table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub users: String,
    pub snapshots: String,
}

impl TableNames {
    /// Table names for a cluster. An empty cluster id uses the bare names.
    pub fn for_cluster(cluster_id: &str) -> Self {
        let cluster: String = cluster_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_ascii_lowercase();
        let prefix = if cluster.is_empty() {
            "handoff".to_string()
        } else {
            format!("handoff_{}", cluster)
        };
        Self {
            users: format!("{}_users", prefix),
            snapshots: format!("{}_snapshots", prefix),
        }
    }

    pub fn users_table(&self) -> Alias {
        Alias::new(self.users.as_str())
    }

    pub fn snapshots_table(&self) -> Alias {
        Alias::new(self.snapshots.as_str())
    }

    /// Statements creating the SQLite schema.
    ///
    /// SQLite keeps an implicit `rowid`, which orders snapshots taken within
    /// the same timestamp.
    pub fn sqlite_schema(&self) -> Vec<String> {
        vec![
            format!(
                r#"
CREATE TABLE IF NOT EXISTS {users} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    username TEXT NOT NULL
)"#,
                users = self.users
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{users}_username ON {users}(username COLLATE NOCASE)",
                users = self.users
            ),
            format!(
                r#"
CREATE TABLE IF NOT EXISTS {snapshots} (
    user_id INTEGER NOT NULL REFERENCES {users}(id) ON DELETE CASCADE,
    version_id TEXT NOT NULL UNIQUE,
    timestamp TEXT NOT NULL,
    save_cause TEXT NOT NULL,
    server_name TEXT NOT NULL,
    pinned INTEGER NOT NULL DEFAULT 0,
    format_version INTEGER NOT NULL,
    payload BLOB NOT NULL,
    PRIMARY KEY (user_id, version_id)
)"#,
                snapshots = self.snapshots,
                users = self.users
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{snapshots}_user_time ON {snapshots}(user_id, timestamp)",
                snapshots = self.snapshots
            ),
        ]
    }

    /// Statements creating the PostgreSQL schema.
    ///
    /// `seq` orders snapshots taken within the same timestamp.
    pub fn postgres_schema(&self) -> Vec<String> {
        vec![
            format!(
                r#"
CREATE TABLE IF NOT EXISTS {users} (
    id BIGSERIAL PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE,
    username TEXT NOT NULL
)"#,
                users = self.users
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{users}_username ON {users}(LOWER(username))",
                users = self.users
            ),
            format!(
                r#"
CREATE TABLE IF NOT EXISTS {snapshots} (
    seq BIGSERIAL,
    user_id BIGINT NOT NULL REFERENCES {users}(id) ON DELETE CASCADE,
    version_id TEXT NOT NULL UNIQUE,
    timestamp TEXT NOT NULL,
    save_cause TEXT NOT NULL,
    server_name TEXT NOT NULL,
    pinned BOOLEAN NOT NULL DEFAULT FALSE,
    format_version INTEGER NOT NULL,
    payload BYTEA NOT NULL,
    PRIMARY KEY (user_id, version_id)
)"#,
                snapshots = self.snapshots,
                users = self.users
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{snapshots}_user_time ON {snapshots}(user_id, timestamp)",
                snapshots = self.snapshots
            ),
        ]
    }
}

/// Fixed-width RFC 3339 encoding, so text ordering matches time ordering.
pub fn encode_timestamp(timestamp: chrono::DateTime<chrono::Utc>) -> String {
    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub fn decode_timestamp(
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>, chrono::ParseError> {
    Ok(chrono::DateTime::parse_from_rfc3339(value)?.with_timezone(&chrono::Utc))
}
