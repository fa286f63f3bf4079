//! SQLite implementation of [`ResourceStore`].

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::identity::Identity;
use crate::store::{ResourceStore, StoreKind};
use crate::types::{CasOutcome, CasWrite, HistoryRecord, ResourceMethod, StoredVersion};

use super::schema;

const VERSION_COLUMNS: &str =
    "resource_type, surrogate_id, logical_id, owning_authority, version, last_modified, data";

const HISTORY_COLUMNS: &str = "resource_type, surrogate_id, logical_id, owning_authority, version, \
     last_modified, data, request_id, superseded_at, method";

/// Configuration for the SQLite store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Maximum number of connections in the pool. In-memory databases
    /// always use a single connection.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
        }
    }
}

/// A [`ResourceStore`] on SQLite.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    config: SqliteStoreConfig,
    is_memory: bool,
}

impl Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Creates an in-memory store.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_config(":memory:", SqliteStoreConfig::default())
    }

    /// Opens or creates a file-based store.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::with_config(path, SqliteStoreConfig::default())
    }

    /// Creates a store with custom configuration and initializes its schema.
    pub fn with_config<P: AsRef<Path>>(path: P, config: SqliteStoreConfig) -> StorageResult<Self> {
        let is_memory = path.as_ref().to_string_lossy() == ":memory:";
        let busy_timeout = Duration::from_millis(u64::from(config.busy_timeout_ms));

        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        }
        .with_init(move |conn| conn.busy_timeout(busy_timeout));

        // Every connection to ":memory:" is its own database, so the pool
        // keeps exactly one connection alive for the store's lifetime.
        let builder = Pool::builder()
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms));
        let builder = if is_memory {
            builder
                .max_size(1)
                .min_idle(Some(1))
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            builder
                .max_size(config.max_connections)
                .min_idle(Some(config.min_connections))
        };
        let pool = builder.build(manager)?;

        let store = Self {
            pool,
            config,
            is_memory,
        };
        store.configure()?;
        store.init_schema()?;
        info!(is_memory, "SQLite store ready");
        Ok(store)
    }

    /// Initializes the database schema. Safe to call repeatedly.
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn)
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &SqliteStoreConfig {
        &self.config
    }

    fn get_connection(&self) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn configure(&self) -> StorageResult<()> {
        if self.config.enable_wal && !self.is_memory {
            let conn = self.get_connection()?;
            let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            debug!(journal_mode = %mode, "Configured SQLite journal mode");
        }
        Ok(())
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization {
            message: format!("invalid timestamp '{}': {}", value, e),
        })
}

/// A version row before its text columns are parsed.
struct VersionRow {
    resource_type: String,
    surrogate_id: String,
    logical_id: String,
    owning_authority: String,
    version: i64,
    last_modified: String,
    data: String,
}

impl VersionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            resource_type: row.get(0)?,
            surrogate_id: row.get(1)?,
            logical_id: row.get(2)?,
            owning_authority: row.get(3)?,
            version: row.get(4)?,
            last_modified: row.get(5)?,
            data: row.get(6)?,
        })
    }

    fn into_version(self) -> StorageResult<StoredVersion> {
        let surrogate_id =
            Uuid::parse_str(&self.surrogate_id).map_err(|e| StorageError::Serialization {
                message: format!("invalid surrogate id '{}': {}", self.surrogate_id, e),
            })?;
        let content: Value = serde_json::from_str(&self.data)?;
        Ok(StoredVersion {
            identity: Identity {
                resource_type: self.resource_type,
                logical_id: self.logical_id,
                surrogate_id,
                owning_authority: self.owning_authority,
            },
            version: self.version as u64,
            last_modified: parse_timestamp(&self.last_modified)?,
            content,
        })
    }
}

struct HistoryRow {
    version: VersionRow,
    request_id: String,
    superseded_at: String,
    method: String,
}

impl HistoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            version: VersionRow::from_row(row)?,
            request_id: row.get(7)?,
            superseded_at: row.get(8)?,
            method: row.get(9)?,
        })
    }

    fn into_record(self) -> StorageResult<HistoryRecord> {
        let method = match self.method.as_str() {
            "POST" => ResourceMethod::Post,
            _ => ResourceMethod::Put,
        };
        Ok(HistoryRecord {
            version: self.version.into_version()?,
            request_id: self.request_id,
            superseded_at: parse_timestamp(&self.superseded_at)?,
            method,
        })
    }
}

fn select_current(
    conn: &rusqlite::Connection,
    resource_type: &str,
    surrogate_id: &str,
) -> StorageResult<Option<StoredVersion>> {
    let sql = format!(
        "SELECT {} FROM resources WHERE resource_type = ?1 AND surrogate_id = ?2",
        VERSION_COLUMNS
    );
    conn.query_row(&sql, params![resource_type, surrogate_id], VersionRow::from_row)
        .optional()?
        .map(VersionRow::into_version)
        .transpose()
}

fn insert_history(tx: &Transaction<'_>, record: &HistoryRecord) -> StorageResult<()> {
    let version = &record.version;
    let sql = format!(
        "INSERT INTO resource_history ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        HISTORY_COLUMNS
    );
    tx.execute(
        &sql,
        params![
            version.identity.resource_type,
            version.identity.surrogate_id.to_string(),
            version.identity.logical_id,
            version.identity.owning_authority,
            version.version as i64,
            timestamp(&version.last_modified),
            serde_json::to_string(&version.content)?,
            record.request_id,
            timestamp(&record.superseded_at),
            record.method.as_str(),
        ],
    )?;
    Ok(())
}

/// Applies one swap inside `tx`. Writes nothing on a mismatch.
fn apply(tx: &Transaction<'_>, write: CasWrite, now: DateTime<Utc>) -> StorageResult<CasOutcome> {
    let surrogate_id = write.identity.surrogate_id.to_string();
    let previous = select_current(tx, &write.identity.resource_type, &surrogate_id)?;
    let stored_version = previous.as_ref().map(|v| v.version);

    let matches = match (stored_version, write.expected_version) {
        (None, 0) => true,
        (Some(stored), expected) => stored == expected,
        (None, _) => false,
    };
    if !matches {
        return Ok(CasOutcome::Mismatch {
            current_version: stored_version,
        });
    }

    let expected = write.expected_version;
    let next = StoredVersion::committed(write.identity, expected + 1, now, write.content);
    let data = serde_json::to_string(&next.content)?;

    match previous {
        Some(previous) => {
            insert_history(tx, &previous.supersede(write.request_id, now))?;
            tx.execute(
                "UPDATE resources
                 SET logical_id = ?3, owning_authority = ?4, version = ?5, last_modified = ?6, data = ?7
                 WHERE resource_type = ?1 AND surrogate_id = ?2 AND version = ?8",
                params![
                    next.identity.resource_type,
                    surrogate_id,
                    next.identity.logical_id,
                    next.identity.owning_authority,
                    next.version as i64,
                    timestamp(&next.last_modified),
                    data,
                    expected as i64,
                ],
            )?;
        }
        None => {
            let sql = format!(
                "INSERT INTO resources ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                VERSION_COLUMNS
            );
            let inserted = tx.execute(
                &sql,
                params![
                    next.identity.resource_type,
                    surrogate_id,
                    next.identity.logical_id,
                    next.identity.owning_authority,
                    next.version as i64,
                    timestamp(&next.last_modified),
                    data,
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    return Ok(CasOutcome::Mismatch {
                        current_version: None,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(CasOutcome::Applied(next))
}

#[async_trait]
impl ResourceStore for SqliteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }

    async fn health_check(&self) -> StorageResult<()> {
        let unavailable = |message: String| StorageError::Unavailable {
            backend_name: "sqlite".to_string(),
            message,
        };
        let conn = self.pool.get().map_err(|e| unavailable(e.to_string()))?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(())
    }

    async fn read_current(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
    ) -> StorageResult<Option<StoredVersion>> {
        let conn = self.get_connection()?;
        select_current(&conn, resource_type, &surrogate_id.to_string())
    }

    async fn read_version(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
        version: u64,
    ) -> StorageResult<Option<StoredVersion>> {
        let conn = self.get_connection()?;
        let surrogate_id = surrogate_id.to_string();

        if let Some(current) = select_current(&conn, resource_type, &surrogate_id)?
            && current.version == version
        {
            return Ok(Some(current));
        }

        let sql = format!(
            "SELECT {} FROM resource_history
             WHERE resource_type = ?1 AND surrogate_id = ?2 AND version = ?3",
            HISTORY_COLUMNS
        );
        conn.query_row(
            &sql,
            params![resource_type, surrogate_id, version as i64],
            HistoryRow::from_row,
        )
        .optional()?
        .map(|row| row.into_record().map(|record| record.version))
        .transpose()
    }

    async fn compare_and_swap(&self, write: CasWrite) -> StorageResult<CasOutcome> {
        let mut conn = self.get_connection()?;
        let resource_type = write.identity.resource_type.clone();
        let surrogate_id = write.identity.surrogate_id;
        let expected = write.expected_version;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = apply(&tx, write, Utc::now())?;
        if outcome.is_applied() {
            tx.commit()?;
        }

        trace!(
            resource_type = %resource_type,
            surrogate_id = %surrogate_id,
            expected_version = expected,
            applied = outcome.is_applied(),
            "Compare-and-swap"
        );
        Ok(outcome)
    }

    async fn bulk_compare_and_swap(&self, writes: Vec<CasWrite>) -> StorageResult<Vec<CasOutcome>> {
        let mut conn = self.get_connection()?;
        let count = writes.len();
        let now = Utc::now();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcomes = writes
            .into_iter()
            .map(|write| apply(&tx, write, now))
            .collect::<StorageResult<Vec<_>>>()?;
        tx.commit()?;

        debug!(
            writes = count,
            applied = outcomes.iter().filter(|o| o.is_applied()).count(),
            "Bulk compare-and-swap"
        );
        Ok(outcomes)
    }

    async fn history(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
    ) -> StorageResult<Vec<HistoryRecord>> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {} FROM resource_history
             WHERE resource_type = ?1 AND surrogate_id = ?2
             ORDER BY version ASC",
            HISTORY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![resource_type, surrogate_id.to_string()], HistoryRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(HistoryRow::into_record).collect()
    }

    async fn history_since(
        &self,
        resource_type: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<HistoryRecord>> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {} FROM resource_history
             WHERE resource_type = ?1 AND last_modified >= ?2
             ORDER BY last_modified DESC, version DESC
             LIMIT ?3",
            HISTORY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(
                params![resource_type, timestamp(&since), limit],
                HistoryRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(HistoryRow::into_record).collect()
    }

    async fn count(&self, resource_type: &str) -> StorageResult<u64> {
        let conn = self.get_connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE resource_type = ?1",
            params![resource_type],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
