//! Bounded SQLite history.
//!
//! Each event kind lives in its own append-only table. After every insert the
//! table is counted and, once it exceeds `max_rows`, cut back to the newest
//! `trim_to_rows` rows in a single `DELETE`. Insert and trim are separate
//! statements, so an interrupted append can leave a table briefly over its
//! bound until the next one.

mod error;
mod record;

pub use error::{StoreError, StoreResult};
pub use record::{Record, SqliteQuery};

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use chatwatch_protocol::{Call, Message};

use error::SqlContext;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    chat_jid TEXT NOT NULL,
    chat_name TEXT NOT NULL,
    sender_jid TEXT NOT NULL,
    sender_name TEXT NOT NULL,
    is_group BOOLEAN NOT NULL DEFAULT 0,
    group_jid TEXT,
    group_name TEXT,
    is_muted BOOLEAN NOT NULL DEFAULT 0,
    is_reply_to_me BOOLEAN NOT NULL DEFAULT 0,
    text TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

CREATE TABLE IF NOT EXISTS calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    call_id TEXT NOT NULL,
    caller_jid TEXT NOT NULL,
    caller_name TEXT NOT NULL,
    is_group BOOLEAN NOT NULL DEFAULT 0,
    group_jid TEXT,
    group_name TEXT
);

CREATE INDEX IF NOT EXISTS idx_calls_timestamp ON calls(timestamp);
"#;

pub const DEFAULT_MAX_ROWS: i64 = 200;
pub const DEFAULT_TRIM_TO_ROWS: i64 = 150;

/// Per-table size bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionLimits {
    max_rows: i64,
    trim_to_rows: i64,
}

impl RetentionLimits {
    pub fn new(max_rows: i64, trim_to_rows: i64) -> StoreResult<Self> {
        if trim_to_rows < 0 || trim_to_rows >= max_rows {
            return Err(StoreError::InvalidLimits {
                max_rows,
                trim_to_rows,
            });
        }
        Ok(Self {
            max_rows,
            trim_to_rows,
        })
    }

    pub fn max_rows(&self) -> i64 {
        self.max_rows
    }

    pub fn trim_to_rows(&self) -> i64 {
        self.trim_to_rows
    }
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            trim_to_rows: DEFAULT_TRIM_TO_ROWS,
        }
    }
}

/// One append-only table holding at most `max_rows` records of `T`.
#[derive(Debug)]
pub struct BoundedTable<T> {
    pool: SqlitePool,
    limits: RetentionLimits,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for BoundedTable<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            limits: self.limits,
            _record: PhantomData,
        }
    }
}

impl<T: Record> BoundedTable<T> {
    fn new(pool: SqlitePool, limits: RetentionLimits) -> Self {
        Self {
            pool,
            limits,
            _record: PhantomData,
        }
    }

    pub fn limits(&self) -> RetentionLimits {
        self.limits
    }

    /// Insert a record and enforce the bound. Returns the assigned id.
    pub async fn append(&self, record: &T) -> StoreResult<i64> {
        let row = record
            .bind(sqlx::query(T::INSERT))
            .fetch_one(&self.pool)
            .await
            .sql_context("inserting row")?;
        let id: i64 = row.try_get("id").sql_context("reading inserted id")?;

        let count = self.count().await?;
        if count > self.limits.max_rows {
            let removed = self.trim(self.limits.trim_to_rows).await?;
            debug!(
                "Trimmed {} rows from {} ({} -> {})",
                removed,
                T::TABLE,
                count,
                count - removed as i64
            );
        }
        Ok(id)
    }

    pub async fn count(&self) -> StoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", T::TABLE);
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await
            .sql_context("counting rows")
    }

    /// Keep only the newest `keep` rows by timestamp (ties by id). Returns
    /// the number of rows removed.
    pub async fn trim(&self, keep: i64) -> StoreResult<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE id NOT IN (\
                SELECT id FROM {table} ORDER BY timestamp DESC, id DESC LIMIT ?\
            )",
            table = T::TABLE
        );
        let result = sqlx::query(&sql)
            .bind(keep.max(0))
            .execute(&self.pool)
            .await
            .sql_context("trimming table")?;
        Ok(result.rows_affected())
    }

    /// The newest `limit` records, oldest first.
    pub async fn recent(&self, limit: i64) -> StoreResult<Vec<T>> {
        let sql = format!(
            "SELECT {columns} FROM {table} ORDER BY timestamp DESC, id DESC LIMIT ?",
            columns = T::COLUMNS,
            table = T::TABLE
        );
        let rows = sqlx::query(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await
            .sql_context("reading recent rows")?;

        let mut records = rows
            .iter()
            .map(T::from_row)
            .collect::<Result<Vec<_>, _>>()
            .sql_context("decoding row")?;
        records.reverse();
        Ok(records)
    }
}

/// The history database: one bounded table per event kind.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    path: Option<PathBuf>,
    messages: BoundedTable<Message>,
    calls: BoundedTable<Call>,
}

impl Store {
    /// Open or create the database at `path`, creating parent directories.
    pub async fn open(path: &Path, limits: RetentionLimits) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&database_url)
            .sql_context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect_with(options)
            .await
            .sql_context("connecting to history database")?;

        Self::init(pool, Some(path.to_path_buf()), limits).await
    }

    /// In-memory database, used by tests.
    pub async fn in_memory(limits: RetentionLimits) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .sql_context("parsing in-memory database URL")?;

        // Every connection to :memory: is its own database, so pin exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .sql_context("connecting to in-memory database")?;

        Self::init(pool, None, limits).await
    }

    async fn init(
        pool: SqlitePool,
        path: Option<PathBuf>,
        limits: RetentionLimits,
    ) -> StoreResult<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .sql_context("initializing history schema")?;

        Ok(Self {
            messages: BoundedTable::new(pool.clone(), limits),
            calls: BoundedTable::new(pool.clone(), limits),
            pool,
            path,
        })
    }

    pub fn messages(&self) -> &BoundedTable<Message> {
        &self.messages
    }

    pub fn calls(&self) -> &BoundedTable<Call> {
        &self.calls
    }

    /// Database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
