// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local SQLite persistence.
//!
//! One database file backs three tables:
//!
//! ```text
//! cache_records      local cache tier     {data, timestamp, ttl} JSON, TTL-checked
//! offline_snapshots  offline tier         same record shape, never expires
//! dead_letters       dead-letter store    one row per operation key
//! ```
//!
//! # SQLite Busy Handling
//!
//! The app and background workers share the file, so SQLITE_BUSY/SQLITE_LOCKED
//! are expected under contention. Every statement goes through
//! [`execute_with_retry`], which backs off exponentially (10ms → 500ms, 5
//! attempts) before giving up.
//!
//! WAL mode is enabled for file-backed databases. `":memory:"` opens a
//! single-connection in-memory database for tests.

use crate::error::{FixtureSyncError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                if code == "5" || code == "6" {
                    return true;
                }
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_storage_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Handle to the local SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    path: String,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let in_memory = path_str == ":memory:";
        info!(path = %path_str, "Opening local storage");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| FixtureSyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(250))
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // Every connection to ":memory:" is a separate database.
        let max_connections = if in_memory { 1 } else { 4 };
        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if in_memory {
            // Dropping the only connection would drop the database with it.
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await?;

        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self { pool, path: path_str })
    }

    /// In-memory database, for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }

    /// Force flush WAL to the main database file.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool, waiting for in-flight statements.
    pub async fn close(&self) {
        if !self.is_in_memory() {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!(path = %self.path, "Local storage closed");
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cache_records (
        cache_key TEXT PRIMARY KEY,
        record TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offline_snapshots (
        cache_key TEXT PRIMARY KEY,
        record TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        operation_key TEXT PRIMARY KEY,
        entry TEXT NOT NULL,
        status TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_creates_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixtures.db");
        let storage = SqliteStorage::open(&path).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(storage.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"cache_records"));
        assert!(names.contains(&"offline_snapshots"));
        assert!(names.contains(&"dead_letters"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_in_memory_storage() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert_eq!(storage.path(), ":memory:");
        sqlx::query("INSERT INTO cache_records (cache_key, record, updated_at) VALUES ('k', '{}', 1)")
            .execute(storage.pool())
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_records")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_passes_through_non_busy_errors() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), sqlx::Error> = execute_with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_retries_pool_timeouts() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_is_busy_error() {
        assert!(is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
    }
}
