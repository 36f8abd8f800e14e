// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable tiers and the remote data seams.
//!
//! The local and offline tiers are [`TierStore`]s holding [`StoredRecord`]s.
//! Two implementations ship: [`InMemoryTierStore`] for tests and ephemeral
//! runs, and [`SqliteTierStore`] over one of the local SQLite tables.
//!
//! The remote mirror and change stream are external. They are reached through
//! [`RemoteSource`] (read-only key lookups) and the subscription module.
//!
//! Implementations return [`BoxFuture`] so the traits stay object safe and
//! can be held as `Arc<dyn TierStore>`.

use crate::error::Result;
use crate::storage::{execute_with_retry, SqliteStorage};
use crate::BoxFuture;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Serialized shape of a record in a durable tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub data: Value,
    /// When the data was fetched from its source (epoch ms).
    pub timestamp: i64,
    /// Freshness window in ms. `None` never expires (offline snapshots).
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl StoredRecord {
    pub fn new(data: Value, timestamp: i64, ttl: Option<u64>) -> Self {
        Self { data, timestamp, ttl }
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        match self.ttl {
            Some(ttl) => now - self.timestamp < ttl as i64,
            None => true,
        }
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.timestamp
    }
}

/// Key-value persistence for one cache tier.
pub trait TierStore: Send + Sync + 'static {
    /// Tier label for logs.
    fn name(&self) -> &'static str;

    /// Record for `key`; unreadable records are reported as absent.
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<StoredRecord>>;

    fn save<'a>(&'a self, key: &'a str, record: StoredRecord) -> BoxFuture<'a, ()>;

    /// Returns whether a record was removed.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool>;

    fn clear(&self) -> BoxFuture<'_, ()>;
}

/// Read-only lookup against the remote database mirror.
pub trait RemoteSource: Send + Sync + 'static {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Value>>;
}

/// Remote that never has anything. Used when no mirror is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemote;

impl RemoteSource for NoRemote {
    fn fetch<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Option<Value>> {
        Box::pin(async { Ok(None) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local tier store.
#[derive(Debug)]
pub struct InMemoryTierStore {
    name: &'static str,
    records: DashMap<String, StoredRecord>,
}

impl InMemoryTierStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl TierStore for InMemoryTierStore {
    fn name(&self) -> &'static str {
        self.name
    }

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<StoredRecord>> {
        let record = self.records.get(key).map(|r| r.value().clone());
        Box::pin(async move { Ok(record) })
    }

    fn save<'a>(&'a self, key: &'a str, record: StoredRecord) -> BoxFuture<'a, ()> {
        self.records.insert(key.to_string(), record);
        Box::pin(async { Ok(()) })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        let removed = self.records.remove(key).is_some();
        Box::pin(async move { Ok(removed) })
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        self.records.clear();
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite store
// ═══════════════════════════════════════════════════════════════════════════════

/// Which local table a [`SqliteTierStore`] writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierTable {
    CacheRecords,
    OfflineSnapshots,
}

impl TierTable {
    fn select_sql(self) -> &'static str {
        match self {
            Self::CacheRecords => "SELECT record FROM cache_records WHERE cache_key = ?",
            Self::OfflineSnapshots => "SELECT record FROM offline_snapshots WHERE cache_key = ?",
        }
    }

    fn upsert_sql(self) -> &'static str {
        match self {
            Self::CacheRecords => {
                "INSERT INTO cache_records (cache_key, record, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(cache_key) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at"
            }
            Self::OfflineSnapshots => {
                "INSERT INTO offline_snapshots (cache_key, record, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(cache_key) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at"
            }
        }
    }

    fn delete_sql(self) -> &'static str {
        match self {
            Self::CacheRecords => "DELETE FROM cache_records WHERE cache_key = ?",
            Self::OfflineSnapshots => "DELETE FROM offline_snapshots WHERE cache_key = ?",
        }
    }

    fn clear_sql(self) -> &'static str {
        match self {
            Self::CacheRecords => "DELETE FROM cache_records",
            Self::OfflineSnapshots => "DELETE FROM offline_snapshots",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::CacheRecords => "local",
            Self::OfflineSnapshots => "offline",
        }
    }
}

/// Tier store over a local SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteTierStore {
    storage: SqliteStorage,
    table: TierTable,
}

impl SqliteTierStore {
    pub fn new(storage: SqliteStorage, table: TierTable) -> Self {
        Self { storage, table }
    }

    pub fn local(storage: SqliteStorage) -> Self {
        Self::new(storage, TierTable::CacheRecords)
    }

    pub fn offline(storage: SqliteStorage) -> Self {
        Self::new(storage, TierTable::OfflineSnapshots)
    }

    async fn load_inner(&self, key: &str) -> Result<Option<StoredRecord>> {
        let pool = self.storage.pool();
        let sql = self.table.select_sql();
        let row: Option<(String,)> = execute_with_retry("tier_load", || async {
            sqlx::query_as(sql).bind(key).fetch_optional(pool).await
        })
        .await?;

        let Some((raw,)) = row else {
            return Ok(None);
        };
        match serde_json::from_str::<StoredRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(tier = self.table.label(), key = %key, error = %e, "Discarding corrupt cache record");
                self.remove_inner(key).await?;
                Ok(None)
            }
        }
    }

    async fn save_inner(&self, key: &str, record: StoredRecord) -> Result<()> {
        let raw = serde_json::to_string(&record)?;
        let pool = self.storage.pool();
        let sql = self.table.upsert_sql();
        let updated_at = record.timestamp;
        execute_with_retry("tier_save", || async {
            sqlx::query(sql).bind(key).bind(&raw).bind(updated_at).execute(pool).await
        })
        .await?;
        debug!(tier = self.table.label(), key = %key, "Persisted cache record");
        Ok(())
    }

    async fn remove_inner(&self, key: &str) -> Result<bool> {
        let pool = self.storage.pool();
        let sql = self.table.delete_sql();
        let result = execute_with_retry("tier_remove", || async {
            sqlx::query(sql).bind(key).execute(pool).await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_inner(&self) -> Result<()> {
        let pool = self.storage.pool();
        let sql = self.table.clear_sql();
        execute_with_retry("tier_clear", || async { sqlx::query(sql).execute(pool).await }).await?;
        Ok(())
    }
}

impl TierStore for SqliteTierStore {
    fn name(&self) -> &'static str {
        self.table.label()
    }

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<StoredRecord>> {
        Box::pin(self.load_inner(key))
    }

    fn save<'a>(&'a self, key: &'a str, record: StoredRecord) -> BoxFuture<'a, ()> {
        Box::pin(self.save_inner(key, record))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(self.remove_inner(key))
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.clear_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_freshness() {
        let record = StoredRecord::new(json!({"a": 1}), 1_000, Some(500));
        assert!(record.is_fresh(1_499));
        assert!(!record.is_fresh(1_500));
        assert_eq!(record.age_ms(1_600), 600);

        let snapshot = StoredRecord::new(json!(null), 0, None);
        assert!(snapshot.is_fresh(i64::MAX));
    }

    #[test]
    fn test_record_without_ttl_field_deserializes() {
        let record: StoredRecord = serde_json::from_str(r#"{"data": [1, 2], "timestamp": 5}"#).unwrap();
        assert_eq!(record.ttl, None);
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryTierStore::new("local");
        let record = StoredRecord::new(json!({"id": "m1"}), 10, Some(1_000));
        store.save("matches:1", record.clone()).await.unwrap();

        assert_eq!(store.load("matches:1").await.unwrap(), Some(record));
        assert!(store.remove("matches:1").await.unwrap());
        assert!(!store.remove("matches:1").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_store_tables_are_independent() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let local = SqliteTierStore::local(storage.clone());
        let offline = SqliteTierStore::offline(storage);

        local
            .save("k", StoredRecord::new(json!({"v": "local"}), 1, Some(100)))
            .await
            .unwrap();
        offline.save("k", StoredRecord::new(json!({"v": "offline"}), 2, None)).await.unwrap();

        assert_eq!(local.load("k").await.unwrap().unwrap().data, json!({"v": "local"}));
        assert_eq!(offline.load("k").await.unwrap().unwrap().data, json!({"v": "offline"}));

        local.clear().await.unwrap();
        assert!(local.load("k").await.unwrap().is_none());
        assert!(offline.load("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sqlite_store_upsert_replaces() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let local = SqliteTierStore::local(storage);
        local.save("k", StoredRecord::new(json!(1), 1, Some(10))).await.unwrap();
        local.save("k", StoredRecord::new(json!(2), 2, Some(10))).await.unwrap();
        let record = local.load("k").await.unwrap().unwrap();
        assert_eq!(record.data, json!(2));
        assert_eq!(record.timestamp, 2);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_discarded() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        sqlx::query("INSERT INTO cache_records (cache_key, record, updated_at) VALUES ('bad', 'not json', 0)")
            .execute(storage.pool())
            .await
            .unwrap();

        let local = SqliteTierStore::local(storage.clone());
        assert!(local.load("bad").await.unwrap().is_none());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_records")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_no_remote_returns_none() {
        assert!(NoRemote.fetch("anything").await.unwrap().is_none());
    }
}
