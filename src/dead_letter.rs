// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead-letter store for operations that could not be completed.
//!
//! Holds at most one live [`DeadLetterEntry`] per operation key. A repeat
//! failure for the same key merges into the existing entry and accumulates
//! its retry count instead of creating a duplicate.
//!
//! # Entry Lifecycle
//!
//! ```text
//!              upsert (retryable)                 due + replayed
//!   (none) ───────────────────────► Pending ─────────────────────► Retrying
//!     │                               ▲  │                            │
//!     │ upsert (non-retryable)        │  │ older than max_age         │ fails again
//!     ▼                               │  ▼                            │
//!   Failed ◄──────────────────────────┼─ Failed                       │
//!                                     └───────────────────────────────┘
//!   resolve(key) at any point removes the entry (Resolved).
//! ```
//!
//! # Persistence
//!
//! Writes are cache-first (write-behind): the in-memory map is updated immediately and the
//! key marked dirty. [`DeadLetterStore::flush_dirty`] persists dirty keys in
//! one pass; the coordinator calls it periodically and on shutdown. A crash
//! between the two loses at most one flush interval of bookkeeping, and the
//! failing operations would simply be retried again.

use crate::classifier::{ClassifiedError, ErrorCategory};
use crate::clock::SharedClock;
use crate::error::Result;
use crate::storage::{execute_with_retry, SqliteStorage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    /// Waiting for `next_retry_at`.
    Pending,
    /// Replay in progress.
    Retrying,
    /// Terminal; will not be retried automatically.
    Failed,
    /// Operation eventually succeeded.
    Resolved,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Retrying => "RETRYING",
            Self::Failed => "FAILED",
            Self::Resolved => "RESOLVED",
        }
    }
}

impl std::fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed operation awaiting replay or operator attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub operation_key: String,
    pub error: ClassifiedError,
    pub retry_count: u32,
    pub first_failure_at: i64,
    pub last_failure_at: i64,
    pub next_retry_at: Option<i64>,
    pub status: DeadLetterStatus,
    /// Enough to rebuild the operation on replay (task kind + filter).
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Ages and cooldowns governing dead letters.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterPolicy {
    /// Entries whose first failure is older than this become `Failed`.
    pub max_age: Duration,
    pub network_cooldown: Duration,
    pub timeout_cooldown: Duration,
    pub rate_limit_cooldown: Duration,
    pub api_cooldown: Duration,
    pub database_cooldown: Duration,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            network_cooldown: Duration::from_secs(30),
            timeout_cooldown: Duration::from_secs(30),
            rate_limit_cooldown: Duration::from_secs(60),
            api_cooldown: Duration::from_secs(120),
            database_cooldown: Duration::from_secs(300),
        }
    }
}

impl DeadLetterPolicy {
    /// Wait before an automatic replay, or `None` for categories that are
    /// never replayed.
    pub fn cooldown_for(&self, category: ErrorCategory) -> Option<Duration> {
        match category {
            ErrorCategory::Network => Some(self.network_cooldown),
            ErrorCategory::Timeout => Some(self.timeout_cooldown),
            ErrorCategory::RateLimit => Some(self.rate_limit_cooldown),
            ErrorCategory::ApiResponse => Some(self.api_cooldown),
            ErrorCategory::Database => Some(self.database_cooldown),
            ErrorCategory::Authentication | ErrorCategory::DataValidation | ErrorCategory::Unknown => None,
        }
    }
}

/// Counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub pending: usize,
    pub retrying: usize,
    pub failed: usize,
}

/// One live entry per operation key, optionally persisted to SQLite.
pub struct DeadLetterStore {
    entries: Mutex<HashMap<String, DeadLetterEntry>>,
    dirty: Mutex<HashSet<String>>,
    storage: Option<SqliteStorage>,
    policy: DeadLetterPolicy,
    clock: SharedClock,
    seq: AtomicU64,
}

impl DeadLetterStore {
    /// Memory-only store.
    pub fn new(policy: DeadLetterPolicy, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            storage: None,
            policy,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    /// Store backed by SQLite; existing rows are loaded.
    ///
    /// Rows that no longer deserialize are skipped with a warning.
    pub async fn open(storage: SqliteStorage, policy: DeadLetterPolicy, clock: SharedClock) -> Result<Self> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT operation_key, entry FROM dead_letters")
            .fetch_all(storage.pool())
            .await?;

        let mut entries = HashMap::new();
        for (key, raw) in rows {
            match serde_json::from_str::<DeadLetterEntry>(&raw) {
                Ok(entry) => {
                    entries.insert(key, entry);
                }
                Err(e) => warn!(operation_key = %key, error = %e, "Skipping unreadable dead letter"),
            }
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "Restored dead letters from previous run");
        }
        crate::metrics::set_dead_letters(entries.len());

        Ok(Self {
            seq: AtomicU64::new(entries.len() as u64),
            entries: Mutex::new(entries),
            dirty: Mutex::new(HashSet::new()),
            storage: Some(storage),
            policy,
            clock,
        })
    }

    pub fn policy(&self) -> &DeadLetterPolicy {
        &self.policy
    }

    fn mark_dirty(&self, key: &str) {
        if self.storage.is_some() {
            self.dirty.lock().insert(key.to_string());
        }
    }

    /// Record a failure, merging into any live entry for the key.
    ///
    /// `attempts` is how many executions this failure report covers.
    pub fn upsert(
        &self,
        operation_key: &str,
        error: ClassifiedError,
        attempts: u32,
        payload: Option<serde_json::Value>,
    ) -> DeadLetterEntry {
        let now = self.clock.now_millis();
        let category = error.category;
        let entry = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(operation_key.to_string()).or_insert_with(|| {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
                DeadLetterEntry {
                    id: format!("dl-{now}-{seq}"),
                    operation_key: operation_key.to_string(),
                    error: error.clone(),
                    retry_count: 0,
                    first_failure_at: now,
                    last_failure_at: now,
                    next_retry_at: None,
                    status: DeadLetterStatus::Pending,
                    payload: None,
                }
            });

            entry.retry_count = entry.retry_count.saturating_add(attempts);
            entry.last_failure_at = now;
            entry.error = error;
            if payload.is_some() {
                entry.payload = payload;
            }

            let expired = now - entry.first_failure_at > self.policy.max_age.as_millis() as i64;
            let cooldown = if entry.error.retryable {
                self.policy.cooldown_for(category)
            } else {
                None
            };
            match cooldown {
                Some(wait) if !expired => {
                    entry.status = DeadLetterStatus::Pending;
                    entry.next_retry_at = Some(now + wait.as_millis() as i64);
                }
                _ => {
                    entry.status = DeadLetterStatus::Failed;
                    entry.next_retry_at = None;
                }
            }
            entry.clone()
        };
        self.mark_dirty(operation_key);

        warn!(
            operation_key = %operation_key,
            category = %category,
            status = %entry.status,
            retry_count = entry.retry_count,
            "Operation dead-lettered"
        );
        crate::metrics::record_dead_letter(category.as_str(), entry.status.as_str());
        crate::metrics::set_dead_letters(self.len());
        entry
    }

    /// The operation succeeded: drop its entry.
    pub fn resolve(&self, operation_key: &str) -> Option<DeadLetterEntry> {
        let removed = self.entries.lock().remove(operation_key);
        removed.map(|mut entry| {
            entry.status = DeadLetterStatus::Resolved;
            self.mark_dirty(operation_key);
            info!(operation_key = %operation_key, retry_count = entry.retry_count, "Dead letter resolved");
            crate::metrics::record_dead_letter(entry.error.category.as_str(), entry.status.as_str());
            crate::metrics::set_dead_letters(self.len());
            entry
        })
    }

    pub fn get(&self, operation_key: &str) -> Option<DeadLetterEntry> {
        self.entries.lock().get(operation_key).cloned()
    }

    /// All live entries, oldest first.
    pub fn list(&self) -> Vec<DeadLetterEntry> {
        let mut all: Vec<DeadLetterEntry> = self.entries.lock().values().cloned().collect();
        all.sort_by(|a, b| a.first_failure_at.cmp(&b.first_failure_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Pending entries whose cooldown has elapsed.
    pub fn due_for_retry(&self) -> Vec<DeadLetterEntry> {
        let now = self.clock.now_millis();
        let mut due: Vec<DeadLetterEntry> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.status == DeadLetterStatus::Pending && e.next_retry_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_retry_at);
        due
    }

    /// Flag a pending entry as being replayed. Returns `false` if the entry is
    /// missing or not pending.
    pub fn mark_retrying(&self, operation_key: &str) -> bool {
        let marked = {
            let mut entries = self.entries.lock();
            match entries.get_mut(operation_key) {
                Some(entry) if entry.status == DeadLetterStatus::Pending => {
                    entry.status = DeadLetterStatus::Retrying;
                    true
                }
                _ => false,
            }
        };
        if marked {
            self.mark_dirty(operation_key);
        }
        marked
    }

    /// Mark entries older than `max_age` as `Failed`. Returns how many changed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let max_age = self.policy.max_age.as_millis() as i64;
        let expired: Vec<String> = {
            let mut entries = self.entries.lock();
            entries
                .values_mut()
                .filter(|e| e.status != DeadLetterStatus::Failed && now - e.first_failure_at > max_age)
                .map(|e| {
                    e.status = DeadLetterStatus::Failed;
                    e.next_retry_at = None;
                    e.operation_key.clone()
                })
                .collect()
        };
        for key in &expired {
            self.mark_dirty(key);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Dead letters expired");
        }
        expired.len()
    }

    /// Drop every `Failed` entry (operator acknowledgement).
    pub fn purge_failed(&self) -> usize {
        let purged: Vec<String> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .values()
                .filter(|e| e.status == DeadLetterStatus::Failed)
                .map(|e| e.operation_key.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };
        for key in &purged {
            self.mark_dirty(key);
        }
        crate::metrics::set_dead_letters(self.len());
        purged.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> DeadLetterStats {
        let entries = self.entries.lock();
        let mut stats = DeadLetterStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            match entry.status {
                DeadLetterStatus::Pending => stats.pending += 1,
                DeadLetterStatus::Retrying => stats.retrying += 1,
                DeadLetterStatus::Failed => stats.failed += 1,
                DeadLetterStatus::Resolved => {}
            }
        }
        stats
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Persist dirty keys: live entries are upserted, removed ones deleted.
    ///
    /// Keys that fail to write are re-marked dirty for the next flush.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let dirty: Vec<String> = self.dirty.lock().drain().collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now_millis();
        let pool = storage.pool();
        let mut flushed = 0;
        let mut errors = 0;

        for key in &dirty {
            let current = self.get(key);
            let result: Result<()> = match current {
                Some(entry) => {
                    let raw = match serde_json::to_string(&entry) {
                        Ok(raw) => raw,
                        Err(e) => {
                            errors += 1;
                            warn!(operation_key = %key, error = %e, "Failed to encode dead letter");
                            self.dirty.lock().insert(key.clone());
                            continue;
                        }
                    };
                    let status = entry.status.as_str();
                    execute_with_retry("dead_letter_flush", || async {
                        sqlx::query(
                            r#"
                            INSERT INTO dead_letters (operation_key, entry, status, updated_at)
                            VALUES (?, ?, ?, ?)
                            ON CONFLICT(operation_key) DO UPDATE SET
                                entry = excluded.entry,
                                status = excluded.status,
                                updated_at = excluded.updated_at
                            "#,
                        )
                        .bind(key)
                        .bind(&raw)
                        .bind(status)
                        .bind(now)
                        .execute(pool)
                        .await
                    })
                    .await
                    .map(|_| ())
                    .map_err(Into::into)
                }
                None => execute_with_retry("dead_letter_delete", || async {
                    sqlx::query("DELETE FROM dead_letters WHERE operation_key = ?")
                        .bind(key)
                        .execute(pool)
                        .await
                })
                .await
                .map(|_| ())
                .map_err(Into::into),
            };

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(operation_key = %key, error = %e, "Failed to flush dead letter");
                    self.dirty.lock().insert(key.clone());
                }
            }
        }

        debug!(flushed, errors, "Flushed dead letters");
        if errors > 0 {
            return Err(crate::error::FixtureSyncError::Internal(format!(
                "Failed to flush {} dead letters",
                errors
            )));
        }
        Ok(flushed)
    }
}
