// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tiered read-through cache.
//!
//! # Tier Order
//!
//! ```text
//!   read(key)
//!     │
//!     ├─► Memory      LRU, TTL-checked                      ─┐
//!     ├─► Local       SQLite cache_records, TTL-checked      │ first hit wins,
//!     ├─► Offline     last-known-good snapshot (offline only)│ faster tiers
//!     ├─► RemoteDb    mirror lookup (remote_db breaker)      │ back-filled
//!     ├─► OriginApi   loader (origin_api breaker, limiter)  ─┘
//!     │
//!     └─► origin failed or skipped:
//!           stale fallback  memory → local → offline snapshot
//!           nothing at all  → error
//! ```
//!
//! Reads never fail while any tier still holds data for the key; stale
//! results carry `from_cache = true, stale = true` so the UI can flag them.
//!
//! The memory lock is a `parking_lot` mutex and is never held across an
//! await point.

pub mod memory;
pub mod store;

pub use memory::{EntryInfo, InsertOutcome, MemoryTier};
pub use store::{
    InMemoryTierStore, NoRemote, RemoteSource, SqliteTierStore, StoredRecord, TierStore, TierTable,
};

use crate::circuit_breaker::{names, CircuitBreaker, CircuitConfig};
use crate::classifier::{classify, OperationContext};
use crate::clock::SharedClock;
use crate::connectivity::Connectivity;
use crate::error::{FixtureSyncError, Result};
use crate::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where a read was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Memory,
    Local,
    Offline,
    RemoteDb,
    OriginApi,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
            Self::Offline => "offline",
            Self::RemoteDb => "remote_db",
            Self::OriginApi => "origin_api",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheResult<T> {
    pub data: T,
    pub tier: CacheTier,
    /// `false` only for data that came straight from the origin.
    pub from_cache: bool,
    /// When the data was last fetched from a source (epoch ms).
    pub timestamp: i64,
    /// Served because fresher sources were unavailable.
    pub stale: bool,
}

/// Bounds on what the stale fallback may serve.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleFallbackPolicy {
    pub enabled: bool,
    /// Data older than this is treated as absent. `None` means no bound.
    pub max_stale_age: Option<Duration>,
    /// Whether the offline snapshot may be served when online.
    pub use_offline_snapshot: bool,
}

impl Default for StaleFallbackPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_stale_age: None,
            use_offline_snapshot: true,
        }
    }
}

impl StaleFallbackPolicy {
    fn admits(&self, age_ms: i64) -> bool {
        self.max_stale_age
            .map_or(true, |max| age_ms <= max.as_millis() as i64)
    }
}

/// Runtime cache settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    /// TTL used when a read or set passes `None`.
    pub default_ttl: Duration,
    pub remote_timeout: Duration,
    pub origin_timeout: Duration,
    /// Concurrent origin loads allowed.
    pub origin_concurrency: usize,
    /// Token bucket in front of the origin. `None` disables limiting.
    pub origin_rate_limit: Option<RateLimitConfig>,
    pub stale: StaleFallbackPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 10 * 1024 * 1024,
            default_ttl: Duration::from_secs(5 * 60),
            remote_timeout: Duration::from_secs(5),
            origin_timeout: Duration::from_secs(15),
            origin_concurrency: 4,
            origin_rate_limit: Some(RateLimitConfig::default()),
            stale: StaleFallbackPolicy::default(),
        }
    }
}

impl CacheConfig {
    pub fn for_testing() -> Self {
        Self {
            max_entries: 50,
            max_bytes: 64 * 1024,
            default_ttl: Duration::from_secs(60),
            remote_timeout: Duration::from_millis(100),
            origin_timeout: Duration::from_millis(200),
            origin_concurrency: 2,
            origin_rate_limit: None,
            stale: StaleFallbackPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierHits {
    pub memory: u64,
    pub local: u64,
    pub offline: u64,
    pub remote_db: u64,
    pub origin_api: u64,
}

/// Point-in-time cache figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Estimated bytes held by the memory tier.
    pub size: usize,
    pub max_size: usize,
    pub entry_count: usize,
    /// `size / max_size`.
    pub utilization: f64,
    pub hits: TierHits,
    pub misses: u64,
    pub evictions: u64,
    pub stale_served: u64,
    pub rejected: u64,
    /// Memory entries from least to most recently used.
    pub entries: Vec<EntryInfo>,
}

#[derive(Debug, Default)]
struct Counters {
    memory: AtomicU64,
    local: AtomicU64,
    offline: AtomicU64,
    remote_db: AtomicU64,
    origin_api: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn hit(&self, tier: CacheTier) {
        let counter = match tier {
            CacheTier::Memory => &self.memory,
            CacheTier::Local => &self.local,
            CacheTier::Offline => &self.offline,
            CacheTier::RemoteDb => &self.remote_db,
            CacheTier::OriginApi => &self.origin_api,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_hit(tier.as_str());
    }

    fn hits(&self) -> TierHits {
        TierHits {
            memory: self.memory.load(Ordering::Relaxed),
            local: self.local.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            remote_db: self.remote_db.load(Ordering::Relaxed),
            origin_api: self.origin_api.load(Ordering::Relaxed),
        }
    }
}

/// Read-through cache across memory, local, offline, remote and origin tiers.
pub struct TieredCache {
    config: CacheConfig,
    memory: Mutex<MemoryTier>,
    local: Arc<dyn TierStore>,
    offline: Arc<dyn TierStore>,
    remote: Option<Arc<dyn RemoteSource>>,
    origin_breaker: Arc<CircuitBreaker>,
    remote_breaker: Arc<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
    bulkhead: Bulkhead,
    connectivity: watch::Receiver<Connectivity>,
    clock: SharedClock,
    counters: Counters,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("local", &self.local.name())
            .field("offline", &self.offline.name())
            .field("remote", &self.remote.is_some())
            .field("entries", &self.memory.lock().len())
            .finish()
    }
}

impl TieredCache {
    /// Cache with in-memory durable tiers and no remote mirror.
    pub fn new(config: CacheConfig, clock: SharedClock, connectivity: watch::Receiver<Connectivity>) -> Self {
        let origin_breaker = Arc::new(CircuitBreaker::with_clock(
            names::ORIGIN_API,
            CircuitConfig::default(),
            clock.clone(),
        ));
        let remote_breaker = Arc::new(CircuitBreaker::with_clock(
            names::REMOTE_DB,
            CircuitConfig::default(),
            clock.clone(),
        ));
        Self {
            memory: Mutex::new(MemoryTier::new(config.max_entries, config.max_bytes)),
            local: Arc::new(InMemoryTierStore::new("local")),
            offline: Arc::new(InMemoryTierStore::new("offline")),
            remote: None,
            origin_breaker,
            remote_breaker,
            rate_limiter: config.origin_rate_limit.clone().map(RateLimiter::new),
            bulkhead: Bulkhead::new(config.origin_concurrency),
            connectivity,
            clock,
            counters: Counters::default(),
            config,
        }
    }

    pub fn with_local_store(mut self, store: Arc<dyn TierStore>) -> Self {
        self.local = store;
        self
    }

    pub fn with_offline_store(mut self, store: Arc<dyn TierStore>) -> Self {
        self.offline = store;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_origin_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.origin_breaker = breaker;
        self
    }

    pub fn with_remote_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.remote_breaker = breaker;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn origin_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.origin_breaker
    }

    fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Read path
    // ═══════════════════════════════════════════════════════════════════════════

    /// Resolve `key` across the tiers, calling `loader` only if no faster tier
    /// holds fresh data.
    ///
    /// Returns an error only when the origin could not be used and no tier
    /// (within the stale policy) has anything for the key.
    pub async fn read<T, F, Fut, E>(&self, key: &str, loader: F, ttl: Option<Duration>) -> Result<CacheResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let now = self.clock.now_millis();
        let online = self.is_online();

        // 1. Memory
        let fresh = self.memory.lock().get_fresh(key, now);
        if let Some(entry) = fresh {
            match serde_json::from_slice::<T>(&entry.payload) {
                Ok(data) => return Ok(self.hit(key, data, CacheTier::Memory, entry.created_at, false)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Memory entry does not match requested type, dropping");
                    self.memory.lock().remove(key);
                }
            }
        }

        // 2. Local
        if let Some(record) = self.load_tier(&*self.local, key).await {
            if record.is_fresh(now) {
                if let Some(data) = decode::<T>(key, &record.data) {
                    self.put_memory(key, &record.data, now, ttl);
                    return Ok(self.hit(key, data, CacheTier::Local, record.timestamp, false));
                }
            }
        }

        // 3. Offline snapshot, consulted in order only while offline
        if !online {
            if let Some(record) = self.load_tier(&*self.offline, key).await {
                if let Some(data) = decode::<T>(key, &record.data) {
                    return Ok(self.hit(key, data, CacheTier::Offline, record.timestamp, true));
                }
            }
        }

        // 4. Remote mirror
        if online {
            if let Some(value) = self.fetch_remote(key).await {
                if let Some(data) = decode::<T>(key, &value) {
                    self.backfill(key, &value, now, ttl, true).await;
                    return Ok(self.hit(key, data, CacheTier::RemoteDb, now, false));
                }
            }
        }

        // 5. Origin
        let origin_err = match self.load_origin(key, loader).await {
            Ok(data) => match serde_json::to_value(&data) {
                Ok(value) => {
                    self.backfill(key, &value, now, ttl, true).await;
                    return Ok(self.hit(key, data, CacheTier::OriginApi, now, false));
                }
                Err(e) => FixtureSyncError::from(e),
            },
            Err(e) => e,
        };

        // 6. Stale fallback
        if self.config.stale.enabled {
            if let Some(result) = self.stale_fallback::<T>(key, now, online).await {
                debug!(key = %key, tier = %result.tier, reason = %origin_err, "Serving stale data");
                return Ok(result);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_miss();
        Err(origin_err)
    }

    fn hit<T>(&self, key: &str, data: T, tier: CacheTier, timestamp: i64, stale: bool) -> CacheResult<T> {
        self.counters.hit(tier);
        debug!(key = %key, tier = %tier, stale, "Cache read resolved");
        CacheResult {
            data,
            tier,
            from_cache: tier != CacheTier::OriginApi,
            timestamp,
            stale,
        }
    }

    async fn load_tier(&self, store: &dyn TierStore, key: &str) -> Option<StoredRecord> {
        match store.load(key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(tier = store.name(), key = %key, error = %e, "Tier load failed, skipping");
                None
            }
        }
    }

    async fn fetch_remote(&self, key: &str) -> Option<Value> {
        let remote = self.remote.as_ref()?;
        if !self.remote_breaker.can_execute() {
            debug!(key = %key, "Remote mirror breaker open, skipping");
            return None;
        }
        match tokio::time::timeout(self.config.remote_timeout, remote.fetch(key)).await {
            Ok(Ok(value)) => {
                self.remote_breaker.on_success();
                value
            }
            Ok(Err(e)) => {
                self.remote_breaker.on_failure(e.to_string());
                warn!(key = %key, error = %e, "Remote mirror lookup failed");
                None
            }
            Err(_) => {
                self.remote_breaker.on_failure("remote lookup timed out");
                warn!(key = %key, timeout_ms = self.config.remote_timeout.as_millis() as u64, "Remote mirror lookup timed out");
                None
            }
        }
    }

    async fn load_origin<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.is_online() {
            return Err(FixtureSyncError::Offline(format!("origin read for {key} skipped")));
        }
        if !self.origin_breaker.can_execute() {
            let rec = self.origin_breaker.recommendation();
            return Err(FixtureSyncError::CircuitOpen {
                circuit: names::ORIGIN_API.to_string(),
                reason: rec.reason,
            });
        }
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.try_acquire() {
                return Err(FixtureSyncError::RateLimited(format!("origin read for {key}")));
            }
        }
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|e| FixtureSyncError::Internal(e.to_string()))?;

        match tokio::time::timeout(self.config.origin_timeout, loader()).await {
            Ok(Ok(data)) => {
                self.origin_breaker.on_success();
                Ok(data)
            }
            Ok(Err(e)) => {
                let classified = classify(&e, &OperationContext::new("cache_read").with_resource(key));
                self.origin_breaker.on_failure(classified.message.clone());
                warn!(
                    key = %key,
                    category = %classified.category,
                    retryable = classified.retryable,
                    error = %classified.message,
                    "Origin load failed"
                );
                Err(FixtureSyncError::CacheMiss {
                    key: key.to_string(),
                    message: format!("{}: {}", classified.category, classified.message),
                })
            }
            Err(_) => {
                self.origin_breaker.on_failure("origin load timed out");
                warn!(key = %key, timeout_ms = self.config.origin_timeout.as_millis() as u64, "Origin load timed out");
                Err(FixtureSyncError::timeout("cache_read", self.config.origin_timeout))
            }
        }
    }

    async fn stale_fallback<T: DeserializeOwned>(&self, key: &str, now: i64, online: bool) -> Option<CacheResult<T>> {
        let policy = &self.config.stale;

        let memory = self.memory.lock().peek(key).map(|e| (e.payload.clone(), e.created_at));
        if let Some((payload, created_at)) = memory {
            if policy.admits(now - created_at) {
                if let Ok(data) = serde_json::from_slice::<T>(&payload) {
                    return Some(self.stale_hit(data, CacheTier::Memory, created_at));
                }
            }
        }

        if let Some(record) = self.load_tier(&*self.local, key).await {
            if policy.admits(record.age_ms(now)) {
                if let Some(data) = decode::<T>(key, &record.data) {
                    return Some(self.stale_hit(data, CacheTier::Local, record.timestamp));
                }
            }
        }

        // While offline the snapshot was already tried in tier order.
        if online && policy.use_offline_snapshot {
            if let Some(record) = self.load_tier(&*self.offline, key).await {
                if policy.admits(record.age_ms(now)) {
                    if let Some(data) = decode::<T>(key, &record.data) {
                        return Some(self.stale_hit(data, CacheTier::Offline, record.timestamp));
                    }
                }
            }
        }
        None
    }

    fn stale_hit<T>(&self, data: T, tier: CacheTier, timestamp: i64) -> CacheResult<T> {
        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_stale_served(tier.as_str());
        CacheResult {
            data,
            tier,
            from_cache: true,
            timestamp,
            stale: true,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════════

    fn put_memory(&self, key: &str, value: &Value, created_at: i64, ttl: Duration) {
        let payload = match serde_json::to_vec(value) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode memory entry");
                return;
            }
        };
        let now = self.clock.now_millis();
        let (outcome, bytes, entries) = {
            let mut memory = self.memory.lock();
            let outcome = memory.insert(key, payload, created_at, ttl, now);
            (outcome, memory.total_bytes(), memory.len())
        };
        match outcome {
            InsertOutcome::Inserted { evicted } => {
                if !evicted.is_empty() {
                    debug!(key = %key, evicted = evicted.len(), "Evicted LRU entries");
                    crate::metrics::record_cache_evictions(evicted.len());
                }
            }
            InsertOutcome::Rejected { size } => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    size,
                    max_bytes = self.config.max_bytes,
                    "Entry larger than memory tier, not cached in memory"
                );
                crate::metrics::record_cache_rejection();
            }
        }
        crate::metrics::set_cache_size(bytes, entries);
    }

    /// Write memory and local, plus the offline snapshot when `snapshot`.
    async fn backfill(&self, key: &str, value: &Value, now: i64, ttl: Duration, snapshot: bool) {
        self.put_memory(key, value, now, ttl);
        let ttl_ms = Some(ttl.as_millis() as u64);
        if let Err(e) = self.local.save(key, StoredRecord::new(value.clone(), now, ttl_ms)).await {
            warn!(key = %key, error = %e, "Local tier write failed");
        }
        if snapshot {
            if let Err(e) = self.offline.save(key, StoredRecord::new(value.clone(), now, None)).await {
                warn!(key = %key, error = %e, "Offline snapshot write failed");
            }
        }
    }

    /// Store known-good data in memory, the local tier and the offline snapshot.
    pub async fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) -> Result<()> {
        let value = serde_json::to_value(data)?;
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let now = self.clock.now_millis();
        self.put_memory(key, &value, now, ttl);
        self.local
            .save(key, StoredRecord::new(value.clone(), now, Some(ttl.as_millis() as u64)))
            .await?;
        self.offline.save(key, StoredRecord::new(value, now, None)).await
    }

    /// Fresh memory-tier value only; never touches slower tiers.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now_millis();
        let entry = self.memory.lock().get_fresh(key, now)?;
        serde_json::from_slice(&entry.payload).ok()
    }

    /// Patch top-level fields of an object held in memory, local and the
    /// offline snapshot.
    ///
    /// Timestamps are left alone so the record keeps its freshness window.
    /// Returns whether any tier held an object to patch.
    pub async fn apply_field_changes<I>(&self, key: &str, changes: I) -> Result<bool>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let changes: Vec<(String, Value)> = changes.into_iter().collect();
        if changes.is_empty() {
            return Ok(false);
        }
        let mut patched = false;

        let memory = self.memory.lock().peek(key).cloned();
        if let Some(entry) = memory {
            if let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(&entry.payload) {
                for (field, value) in &changes {
                    object.insert(field.clone(), value.clone());
                }
                let value = Value::Object(object);
                self.put_memory(key, &value, entry.created_at, entry.ttl);
                patched = true;
            }
        }

        for store in [&*self.local, &*self.offline] {
            if let Some(mut record) = self.load_tier(store, key).await {
                if let Value::Object(object) = &mut record.data {
                    for (field, value) in &changes {
                        object.insert(field.clone(), value.clone());
                    }
                    store.save(key, record).await?;
                    patched = true;
                }
            }
        }

        if patched {
            debug!(key = %key, fields = changes.len(), "Applied field changes");
        }
        Ok(patched)
    }

    /// Remove `key` from memory, local and offline tiers.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let in_memory = self.memory.lock().remove(key);
        let in_local = self.local.remove(key).await?;
        let in_offline = self.offline.remove(key).await?;
        let removed = in_memory || in_local || in_offline;
        if removed {
            info!(key = %key, "Invalidated cache entry");
        }
        Ok(removed)
    }

    /// Empty every tier.
    pub async fn clear(&self) -> Result<()> {
        self.memory.lock().clear();
        self.local.clear().await?;
        self.offline.clear().await?;
        crate::metrics::set_cache_size(0, 0);
        info!("Cache cleared");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now_millis();
        let memory = self.memory.lock();
        let size = memory.total_bytes();
        let max_size = memory.max_bytes();
        CacheStats {
            size,
            max_size,
            entry_count: memory.len(),
            utilization: if max_size == 0 { 0.0 } else { size as f64 / max_size as f64 },
            hits: self.counters.hits(),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: memory.evictions(),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            entries: memory.entry_infos(now),
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(key = %key, error = %e, "Cached value does not match requested type");
            None
        }
    }
}
