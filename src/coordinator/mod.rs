// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service facade.
//!
//! [`FixtureSync`] owns one instance of every component and wires them:
//! - Reads go through the [`TieredCache`]; a stale result enqueues a refresh
//!   task so fresh data arrives once the origin is reachable again.
//! - The [`SyncTaskQueue`] worker drains on connectivity restore, on enqueue,
//!   and on a periodic safety-net interval.
//! - Due dead letters are re-enqueued on the replay interval, expired ones
//!   are swept, and the store is flushed to SQLite.
//! - Change batches from the subscription manager are merged field by field
//!   into cached `"{table}:{entity_id}"` records.
//!
//! Breakers live in one [`CircuitRegistry`]: `origin_api` guards both the
//! cache's origin loads and queue execution, `remote_db` the mirror tier,
//! and `change_stream` the subscription handshakes.

mod types;

pub use types::{EngineState, HealthCheck, QueueReport, SyncStatus};

use crate::cache::{
    CacheResult, CacheStats, RemoteSource, SqliteTierStore, TieredCache,
};
use crate::circuit_breaker::{names, CircuitConfig, CircuitRegistry};
use crate::classifier::OperationContext;
use crate::clock::{SharedClock, SystemClock};
use crate::config::FixtureSyncConfig;
use crate::connectivity::Connectivity;
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::error::{FixtureSyncError, Result};
use crate::metrics;
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::storage::SqliteStorage;
use crate::subscription::{
    ChangeEventSubscriptionManager, ChangeStream, EventBatch, EventType, NoOpChangeStream, Subscription,
    SubscriptionId, SubscriptionStatus,
};
use crate::sync_queue::{parse_replay_payload, DrainReport, NoOpExecutor, SyncTaskQueue, TaskExecutor, TaskId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Task kind enqueued when a read had to fall back to stale data.
pub const REFRESH_TASK: &str = "refresh";

/// Task kind enqueued by [`FixtureSync::force_sync_all`].
pub const SYNC_ALL_TASK: &str = "sync_all";

/// Cache key under which change events for an entity are merged.
pub fn entity_key(table: &str, entity_id: &str) -> String {
    format!("{}:{}", table, entity_id)
}

/// Collaborators supplied by the host app.
pub struct Backends<X, S> {
    pub executor: Arc<X>,
    pub stream: Arc<S>,
    pub remote: Option<Arc<dyn RemoteSource>>,
    pub clock: SharedClock,
}

impl<X: TaskExecutor, S: ChangeStream> Backends<X, S> {
    pub fn new(executor: Arc<X>, stream: Arc<S>) -> Self {
        Self {
            executor,
            stream,
            remote: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

/// The fixture data service.
///
/// Construct with [`open()`](Self::open), then [`start()`](Self::start) the
/// background workers. Everything except background draining works before
/// `start()`.
pub struct FixtureSync<X: TaskExecutor = NoOpExecutor, S: ChangeStream = NoOpChangeStream> {
    config: FixtureSyncConfig,
    retry_config: RetryConfig,
    connectivity: watch::Receiver<Connectivity>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    storage: Option<SqliteStorage>,
    circuits: Arc<CircuitRegistry>,
    cache: Arc<TieredCache>,
    queue: Arc<SyncTaskQueue<X>>,
    subscriptions: ChangeEventSubscriptionManager<S>,
    dead_letters: Arc<DeadLetterStore>,
    retry: RetryExecutor,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl FixtureSync<NoOpExecutor, NoOpChangeStream> {
    /// Service with no-op executor and change stream (cache-only use, tests).
    pub async fn open_standalone(
        config: FixtureSyncConfig,
        connectivity: watch::Receiver<Connectivity>,
    ) -> Result<Self> {
        Self::open(config, Arc::new(NoOpExecutor), Arc::new(NoOpChangeStream::default()), connectivity).await
    }
}

impl<X: TaskExecutor, S: ChangeStream> FixtureSync<X, S> {
    pub async fn open(
        config: FixtureSyncConfig,
        executor: Arc<X>,
        stream: Arc<S>,
        connectivity: watch::Receiver<Connectivity>,
    ) -> Result<Self> {
        Self::open_with(config, Backends::new(executor, stream), connectivity).await
    }

    /// Open storage and build every component. Nothing is spawned yet.
    pub async fn open_with(
        config: FixtureSyncConfig,
        backends: Backends<X, S>,
        connectivity: watch::Receiver<Connectivity>,
    ) -> Result<Self> {
        let clock = backends.clock;
        let circuits = Arc::new(CircuitRegistry::new(clock.clone(), CircuitConfig::default()));
        let origin_breaker =
            circuits.get_or_create(names::ORIGIN_API, config.circuits.origin_api.to_circuit_config());
        let stream_breaker =
            circuits.get_or_create(names::CHANGE_STREAM, config.circuits.change_stream.to_circuit_config());
        let remote_breaker = circuits.get_or_create(names::REMOTE_DB, config.circuits.remote_db.to_circuit_config());

        let policy = config.dead_letter.to_policy();
        let cache = TieredCache::new(config.cache.to_cache_config(), clock.clone(), connectivity.clone());

        let (storage, dead_letters, cache) = match &config.storage.sqlite_path {
            Some(path) => {
                let storage = SqliteStorage::open(path).await?;
                let dead_letters = DeadLetterStore::open(storage.clone(), policy, clock.clone()).await?;
                let cache = cache
                    .with_local_store(Arc::new(SqliteTierStore::local(storage.clone())))
                    .with_offline_store(Arc::new(SqliteTierStore::offline(storage.clone())));
                (Some(storage), dead_letters, cache)
            }
            None => {
                debug!("No sqlite_path configured, durable tiers kept in memory");
                (None, DeadLetterStore::new(policy, clock.clone()), cache)
            }
        };

        let mut cache = cache
            .with_origin_breaker(Arc::clone(&origin_breaker))
            .with_remote_breaker(remote_breaker);
        if let Some(remote) = backends.remote {
            cache = cache.with_remote(remote);
        }

        let dead_letters = Arc::new(dead_letters);
        let queue = SyncTaskQueue::new(
            config.queue.to_queue_config(),
            backends.executor,
            origin_breaker,
            Arc::clone(&dead_letters),
            clock.clone(),
            connectivity.clone(),
        );
        let subscriptions = ChangeEventSubscriptionManager::new(
            config.subscription.to_subscription_config(),
            backends.stream,
            stream_breaker,
            clock,
        );

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_engine_state(EngineState::Created.as_str());

        info!(
            persistent = storage.is_some(),
            restored_dead_letters = dead_letters.len(),
            "Fixture sync opened"
        );

        Ok(Self {
            retry_config: config.retry.to_retry_config(),
            config,
            connectivity,
            state_tx,
            state_rx,
            storage,
            circuits,
            cache: Arc::new(cache),
            queue: Arc::new(queue),
            subscriptions,
            retry: RetryExecutor::new(Arc::clone(&dead_letters)),
            dead_letters,
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state.as_str());
    }

    /// Spawn the queue worker, dead-letter maintenance and change merge.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(FixtureSyncError::InvalidState {
                expected: EngineState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            online = self.connectivity.borrow().is_online(),
            "Starting fixture sync"
        );
        self.set_state(EngineState::Starting);

        let swept = self.dead_letters.sweep();
        if swept > 0 {
            info!(swept, "Expired dead letters on startup");
        }

        let queue = Arc::clone(&self.queue);
        let shutdown_rx = self.shutdown_rx.clone();
        self.handles.push(tokio::spawn(async move {
            queue.run(shutdown_rx).await;
        }));

        let maintenance = run_dead_letter_maintenance(
            Arc::clone(&self.dead_letters),
            Arc::clone(&self.queue),
            self.connectivity.clone(),
            self.config.dead_letter.replay_interval(),
            self.shutdown_rx.clone(),
        );
        self.handles.push(tokio::spawn(
            maintenance.instrument(tracing::info_span!("dead_letter_maintenance")),
        ));

        let merge = run_change_merge(
            Arc::clone(&self.cache),
            self.subscriptions.observe(),
            self.shutdown_rx.clone(),
        );
        self.handles.push(tokio::spawn(merge.instrument(tracing::info_span!("change_merge"))));

        self.set_state(EngineState::Running);
        info!(tasks = self.handles.len(), "Fixture sync running");
        Ok(())
    }

    /// Stop workers, close channels, flush dead letters and close storage.
    ///
    /// In-flight task executions finish; nothing is cancelled mid-attempt
    /// unless it outlives the drain timeout.
    pub async fn shutdown(&mut self) {
        info!("Shutting down fixture sync");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        self.subscriptions.cleanup().await;

        let handles = std::mem::take(&mut self.handles);
        let drain_timeout = Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        match self.dead_letters.flush_dirty().await {
            Ok(0) => {}
            Ok(flushed) => info!(flushed, "Dead letters flushed"),
            Err(e) => warn!(error = %e, "Failed to flush dead letters on shutdown"),
        }

        if let Some(storage) = self.storage.take() {
            storage.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Fixture sync stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Tiered read. A stale result also queues one refresh task for `key`.
    pub async fn read<T, F, Fut, E>(&self, key: &str, loader: F, ttl: Option<Duration>) -> Result<CacheResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let result = self.cache.read(key, loader, ttl).await?;
        if result.stale {
            self.queue_refresh(key);
        }
        Ok(result)
    }

    fn queue_refresh(&self, key: &str) {
        let filter = json!({ "key": key });
        let already_queued = self
            .queue
            .pending()
            .iter()
            .any(|t| t.kind == REFRESH_TASK && t.target_filter == filter);
        if already_queued {
            return;
        }
        let task_id = self.queue.enqueue(REFRESH_TASK, filter);
        debug!(key = %key, task_id, "Stale read, refresh queued");
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fire-and-forget; the worker picks it up.
    pub fn enqueue_task(&self, kind: impl Into<String>, target_filter: Value) -> TaskId {
        self.queue.enqueue(kind, target_filter)
    }

    /// Queue a full sync for `target_filter` and drain until settled.
    ///
    /// The task is queued even when offline, so it runs on the next restore;
    /// the call itself then fails with `Offline`.
    pub async fn force_sync_all(&self, target_filter: Value) -> Result<DrainReport> {
        self.queue.enqueue(SYNC_ALL_TASK, target_filter);
        self.queue.force_drain_all().await
    }

    /// Run `op` under the configured retry schedule, dead-lettering on
    /// terminal failure.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        operation_key: &str,
        context: OperationContext,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.retry
            .execute_with_retry(operation_key, context, &self.retry_config, op)
            .await
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.queue.status()
    }

    pub fn queue_status(&self) -> QueueReport {
        QueueReport {
            status: self.queue.status(),
            pending: self.queue.pending(),
            circuit: self.queue.breaker().state(),
            dead_letters: self.dead_letters.stats(),
        }
    }

    pub fn queue(&self) -> &Arc<SyncTaskQueue<X>> {
        &self.queue
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn subscribe(
        &self,
        entity_ids: Vec<String>,
        event_types: Vec<EventType>,
        batch_delay: Option<Duration>,
    ) -> Result<Subscription> {
        self.subscriptions.subscribe(entity_ids, event_types, batch_delay).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id).await
    }

    pub fn subscription_status(&self) -> SubscriptionStatus {
        self.subscriptions.status()
    }

    pub fn subscriptions(&self) -> &ChangeEventSubscriptionManager<S> {
        &self.subscriptions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Diagnostics
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.list()
    }

    pub fn dead_letter_store(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    /// Health snapshot for diagnostics. Performs no I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let connectivity = *self.connectivity.borrow();
        let workers_alive = !self.handles.is_empty() && self.handles.iter().all(|h| !h.is_finished());
        let ready = state == EngineState::Running && workers_alive;
        let healthy = ready && connectivity.is_online() && !self.circuits.any_open();

        HealthCheck {
            state,
            connectivity,
            ready,
            healthy,
            queue_length: self.queue.len(),
            active_channels: self.subscriptions.status().active_channels,
            cache_entries: self.cache.stats().entry_count,
            dead_letters: self.dead_letters.stats(),
            circuits: self.circuits.snapshots(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Background tasks
// ═══════════════════════════════════════════════════════════════════════════════

/// Re-enqueue dead letters whose cooldown has elapsed.
///
/// Entries without a replay payload (direct `execute_with_retry` failures)
/// are left for the sweep. Returns how many tasks were enqueued.
pub fn replay_due<X: TaskExecutor>(dead_letters: &DeadLetterStore, queue: &SyncTaskQueue<X>) -> usize {
    let mut replayed = 0;
    for entry in dead_letters.due_for_retry() {
        let Some((kind, filter, max_retries)) = parse_replay_payload(&entry) else {
            continue;
        };
        if !dead_letters.mark_retrying(&entry.operation_key) {
            continue;
        }
        let max_retries = max_retries.unwrap_or(queue.config().max_retries);
        let task_id = queue.enqueue_with_retries(kind, filter, max_retries);
        debug!(
            operation_key = %entry.operation_key,
            task_id,
            prior_attempts = entry.retry_count,
            "Dead letter replayed"
        );
        replayed += 1;
    }
    replayed
}

async fn run_dead_letter_maintenance<X: TaskExecutor>(
    dead_letters: Arc<DeadLetterStore>,
    queue: Arc<SyncTaskQueue<X>>,
    connectivity: watch::Receiver<Connectivity>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(interval_secs = interval.as_secs(), "Starting dead letter maintenance");

    loop {
        tokio::select! {
            biased;

            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    debug!("Dead letter maintenance stopping");
                    break;
                }
            }

            _ = timer.tick() => {
                dead_letters.sweep();
                if connectivity.borrow().is_online() {
                    let replayed = replay_due(&dead_letters, &queue);
                    if replayed > 0 {
                        info!(replayed, "Dead letters re-enqueued");
                    }
                }
                if let Err(e) = dead_letters.flush_dirty().await {
                    warn!(error = %e, "Failed to flush dead letters");
                }
                metrics::set_dead_letters(dead_letters.len());
            }
        }
    }
}

/// Patch cached records with the new field values in `batch`.
/// Returns how many events touched a cached record.
pub async fn merge_batch(cache: &TieredCache, batch: &EventBatch) -> usize {
    let mut merged = 0;
    for event in &batch.events {
        let key = entity_key(&event.table, &event.entity_id);
        match cache.apply_field_changes(&key, event.new_values()).await {
            Ok(true) => merged += 1,
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to merge change into cache"),
        }
    }
    merged
}

async fn run_change_merge(
    cache: Arc<TieredCache>,
    mut batches: broadcast::Receiver<EventBatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    debug!("Change merge stopping");
                    break;
                }
            }

            received = batches.recv() => match received {
                Ok(batch) => {
                    let merged = merge_batch(&cache, &batch).await;
                    debug!(seq = batch.seq, events = batch.events.len(), merged, "Change batch merged");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change merge lagging, batches skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
