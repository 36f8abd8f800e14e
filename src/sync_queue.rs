// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background synchronization queue.
//!
//! Refresh and write-forward work is expressed as [`SyncTask`]s and executed
//! by a [`TaskExecutor`] whenever the device is online.
//!
//! # Drain Pass
//!
//! ```text
//!   snapshot + clear queue
//!        │
//!        ▼  (enqueue order, `concurrency` in flight)
//!   breaker refuses ──► requeue, retry not consumed
//!   success         ──► breaker success, dead letter resolved
//!   failure         ──► breaker failure, classify
//!        ├─ non-retryable              ──► dead letter (FAILED)
//!        ├─ retry_count < max_retries  ──► retry_count += 1, requeue at back
//!        └─ otherwise                  ──► retry_count += 1, dead letter
//! ```
//!
//! # Scheduling
//!
//! [`SyncTaskQueue::run`] is the worker loop. It drains when woken by
//! `enqueue`, when connectivity is restored, on a fixed periodic interval as
//! a safety net, and after a cooldown following any pass that left work
//! behind. Losing connectivity cancels the pending cooldown.

use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{classify_error, ClassifiedError, OperationContext};
use crate::clock::SharedClock;
use crate::connectivity::Connectivity;
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::error::{FixtureSyncError, Result};
use crate::BoxFuture;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn, Instrument};

pub type TaskId = u64;

/// Lifecycle of a task within the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Succeeded,
    Failed,
    Requeued,
    DeadLettered,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of remote work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: TaskId,
    /// What to do, e.g. `"refresh_fixtures"`.
    pub kind: String,
    /// Which records it applies to.
    pub target_filter: Value,
    pub enqueued_at: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: TaskState,
}

impl SyncTask {
    /// Dead-letter identity: one entry per distinct kind and filter.
    pub fn operation_key(&self) -> String {
        format!("{}:{}", self.kind, self.target_filter)
    }

    /// What a dead letter needs to rebuild this task.
    pub fn replay_payload(&self) -> Value {
        json!({
            "kind": self.kind,
            "target_filter": self.target_filter,
            "max_retries": self.max_retries,
        })
    }
}

/// Kind, filter and retry bound recovered from a dead letter's payload.
pub fn parse_replay_payload(entry: &DeadLetterEntry) -> Option<(String, Value, Option<u32>)> {
    let payload = entry.payload.as_ref()?;
    let kind = payload.get("kind")?.as_str()?.to_string();
    let filter = payload.get("target_filter").cloned().unwrap_or(Value::Null);
    let max_retries = payload
        .get("max_retries")
        .and_then(Value::as_u64)
        .map(|n| n as u32);
    Some((kind, filter, max_retries))
}

/// Performs a task against the remote side.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute<'a>(&'a self, task: &'a SyncTask) -> BoxFuture<'a, ()>;
}

/// Executor that succeeds without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpExecutor;

impl TaskExecutor for NoOpExecutor {
    fn execute<'a>(&'a self, task: &'a SyncTask) -> BoxFuture<'a, ()> {
        debug!(task_id = task.id, kind = %task.kind, "NoOp executor: skipping task");
        Box::pin(async { Ok(()) })
    }
}

/// Queue behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Retry bound given to new tasks.
    pub max_retries: u32,
    /// Wait before re-draining a pass that left work behind.
    pub retry_cooldown: Duration,
    /// Safety-net pass interval while online.
    pub periodic_interval: Duration,
    /// Tasks executed at once; outcomes are still applied in order.
    pub concurrency: usize,
    /// Bound on a single task execution.
    pub task_timeout: Duration,
    /// Passes `force_drain_all` makes before giving up.
    pub max_force_passes: u32,
    /// Pause between forced passes.
    pub force_pass_delay: Duration,
    /// Capacity of the outcome broadcast.
    pub outcome_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_cooldown: Duration::from_secs(5),
            periodic_interval: Duration::from_secs(5 * 60),
            concurrency: 1,
            task_timeout: Duration::from_secs(30),
            max_force_passes: 5,
            force_pass_delay: Duration::from_secs(1),
            outcome_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn for_testing() -> Self {
        Self {
            max_retries: 2,
            retry_cooldown: Duration::from_millis(50),
            periodic_interval: Duration::from_secs(1),
            concurrency: 1,
            task_timeout: Duration::from_millis(500),
            max_force_passes: 5,
            force_pass_delay: Duration::from_millis(10),
            outcome_capacity: 64,
        }
    }
}

/// Result of one task within a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub kind: String,
    pub operation_key: String,
    pub state: TaskState,
    pub retry_count: u32,
    pub error: Option<ClassifiedError>,
}

/// Totals for one or more drain passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub passes: u32,
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Refused by an open breaker; requeued without consuming a retry.
    pub deferred: usize,
    /// Queue length once the pass finished.
    pub remaining: usize,
}

impl DrainReport {
    fn absorb(&mut self, pass: &DrainReport) {
        self.passes += pass.passes;
        self.attempted += pass.attempted;
        self.succeeded += pass.succeeded;
        self.requeued += pass.requeued;
        self.dead_lettered += pass.dead_lettered;
        self.deferred += pass.deferred;
        self.remaining = pass.remaining;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_processing: bool,
    /// Epoch ms of the last pass that executed anything.
    pub last_sync_attempt: Option<i64>,
}

enum Execution {
    Deferred,
    Succeeded,
    Failed(FixtureSyncError),
}

/// FIFO of [`SyncTask`]s drained under breaker protection.
pub struct SyncTaskQueue<X: TaskExecutor = NoOpExecutor> {
    config: QueueConfig,
    executor: Arc<X>,
    breaker: Arc<CircuitBreaker>,
    dead_letters: Arc<DeadLetterStore>,
    clock: SharedClock,
    connectivity: watch::Receiver<Connectivity>,
    tasks: Mutex<VecDeque<SyncTask>>,
    drain_lock: tokio::sync::Mutex<()>,
    processing: AtomicBool,
    last_sync_attempt: AtomicI64,
    next_id: AtomicU64,
    outcomes: broadcast::Sender<TaskOutcome>,
    wake: Notify,
}

impl<X: TaskExecutor> SyncTaskQueue<X> {
    pub fn new(
        config: QueueConfig,
        executor: Arc<X>,
        breaker: Arc<CircuitBreaker>,
        dead_letters: Arc<DeadLetterStore>,
        clock: SharedClock,
        connectivity: watch::Receiver<Connectivity>,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(config.outcome_capacity.max(1));
        Self {
            config,
            executor,
            breaker,
            dead_letters,
            clock,
            connectivity,
            tasks: Mutex::new(VecDeque::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            processing: AtomicBool::new(false),
            last_sync_attempt: AtomicI64::new(0),
            next_id: AtomicU64::new(1),
            outcomes,
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    /// Queue a new task with the configured retry bound.
    pub fn enqueue(&self, kind: impl Into<String>, target_filter: Value) -> TaskId {
        self.enqueue_with_retries(kind, target_filter, self.config.max_retries)
    }

    pub fn enqueue_with_retries(&self, kind: impl Into<String>, target_filter: Value, max_retries: u32) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = SyncTask {
            id,
            kind: kind.into(),
            target_filter,
            enqueued_at: self.clock.now_millis(),
            retry_count: 0,
            max_retries,
            state: TaskState::Pending,
        };
        self.enqueue_task(task);
        id
    }

    /// Append an existing task. Wakes the worker when online and idle.
    pub fn enqueue_task(&self, task: SyncTask) {
        debug!(task_id = task.id, kind = %task.kind, retry_count = task.retry_count, "Task enqueued");
        let len = {
            let mut tasks = self.tasks.lock();
            tasks.push_back(task);
            tasks.len()
        };
        crate::metrics::set_queue_length(len);
        if self.is_online() && !self.processing.load(Ordering::Acquire) {
            self.wake.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Queued tasks in order, for diagnostics.
    pub fn pending(&self) -> Vec<SyncTask> {
        self.tasks.lock().iter().cloned().collect()
    }

    pub fn status(&self) -> QueueStatus {
        let last = self.last_sync_attempt.load(Ordering::Acquire);
        QueueStatus {
            queue_length: self.len(),
            is_processing: self.processing.load(Ordering::Acquire),
            last_sync_attempt: (last > 0).then_some(last),
        }
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<TaskOutcome> {
        self.outcomes.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Draining
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run one pass over everything queued right now.
    ///
    /// Does nothing while offline. Concurrent callers serialize.
    pub async fn drain(&self) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        if !self.is_online() {
            debug!("Offline, drain skipped");
            return DrainReport {
                remaining: self.len(),
                ..Default::default()
            };
        }

        let snapshot: Vec<SyncTask> = self.tasks.lock().drain(..).collect();
        if snapshot.is_empty() {
            return DrainReport::default();
        }

        self.processing.store(true, Ordering::Release);
        let started = Instant::now();
        let mut report = DrainReport {
            passes: 1,
            ..Default::default()
        };

        let executions: Vec<(SyncTask, Execution)> = stream::iter(snapshot)
            .map(|task| async move {
                let execution = self.execute(&task).await;
                (task, execution)
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (task, execution) in executions {
            self.settle(task, execution, &mut report);
        }

        if report.attempted > 0 {
            self.last_sync_attempt.store(self.clock.now_millis(), Ordering::Release);
        }
        report.remaining = self.len();
        self.processing.store(false, Ordering::Release);

        crate::metrics::record_drain(started.elapsed(), report.attempted);
        crate::metrics::set_queue_length(report.remaining);
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            remaining = report.remaining,
            "Drain pass complete"
        );
        report
    }

    /// Execute one task, reporting the attempt to the breaker exactly once.
    async fn execute(&self, task: &SyncTask) -> Execution {
        if !self.breaker.can_execute() {
            return Execution::Deferred;
        }
        let result = match tokio::time::timeout(self.config.task_timeout, self.executor.execute(task)).await {
            Ok(result) => result,
            Err(_) => Err(FixtureSyncError::timeout(task.kind.clone(), self.config.task_timeout)),
        };
        match result {
            Ok(()) => {
                self.breaker.on_success();
                Execution::Succeeded
            }
            Err(e) => {
                self.breaker.on_failure(e.to_string());
                Execution::Failed(e)
            }
        }
    }

    fn settle(&self, mut task: SyncTask, execution: Execution, report: &mut DrainReport) {
        let error = match execution {
            Execution::Deferred => {
                report.deferred += 1;
                task.state = TaskState::Requeued;
                self.tasks.lock().push_back(task);
                return;
            }
            Execution::Succeeded => {
                report.attempted += 1;
                report.succeeded += 1;
                task.state = TaskState::Succeeded;
                self.dead_letters.resolve(&task.operation_key());
                self.publish(&task, None);
                return;
            }
            Execution::Failed(e) => e,
        };

        report.attempted += 1;
        let context = OperationContext::new(task.kind.clone())
            .with_resource(task.operation_key())
            .with_attempt(task.retry_count + 1);
        let classified = classify_error(&error, &context);
        task.retry_count += 1;

        if classified.retryable && task.retry_count <= task.max_retries {
            debug!(
                task_id = task.id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                category = %classified.category,
                "Task failed, requeued"
            );
            report.requeued += 1;
            task.state = TaskState::Requeued;
            self.publish(&task, Some(classified));
            self.tasks.lock().push_back(task);
            return;
        }

        warn!(
            task_id = task.id,
            kind = %task.kind,
            retry_count = task.retry_count,
            category = %classified.category,
            retryable = classified.retryable,
            error = %classified.message,
            "Task dead-lettered"
        );
        report.dead_lettered += 1;
        task.state = TaskState::DeadLettered;
        self.dead_letters
            .upsert(&task.operation_key(), classified.clone(), task.retry_count, Some(task.replay_payload()));
        self.publish(&task, Some(classified));
    }

    fn publish(&self, task: &SyncTask, error: Option<ClassifiedError>) {
        crate::metrics::record_task_outcome(task.state.as_str());
        // No receivers is fine.
        let _ = self.outcomes.send(TaskOutcome {
            task_id: task.id,
            kind: task.kind.clone(),
            operation_key: task.operation_key(),
            state: task.state,
            retry_count: task.retry_count,
            error,
        });
    }

    /// Drain repeatedly until the queue is empty, a pass makes no attempts,
    /// or `max_force_passes` is reached.
    pub async fn force_drain_all(&self) -> Result<DrainReport> {
        if !self.is_online() {
            return Err(FixtureSyncError::Offline("force sync requires connectivity".into()));
        }
        let mut total = DrainReport::default();
        for pass in 0..self.config.max_force_passes.max(1) {
            if pass > 0 {
                tokio::time::sleep(self.config.force_pass_delay).await;
            }
            let report = self.drain().await;
            total.absorb(&report);
            if report.remaining == 0 || report.attempted == 0 {
                break;
            }
        }
        info!(passes = total.passes, remaining = total.remaining, "Forced sync complete");
        Ok(total)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Worker
    // ═══════════════════════════════════════════════════════════════════════════

    /// Worker loop; returns when `shutdown` turns true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let span = tracing::info_span!("sync_queue");
        async move {
            let _ = shutdown.borrow_and_update();
            let mut connectivity = self.connectivity.clone();
            let _ = connectivity.borrow_and_update();
            let mut connectivity_alive = true;

            let period = self.config.periodic_interval;
            let mut periodic = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            periodic.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut cooldown_until: Option<tokio::time::Instant> = None;
            info!(periodic_secs = period.as_secs(), "Starting sync queue worker");

            loop {
                let cooldown = async move {
                    match cooldown_until {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;

                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            info!("Shutdown signal received, stopping sync queue worker");
                            break;
                        }
                        continue;
                    }

                    result = connectivity.changed(), if connectivity_alive => {
                        if result.is_err() {
                            connectivity_alive = false;
                            continue;
                        }
                        let state = *connectivity.borrow_and_update();
                        if !state.is_online() {
                            debug!("Connectivity lost, pending passes cancelled");
                            cooldown_until = None;
                            continue;
                        }
                        info!("Connectivity restored, draining");
                    }

                    _ = periodic.tick() => {
                        if !self.is_online() {
                            continue;
                        }
                    }

                    _ = self.wake.notified() => {}

                    _ = cooldown => {}
                }

                let report = self.drain().await;
                cooldown_until = (report.remaining > 0 && self.is_online())
                    .then(|| tokio::time::Instant::now() + self.config.retry_cooldown);
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitConfig, CircuitState};
    use crate::classifier::ErrorCategory;
    use crate::clock::ManualClock;
    use crate::connectivity::ConnectivityMonitor;
    use crate::dead_letter::{DeadLetterPolicy, DeadLetterStatus};
    use std::collections::HashMap;

    /// Fails each kind a scripted number of times, then succeeds.
    #[derive(Default)]
    struct ScriptedExecutor {
        failures: Mutex<HashMap<String, (u32, fn() -> FixtureSyncError)>>,
        calls: Mutex<Vec<TaskId>>,
    }

    impl ScriptedExecutor {
        fn fail(self, kind: &str, times: u32, err: fn() -> FixtureSyncError) -> Self {
            self.failures.lock().insert(kind.to_string(), (times, err));
            self
        }

        fn calls(&self) -> Vec<TaskId> {
            self.calls.lock().clone()
        }
    }

    impl TaskExecutor for ScriptedExecutor {
        fn execute<'a>(&'a self, task: &'a SyncTask) -> BoxFuture<'a, ()> {
            self.calls.lock().push(task.id);
            let result = match self.failures.lock().get_mut(&task.kind) {
                Some((remaining, err)) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(err())
                }
                _ => Ok(()),
            };
            Box::pin(async move { result })
        }
    }

    fn network() -> FixtureSyncError {
        FixtureSyncError::network("sync", "connection reset")
    }

    fn invalid() -> FixtureSyncError {
        FixtureSyncError::Validation("missing home team".into())
    }

    struct Harness {
        connectivity: ConnectivityMonitor,
        dead_letters: Arc<DeadLetterStore>,
        queue: Arc<SyncTaskQueue<ScriptedExecutor>>,
    }

    fn harness(executor: ScriptedExecutor, circuit: CircuitConfig) -> Harness {
        let clock: SharedClock = Arc::new(ManualClock::default());
        let connectivity = ConnectivityMonitor::new(Connectivity::Online);
        let dead_letters = Arc::new(DeadLetterStore::new(DeadLetterPolicy::default(), clock.clone()));
        let breaker = Arc::new(CircuitBreaker::with_clock("origin_api", circuit, clock.clone()));
        let queue = Arc::new(SyncTaskQueue::new(
            QueueConfig::for_testing(),
            Arc::new(executor),
            breaker,
            dead_letters.clone(),
            clock,
            connectivity.subscribe(),
        ));
        Harness {
            connectivity,
            dead_letters,
            queue,
        }
    }

    #[tokio::test]
    async fn test_task_succeeding_on_third_drain_leaves_no_dead_letter() {
        let h = harness(ScriptedExecutor::default().fail("refresh", 2, network), CircuitConfig::lenient());
        h.queue.enqueue_with_retries("refresh", json!({"round": 1}), 2);

        let first = h.queue.drain().await;
        assert_eq!(first.requeued, 1);
        assert_eq!(h.queue.pending()[0].retry_count, 1);

        let second = h.queue.drain().await;
        assert_eq!(second.requeued, 1);
        assert_eq!(h.queue.pending()[0].retry_count, 2);

        let third = h.queue.drain().await;
        assert_eq!(third.succeeded, 1);
        assert!(h.queue.is_empty());
        assert!(h.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_task_is_dead_lettered_with_payload() {
        let h = harness(ScriptedExecutor::default().fail("refresh", 10, network), CircuitConfig::lenient());
        h.queue.enqueue_with_retries("refresh", json!({"round": 1}), 1);

        h.queue.drain().await;
        let report = h.queue.drain().await;
        assert_eq!(report.dead_lettered, 1);
        assert!(h.queue.is_empty());

        let entries = h.dead_letters.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation_key, r#"refresh:{"round":1}"#);
        assert_eq!(entries[0].error.category, ErrorCategory::Network);
        let (kind, filter, max) = parse_replay_payload(&entries[0]).unwrap();
        assert_eq!(kind, "refresh");
        assert_eq!(filter, json!({"round": 1}));
        assert_eq!(max, Some(1));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_dead_lettered_immediately() {
        let h = harness(ScriptedExecutor::default().fail("submit", 1, invalid), CircuitConfig::lenient());
        h.queue.enqueue("submit", json!("m1"));

        let report = h.queue.drain().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.requeued, 0);
        let entry = h.dead_letters.get(r#"submit:"m1""#).unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Failed);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_order_preserved() {
        let executor = ScriptedExecutor::default().fail("b", 1, network);
        let h = harness(executor, CircuitConfig::lenient());
        let a = h.queue.enqueue("a", Value::Null);
        let b = h.queue.enqueue("b", Value::Null);
        let c = h.queue.enqueue("c", Value::Null);

        let report = h.queue.drain().await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.requeued, 1);
        assert_eq!(h.queue.pending()[0].id, b);

        h.queue.drain().await;
        assert_eq!(h.queue.executor.calls(), vec![a, b, c, b]);
    }

    #[tokio::test]
    async fn test_open_breaker_defers_without_consuming_retries() {
        let h = harness(ScriptedExecutor::default().fail("a", 10, network), CircuitConfig::test());
        h.queue.enqueue_with_retries("a", Value::Null, 10);

        // two consecutive failures trip the test breaker
        h.queue.drain().await;
        h.queue.drain().await;
        assert_eq!(h.queue.breaker().current_state(), CircuitState::Open);

        h.queue.enqueue("b", Value::Null);
        let report = h.queue.drain().await;
        assert_eq!(report.attempted, 0);
        assert_eq!(report.deferred, 2);

        let pending = h.queue.pending();
        assert_eq!(pending[0].retry_count, 2);
        assert_eq!(pending[1].retry_count, 0);
        assert_eq!(h.queue.executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_drain_skipped_while_offline() {
        let h = harness(ScriptedExecutor::default(), CircuitConfig::lenient());
        h.connectivity.set_offline();
        h.queue.enqueue("a", Value::Null);

        let report = h.queue.drain().await;
        assert_eq!(report.attempted, 0);
        assert_eq!(report.remaining, 1);
        assert!(matches!(h.queue.force_drain_all().await, Err(FixtureSyncError::Offline(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_drain_all_retries_until_empty() {
        let h = harness(ScriptedExecutor::default().fail("a", 2, network), CircuitConfig::lenient());
        h.queue.enqueue_with_retries("a", Value::Null, 3);

        let report = h.queue.force_drain_all().await.unwrap();
        assert_eq!(report.passes, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.remaining, 0);
        assert!(h.queue.status().last_sync_attempt.is_some());
    }

    #[tokio::test]
    async fn test_outcomes_are_broadcast() {
        let h = harness(ScriptedExecutor::default(), CircuitConfig::lenient());
        let mut rx = h.queue.subscribe_outcomes();
        let id = h.queue.enqueue("a", Value::Null);
        h.queue.drain().await;

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.task_id, id);
        assert_eq!(outcome.state, TaskState::Succeeded);
        assert!(outcome.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_drains_on_enqueue_and_restore() {
        let h = harness(ScriptedExecutor::default(), CircuitConfig::lenient());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = h.queue.clone();
        let worker = tokio::spawn(async move { queue.run(shutdown_rx).await });

        h.queue.enqueue("a", Value::Null);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.queue.is_empty());

        h.connectivity.set_offline();
        h.queue.enqueue("b", Value::Null);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.queue.len(), 1);

        h.connectivity.set_online();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.queue.is_empty());

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_after_cooldown() {
        let h = harness(ScriptedExecutor::default().fail("a", 1, network), CircuitConfig::lenient());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = h.queue.clone();
        let worker = tokio::spawn(async move { queue.run(shutdown_rx).await });

        h.queue.enqueue("a", Value::Null);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.queue.len(), 1);

        tokio::time::sleep(QueueConfig::for_testing().retry_cooldown).await;
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.executor.calls().len(), 2);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_rearms_after_cooldown_pass() {
        let h = harness(ScriptedExecutor::default().fail("a", 2, network), CircuitConfig::lenient());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = h.queue.clone();
        let worker = tokio::spawn(async move { queue.run(shutdown_rx).await });
        let cooldown = QueueConfig::for_testing().retry_cooldown;

        h.queue.enqueue("a", Value::Null);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.queue.executor.calls().len(), 1);

        // The second failure comes from a cooldown pass and must schedule another.
        tokio::time::sleep(cooldown).await;
        assert_eq!(h.queue.executor.calls().len(), 2);
        assert_eq!(h.queue.len(), 1);

        tokio::time::sleep(cooldown).await;
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.executor.calls().len(), 3);
        assert!(h.dead_letters.is_empty());

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
