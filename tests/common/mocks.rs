// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scripted collaborators.
//!
//! Each mock records what it was asked to do and fails on demand, so tests
//! can drive the queue, cache and subscription paths without a network.

use dashmap::DashMap;
use fixture_sync::cache::RemoteSource;
use fixture_sync::subscription::{ChangeChannel, ChangeStream, ChannelMessage, ChannelSpec, RawChange};
use fixture_sync::sync_queue::{SyncTask, TaskExecutor};
use fixture_sync::{BoxFuture, FixtureSyncError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Executor
// =============================================================================

/// One scripted execution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    FailNetwork,
    FailValidation,
    FailAuth,
    /// Sleep this long, then succeed.
    Hang(Duration),
}

impl Step {
    fn into_result(self, task: &SyncTask) -> Result<(), FixtureSyncError> {
        match self {
            Step::Succeed | Step::Hang(_) => Ok(()),
            Step::FailNetwork => Err(FixtureSyncError::network(task.kind.clone(), "connection reset")),
            Step::FailValidation => Err(FixtureSyncError::Validation(format!("bad filter {}", task.target_filter))),
            Step::FailAuth => Err(FixtureSyncError::Authentication("token expired".into())),
        }
    }
}

/// Executor that replays per-kind scripts and succeeds once a script runs out.
#[derive(Default)]
pub struct MockExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    fallback: Mutex<Option<Step>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockExecutor {
    /// Queue steps for tasks of `kind`.
    pub fn script(&self, kind: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .entry(kind.to_string())
            .or_default()
            .extend(steps);
    }

    /// Result used once a kind's script is empty (default: succeed).
    pub fn always(&self, step: Step) {
        *self.fallback.lock() = Some(step);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, kind: &str) -> usize {
        self.calls.lock().iter().filter(|(k, _)| k == kind).count()
    }
}

impl TaskExecutor for MockExecutor {
    fn execute<'a>(&'a self, task: &'a SyncTask) -> BoxFuture<'a, ()> {
        self.calls.lock().push((task.kind.clone(), task.target_filter.clone()));
        let step = self
            .scripts
            .lock()
            .get_mut(&task.kind)
            .and_then(|steps| steps.pop_front())
            .or(*self.fallback.lock())
            .unwrap_or(Step::Succeed);
        Box::pin(async move {
            if let Step::Hang(d) = step {
                tokio::time::sleep(d).await;
            }
            step.into_result(task)
        })
    }
}

// =============================================================================
// Change stream
// =============================================================================

/// Change stream whose channels are fed by the test.
#[derive(Default)]
pub struct MockChangeStream {
    channels: DashMap<String, mpsc::Sender<ChannelMessage>>,
    opened: Mutex<Vec<ChannelSpec>>,
    closed: Mutex<Vec<String>>,
    fail_handshakes: AtomicU32,
    hang_handshakes: AtomicBool,
    next_id: AtomicUsize,
}

impl MockChangeStream {
    /// Fail the next `n` handshakes.
    pub fn fail_next(&self, n: u32) {
        self.fail_handshakes.store(n, Ordering::SeqCst);
    }

    /// Never acknowledge handshakes until cleared.
    pub fn hang(&self, hang: bool) {
        self.hang_handshakes.store(hang, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<ChannelSpec> {
        self.opened.lock().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().clone()
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Deliver a change on `channel_id`. Returns false if the channel is gone.
    pub async fn push(&self, channel_id: &str, change: RawChange) -> bool {
        let Some(tx) = self.channels.get(channel_id).map(|e| e.value().clone()) else {
            return false;
        };
        tx.send(ChannelMessage::Change(change)).await.is_ok()
    }

    /// Close a channel from the remote side.
    pub async fn close_remote(&self, channel_id: &str, reason: &str) {
        if let Some((_, tx)) = self.channels.remove(channel_id) {
            let _ = tx
                .send(ChannelMessage::Closed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

impl ChangeStream for MockChangeStream {
    fn open<'a>(&'a self, spec: &'a ChannelSpec) -> BoxFuture<'a, ChangeChannel> {
        Box::pin(async move {
            if self.hang_handshakes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let failing = self
                .fail_handshakes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(FixtureSyncError::network("subscribe", "socket closed during handshake"));
            }
            let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let (tx, rx) = mpsc::channel(64);
            self.channels.insert(id.clone(), tx);
            self.opened.lock().push(spec.clone());
            Ok(ChangeChannel { id, events: rx })
        })
    }

    fn close<'a>(&'a self, channel_id: &'a str) -> BoxFuture<'a, ()> {
        self.channels.remove(channel_id);
        self.closed.lock().push(channel_id.to_string());
        Box::pin(async { Ok(()) })
    }
}

// =============================================================================
// Remote mirror
// =============================================================================

/// Remote mirror backed by a map.
#[derive(Default)]
pub struct MockRemote {
    rows: DashMap<String, Value>,
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl MockRemote {
    pub fn insert(&self, key: &str, value: Value) {
        self.rows.insert(key.to_string(), value);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RemoteSource for MockRemote {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Value>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(FixtureSyncError::network("remote_fetch", "mirror unreachable"))
        } else {
            Ok(self.rows.get(key).map(|v| v.value().clone()))
        };
        Box::pin(async move { result })
    }
}
