// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live change subscriptions.
//!
//! # Flow
//!
//! ```text
//!  ChangeStream ──► pump task (per channel) ──► classify ──► EventBatcher
//!                                                                 │
//!                           first event since flush starts timer  │
//!                                                                 ▼
//!                         flush: sort (priority, timestamp desc), deliver
//!                         once to each matching listener via try_send
//! ```
//!
//! Breaker reporting: the subscribe handshake reports success or failure;
//! a channel closing reports failure. Batch delivery never reports.
//!
//! Each [`Subscription`] owns a bounded receiver. A listener that cannot keep
//! up loses whole batches (counted), never individual events; a listener
//! whose receiver was dropped is removed on the next flush.

pub mod batcher;
pub mod channel;
pub mod event;

pub use batcher::{sort_batch, EventBatcher};
pub use channel::{ChangeChannel, ChangeStream, ChannelMessage, ChannelSpec, NoOpChangeStream};
pub use event::{ChangeEvent, ChangeOp, ClassificationRules, EventType, FieldChange, Priority, RawChange};

use crate::circuit_breaker::{names, CircuitBreaker, CircuitState};
use crate::clock::SharedClock;
use crate::error::{FixtureSyncError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

pub type SubscriptionId = u64;

/// Subscription manager settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    /// Table the channels watch.
    pub table: String,
    pub handshake_timeout: Duration,
    /// Used when a subscriber passes no delay.
    pub default_batch_delay: Duration,
    /// Batches buffered per subscriber before drops.
    pub listener_capacity: usize,
    pub rules: ClassificationRules,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            table: "matches".into(),
            handshake_timeout: Duration::from_secs(10),
            default_batch_delay: Duration::from_millis(500),
            listener_capacity: 32,
            rules: ClassificationRules::default(),
        }
    }
}

impl SubscriptionConfig {
    pub fn for_testing() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(100),
            default_batch_delay: Duration::from_millis(20),
            listener_capacity: 4,
            ..Default::default()
        }
    }
}

/// Events delivered together, already in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventBatch {
    pub seq: u64,
    pub delivered_at: i64,
    pub events: Vec<ChangeEvent>,
}

/// Handle returned by `subscribe`. Dropping `batches` unsubscribes lazily.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel_id: String,
    pub batches: mpsc::Receiver<EventBatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatus {
    pub active_channels: usize,
    pub circuit_state: CircuitState,
    pub queued_events: usize,
    pub listeners: usize,
    pub batches_delivered: u64,
    pub batches_dropped: u64,
}

struct Listener {
    entity_ids: HashSet<String>,
    event_types: HashSet<EventType>,
    batch_delay: Duration,
    tx: mpsc::Sender<EventBatch>,
    channel_id: String,
    pump: JoinHandle<()>,
}

impl Listener {
    fn wants(&self, event: &ChangeEvent) -> bool {
        (self.entity_ids.is_empty() || self.entity_ids.contains(&event.entity_id))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

#[derive(Default)]
struct State {
    listeners: BTreeMap<SubscriptionId, Listener>,
    batcher: EventBatcher,
    timer: Option<JoinHandle<()>>,
    batch_seq: u64,
}

struct Shared<S> {
    config: SubscriptionConfig,
    stream: Arc<S>,
    breaker: Arc<CircuitBreaker>,
    clock: SharedClock,
    state: Mutex<State>,
    next_id: AtomicU64,
    batches_delivered: AtomicU64,
    batches_dropped: AtomicU64,
    observers: broadcast::Sender<EventBatch>,
}

/// Opens change channels, classifies and batches what they carry, and fans
/// batches out to subscribers.
pub struct ChangeEventSubscriptionManager<S: ChangeStream = NoOpChangeStream> {
    shared: Arc<Shared<S>>,
}

impl<S: ChangeStream> Clone for ChangeEventSubscriptionManager<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: ChangeStream> ChangeEventSubscriptionManager<S> {
    pub fn new(config: SubscriptionConfig, stream: Arc<S>, breaker: Arc<CircuitBreaker>, clock: SharedClock) -> Self {
        let (observers, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                config,
                stream,
                breaker,
                clock,
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(1),
                batches_delivered: AtomicU64::new(0),
                batches_dropped: AtomicU64::new(0),
                observers,
            }),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.shared.breaker
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.shared.config
    }

    /// Every flushed batch, unfiltered. Used to merge updates into the cache.
    pub fn observe(&self) -> broadcast::Receiver<EventBatch> {
        self.shared.observers.subscribe()
    }

    /// Open a channel for `entity_ids` and register a listener.
    ///
    /// Empty `event_types` means all types. Refused with `CircuitOpen` while
    /// the change-stream breaker is failing fast; no channel is opened then.
    pub async fn subscribe(
        &self,
        entity_ids: Vec<String>,
        event_types: Vec<EventType>,
        batch_delay: Option<Duration>,
    ) -> Result<Subscription> {
        let shared = &self.shared;
        if entity_ids.is_empty() {
            return Err(FixtureSyncError::Validation("subscribe needs at least one entity id".into()));
        }
        if !shared.breaker.can_execute() {
            let rec = shared.breaker.recommendation();
            warn!(reason = %rec.reason, "Subscribe refused, change stream circuit open");
            return Err(FixtureSyncError::CircuitOpen {
                circuit: names::CHANGE_STREAM.to_string(),
                reason: rec.reason,
            });
        }

        let spec = ChannelSpec::for_entities(&shared.config.table, &shared.config.rules.id_field, &entity_ids);
        let channel = match tokio::time::timeout(shared.config.handshake_timeout, shared.stream.open(&spec)).await {
            Ok(Ok(channel)) => {
                shared.breaker.on_success();
                channel
            }
            Ok(Err(e)) => {
                shared.breaker.on_failure(e.to_string());
                warn!(topic = %spec.topic(), error = %e, "Change channel handshake failed");
                return Err(e);
            }
            Err(_) => {
                shared.breaker.on_failure("handshake timed out");
                warn!(topic = %spec.topic(), "Change channel handshake timed out");
                return Err(FixtureSyncError::timeout("subscribe", shared.config.handshake_timeout));
            }
        };

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(shared.config.listener_capacity.max(1));
        let channel_id = channel.id.clone();
        let active = {
            let mut state = shared.state.lock();
            let pump = tokio::spawn(run_pump(Arc::clone(shared), id, channel));
            state.listeners.insert(
                id,
                Listener {
                    entity_ids: entity_ids.iter().cloned().collect(),
                    event_types: event_types.into_iter().collect(),
                    batch_delay: batch_delay.unwrap_or(shared.config.default_batch_delay),
                    tx,
                    channel_id: channel_id.clone(),
                    pump,
                },
            );
            state.listeners.len()
        };
        crate::metrics::set_active_channels(active);
        info!(subscription_id = id, channel_id = %channel_id, entities = entity_ids.len(), "Subscribed to changes");

        Ok(Subscription {
            id,
            channel_id,
            batches: rx,
        })
    }

    /// Tear down one subscription. Returns `false` if it was unknown.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state.listeners.remove(&id);
            if state.listeners.is_empty() {
                stop_batching(&mut state);
            }
            crate::metrics::set_active_channels(state.listeners.len());
            removed
        };
        let Some(listener) = removed else {
            return false;
        };
        listener.pump.abort();
        if let Err(e) = self.shared.stream.close(&listener.channel_id).await {
            warn!(channel_id = %listener.channel_id, error = %e, "Failed to close change channel");
        }
        info!(subscription_id = id, "Unsubscribed");
        true
    }

    /// Tear down every subscription and drop pending events.
    pub async fn cleanup(&self) {
        let listeners: Vec<Listener> = {
            let mut state = self.shared.state.lock();
            stop_batching(&mut state);
            std::mem::take(&mut state.listeners).into_values().collect()
        };
        crate::metrics::set_active_channels(0);
        let count = listeners.len();
        for listener in listeners {
            listener.pump.abort();
            if let Err(e) = self.shared.stream.close(&listener.channel_id).await {
                warn!(channel_id = %listener.channel_id, error = %e, "Failed to close change channel");
            }
        }
        if count > 0 {
            info!(subscriptions = count, "Subscriptions cleaned up");
        }
    }

    /// Deliver whatever is pending now instead of waiting for the timer.
    pub fn flush_now(&self) -> usize {
        let timer = self.shared.state.lock().timer.take();
        if let Some(timer) = timer {
            timer.abort();
        }
        self.shared.flush()
    }

    /// Feed a raw change as if it arrived on a channel.
    ///
    /// Outside a tokio runtime no batch timer can start; accepted events
    /// then stay pending until [`flush_now`](Self::flush_now).
    pub fn ingest(&self, raw: &RawChange) -> bool {
        self.shared.ingest_raw(raw)
    }

    pub fn status(&self) -> SubscriptionStatus {
        let shared = &self.shared;
        let state = shared.state.lock();
        SubscriptionStatus {
            active_channels: state.listeners.values().filter(|l| !l.pump.is_finished()).count(),
            circuit_state: shared.breaker.current_state(),
            queued_events: state.batcher.len(),
            listeners: state.listeners.len(),
            batches_delivered: shared.batches_delivered.load(Ordering::Relaxed),
            batches_dropped: shared.batches_dropped.load(Ordering::Relaxed),
        }
    }
}

fn stop_batching(state: &mut State) {
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
    state.batcher.take_sorted();
}

impl<S: ChangeStream> Shared<S> {
    fn ingest_raw(self: &Arc<Self>, raw: &RawChange) -> bool {
        let Some(event) = self.config.rules.to_event(raw) else {
            return false;
        };
        crate::metrics::record_change_event(event.event_type.as_str());
        debug!(
            entity_id = %event.entity_id,
            event_type = %event.event_type,
            fields = event.field_changes.len(),
            "Change classified"
        );

        let mut state = self.state.lock();
        if state.listeners.is_empty() {
            return false;
        }
        if state.batcher.push(event) && state.timer.is_none() {
            let delay = batcher::effective_delay(
                state.listeners.values().map(|l| l.batch_delay),
                self.config.default_batch_delay,
            );
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let shared = Arc::clone(self);
                    state.timer = Some(handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        shared.state.lock().timer = None;
                        shared.flush();
                    }));
                }
                Err(_) => {
                    warn!(table = %raw.table, "No runtime for batch timer, events wait for flush_now");
                }
            }
        }
        true
    }

    /// Sort and deliver pending events. Returns how many events went out.
    fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let events = state.batcher.take_sorted();
        if events.is_empty() {
            return 0;
        }
        state.batch_seq += 1;
        let seq = state.batch_seq;
        let now = self.clock.now_millis();

        let mut closed = Vec::new();
        for (id, listener) in &state.listeners {
            let wanted: Vec<ChangeEvent> = events.iter().filter(|e| listener.wants(e)).cloned().collect();
            if wanted.is_empty() {
                continue;
            }
            let batch = EventBatch {
                seq,
                delivered_at: now,
                events: wanted,
            };
            match listener.tx.try_send(batch) {
                Ok(()) => {
                    self.batches_delivered.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_batch_delivered();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_batch_dropped();
                    warn!(subscription_id = id, seq, "Subscriber lagging, batch dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            if let Some(listener) = state.listeners.remove(&id) {
                listener.pump.abort();
                let stream = Arc::clone(&self.stream);
                tokio::spawn(async move {
                    let _ = stream.close(&listener.channel_id).await;
                });
                info!(subscription_id = id, "Subscriber gone, listener removed");
            }
        }
        crate::metrics::set_active_channels(state.listeners.len());
        drop(state);

        let count = events.len();
        // Observers are optional.
        let _ = self.observers.send(EventBatch {
            seq,
            delivered_at: now,
            events,
        });
        debug!(seq, events = count, "Batch flushed");
        count
    }

    fn channel_closed(&self, id: SubscriptionId, reason: &str) {
        self.breaker.on_failure(reason.to_string());
        let mut state = self.state.lock();
        // Dropping the sender ends the subscriber's stream.
        if state.listeners.remove(&id).is_some() {
            warn!(subscription_id = id, reason = %reason, "Change channel closed");
        }
        if state.listeners.is_empty() {
            stop_batching(&mut state);
        }
        crate::metrics::set_active_channels(state.listeners.len());
    }
}

async fn run_pump<S: ChangeStream>(shared: Arc<Shared<S>>, id: SubscriptionId, mut channel: ChangeChannel) {
    let span = tracing::info_span!("change_channel", subscription_id = id, channel_id = %channel.id);
    async move {
        loop {
            match channel.events.recv().await {
                Some(ChannelMessage::Change(raw)) => {
                    shared.ingest_raw(&raw);
                }
                Some(ChannelMessage::Closed { reason }) => {
                    shared.channel_closed(id, &reason);
                    break;
                }
                None => {
                    shared.channel_closed(id, "stream ended");
                    break;
                }
            }
        }
    }
    .instrument(span)
    .await
}
