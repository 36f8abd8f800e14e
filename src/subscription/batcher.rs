// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Accumulates classified events between flushes.

use super::event::ChangeEvent;
use std::collections::HashSet;
use std::time::Duration;

/// Pending events plus the batch delay that applies to them.
#[derive(Debug, Default)]
pub struct EventBatcher {
    pending: Vec<ChangeEvent>,
    seen: HashSet<(String, i64)>,
    duplicates: u64,
}

impl EventBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event. Returns `true` if this is the first event since the last
    /// flush, i.e. the caller should start the batch timer.
    ///
    /// An event with the same `(entity_id, timestamp)` as one already pending
    /// is dropped.
    pub fn push(&mut self, event: ChangeEvent) -> bool {
        if !self.seen.insert((event.entity_id.clone(), event.timestamp)) {
            self.duplicates += 1;
            return false;
        }
        let first = self.pending.is_empty();
        self.pending.push(event);
        first
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Take everything pending, sorted priority desc then timestamp desc.
    pub fn take_sorted(&mut self) -> Vec<ChangeEvent> {
        self.seen.clear();
        let mut batch = std::mem::take(&mut self.pending);
        sort_batch(&mut batch);
        batch
    }
}

/// Delivery order for a batch. Stable, so equal keys keep arrival order.
pub fn sort_batch(events: &mut [ChangeEvent]) {
    events.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
}

/// Smallest delay among listeners, or `fallback` if there are none.
pub fn effective_delay(delays: impl IntoIterator<Item = Duration>, fallback: Duration) -> Duration {
    delays.into_iter().min().unwrap_or(fallback)
}
