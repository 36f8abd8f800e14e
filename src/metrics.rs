// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Cache reads per tier, evictions, stale serves
//! - Sync queue length, drain passes and task outcomes
//! - Circuit breaker state and rejections
//! - Change events and batch delivery
//! - Dead letters and retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `fixture_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The library only records; the embedding app installs an exporter.

use crate::circuit_breaker::CircuitState;
use crate::connectivity::Connectivity;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Cache Metrics
// =============================================================================

/// A read resolved from `tier`.
pub fn record_cache_hit(tier: &str) {
    counter!("fixture_sync_cache_hits_total", "tier" => tier.to_string()).increment(1);
}

/// A read that no tier could satisfy.
pub fn record_cache_miss() {
    counter!("fixture_sync_cache_misses_total").increment(1);
}

/// Stale data served after the origin was unavailable.
pub fn record_stale_served(tier: &str) {
    counter!("fixture_sync_cache_stale_served_total", "tier" => tier.to_string()).increment(1);
}

pub fn record_cache_evictions(count: usize) {
    counter!("fixture_sync_cache_evictions_total").increment(count as u64);
}

/// An entry too large for the memory tier.
pub fn record_cache_rejection() {
    counter!("fixture_sync_cache_rejected_total").increment(1);
}

pub fn set_cache_size(bytes: usize, entries: usize) {
    gauge!("fixture_sync_cache_bytes").set(bytes as f64);
    gauge!("fixture_sync_cache_entries").set(entries as f64);
}

// =============================================================================
// Queue Metrics
// =============================================================================

pub fn set_queue_length(len: usize) {
    gauge!("fixture_sync_queue_length").set(len as f64);
}

/// A task reached `state` (succeeded, requeued, dead_lettered).
pub fn record_task_outcome(state: &str) {
    counter!("fixture_sync_task_outcomes_total", "state" => state.to_string()).increment(1);
}

/// One drain pass.
pub fn record_drain(duration: Duration, attempted: usize) {
    counter!("fixture_sync_drain_passes_total").increment(1);
    counter!("fixture_sync_drain_attempted_total").increment(attempted as u64);
    histogram!("fixture_sync_drain_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: CircuitState) {
    gauge!("fixture_sync_circuit_state", "circuit" => circuit_name.to_string()).set(state as u8 as f64);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "fixture_sync_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

// =============================================================================
// Subscription Metrics
// =============================================================================

pub fn record_change_event(event_type: &str) {
    counter!("fixture_sync_change_events_total", "type" => event_type.to_string()).increment(1);
}

pub fn record_batch_delivered() {
    counter!("fixture_sync_batches_delivered_total").increment(1);
}

/// A subscriber's channel was full.
pub fn record_batch_dropped() {
    counter!("fixture_sync_batches_dropped_total").increment(1);
}

pub fn set_active_channels(count: usize) {
    gauge!("fixture_sync_active_channels").set(count as f64);
}

// =============================================================================
// Error Handling Metrics
// =============================================================================

/// A classified operation failure.
pub fn record_operation_failure(operation: &str, category: &str) {
    counter!(
        "fixture_sync_operation_failures_total",
        "operation" => operation.to_string(),
        "category" => category.to_string()
    )
    .increment(1);
}

pub fn record_retry(operation: &str) {
    counter!("fixture_sync_retries_total", "operation" => operation.to_string()).increment(1);
}

/// A dead letter was written or resolved.
pub fn record_dead_letter(category: &str, status: &str) {
    counter!(
        "fixture_sync_dead_letters_total",
        "category" => category.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn set_dead_letters(count: usize) {
    gauge!("fixture_sync_dead_letters").set(count as f64);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauge for connectivity (1=online, 0=offline).
pub fn set_connectivity(state: Connectivity) {
    gauge!("fixture_sync_online").set(if state.is_online() { 1.0 } else { 0.0 });
}

/// SQLite statement retried after SQLITE_BUSY.
pub fn record_storage_retry(operation: &str) {
    counter!("fixture_sync_storage_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("fixture_sync_engine_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; the tests only check
    // that every helper accepts its full input range.

    #[test]
    fn test_cache_metrics() {
        record_cache_hit("memory");
        record_cache_hit("origin_api");
        record_cache_miss();
        record_stale_served("local");
        record_cache_evictions(0);
        record_cache_evictions(3);
        record_cache_rejection();
        set_cache_size(1024, 2);
    }

    #[test]
    fn test_queue_metrics() {
        set_queue_length(0);
        record_task_outcome("succeeded");
        record_drain(Duration::from_millis(12), 4);
        record_drain(Duration::ZERO, 0);
    }

    #[test]
    fn test_circuit_state_all_states() {
        set_circuit_state("origin_api", CircuitState::Closed);
        set_circuit_state("origin_api", CircuitState::HalfOpen);
        set_circuit_state("origin_api", CircuitState::Open);
        record_circuit_rejection("origin_api");
    }

    #[test]
    fn test_subscription_and_error_metrics() {
        record_change_event("critical");
        record_batch_delivered();
        record_batch_dropped();
        set_active_channels(2);
        record_operation_failure("refresh", "network");
        record_retry("refresh");
        record_dead_letter("network", "PENDING");
        set_dead_letters(1);
    }

    #[test]
    fn test_set_engine_state_all_states() {
        set_engine_state("Created");
        set_engine_state("Starting");
        set_engine_state("Running");
        set_engine_state("ShuttingDown");
        set_engine_state("Stopped");
        set_engine_state("Failed");
        set_engine_state("Unknown");
        set_connectivity(Connectivity::Offline);
        record_storage_retry("tier_save");
    }
}
