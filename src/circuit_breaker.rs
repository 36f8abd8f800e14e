// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers for the origin API and the change-event stream.
//!
//! A breaker sits in front of one named remote resource and fails fast once
//! the resource has failed `failure_threshold` times in a row, so a dead
//! backend costs the device nothing but a map lookup.
//!
//! # States
//!
//! ```text
//!            failures >= failure_threshold
//!   Closed ─────────────────────────────────► Open
//!     ▲                                        │
//!     │ successes >= success_threshold         │ can_execute() at now >= next_probe_at
//!     │                                        ▼
//!     └──────────────────────────────────── HalfOpen
//!                                              │
//!              any failure (probe clock reset, │
//!              timeout grows)                  └──► Open
//! ```
//!
//! The Open → HalfOpen transition is evaluated lazily inside
//! [`CircuitBreaker::can_execute`]; there is no background timer. Each
//! reopening multiplies the recovery timeout by `backoff_multiplier`, capped
//! at `max_timeout`.
//!
//! `on_success()` while Open is ignored: only a permitted probe can close the
//! circuit.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use fixture_sync::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let breaker = CircuitBreaker::with_defaults("origin_api");
//!
//! match breaker.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* success */ }
//!     Err(CircuitError::Rejected { .. }) => { /* circuit open, serve cached data */ }
//!     Err(CircuitError::Inner(e)) => { /* origin error */ }
//! }
//! # Ok(())
//! # }
//! ```

use crate::clock::{millis_to_duration, SharedClock, SystemClock};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Probing whether the resource recovered
    HalfOpen = 1,
    /// Resource unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected: {reason}")]
    Rejected { reason: String },

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Check if this is a rejection (circuit open).
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected { .. })
    }

    /// Check if this is an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, CircuitError::Inner(_))
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in half-open that close the circuit.
    pub success_threshold: u32,
    /// Wait before the first probe after opening.
    pub recovery_timeout: Duration,
    /// Ceiling for the grown recovery timeout.
    pub max_timeout: Duration,
    /// Growth factor applied per reopening.
    pub backoff_multiplier: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl CircuitConfig {
    /// Trips fast and recovers cautiously.
    ///
    /// Used for the change-event stream: a handshake storm on a flaky cell
    /// connection drains battery for nothing.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(600),
            backoff_multiplier: 2.0,
        }
    }

    /// Tolerates more failures before tripping.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
            max_timeout: Duration::from_secs(120),
            backoff_multiplier: 1.5,
        }
    }

    /// Fast recovery for testing.
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            max_timeout: Duration::from_millis(400),
            backoff_multiplier: 2.0,
        }
    }

    /// Recovery timeout after `reopen_count` previous reopenings.
    pub fn timeout_for_reopen(&self, reopen_count: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(reopen_count.min(32) as i32);
        let base = self.recovery_timeout.as_secs_f64();
        let ceiling = self.max_timeout.as_secs_f64().max(base);
        Duration::from_secs_f64((base * factor).min(ceiling))
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub status: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<i64>,
    pub next_probe_at: Option<i64>,
    pub reopen_count: u32,
    pub last_failure_reason: Option<String>,
}

/// Guidance for callers and UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recommendation {
    pub reason: String,
    /// Time until the next probe is allowed, when Open.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    status: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<i64>,
    next_probe_at: Option<i64>,
    reopen_count: u32,
    last_failure_reason: Option<String>,
}

impl Inner {
    fn closed() -> Self {
        Self {
            status: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            next_probe_at: None,
            reopen_count: 0,
            last_failure_reason: None,
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.current_state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker on the wall clock.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create with default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner::closed()),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        };
        crate::metrics::set_circuit_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Ask permission to run one operation.
    ///
    /// An Open breaker whose probe time has passed moves to HalfOpen here and
    /// permits the call. Returns `false` (and counts a rejection) otherwise.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        match inner.status {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let probe_due = inner.next_probe_at.map_or(true, |at| now >= at);
                if probe_due {
                    inner.status = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    drop(inner);
                    info!(circuit = %self.name, "Circuit half-open, probing");
                    crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen);
                    true
                } else {
                    drop(inner);
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_circuit_rejection(&self.name);
                    false
                }
            }
        }
    }

    /// Report a successful operation.
    pub fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.status {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    *inner = Inner::closed();
                    drop(inner);
                    info!(circuit = %self.name, "Circuit closed, resource recovered");
                    crate::metrics::set_circuit_state(&self.name, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                debug!(circuit = %self.name, "Ignoring success reported while open");
            }
        }
    }

    /// Report a failed operation.
    pub fn on_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.failures.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.consecutive_successes = 0;
        inner.last_failure_reason = Some(reason.clone());

        match inner.status {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let timeout = self.trip(&mut inner, now);
                    drop(inner);
                    warn!(
                        circuit = %self.name,
                        reason = %reason,
                        timeout_ms = timeout.as_millis() as u64,
                        "Circuit opened"
                    );
                    crate::metrics::set_circuit_state(&self.name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.reopen_count = inner.reopen_count.saturating_add(1);
                let timeout = self.trip(&mut inner, now);
                let reopen_count = inner.reopen_count;
                drop(inner);
                warn!(
                    circuit = %self.name,
                    reason = %reason,
                    reopen_count,
                    timeout_ms = timeout.as_millis() as u64,
                    "Probe failed, circuit reopened"
                );
                crate::metrics::set_circuit_state(&self.name, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner, now: i64) -> Duration {
        let timeout = self.config.timeout_for_reopen(inner.reopen_count);
        inner.status = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.next_probe_at = Some(now + timeout.as_millis() as i64);
        timeout
    }

    /// Current state without side effects (no lazy half-open transition).
    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().status
    }

    /// Full state snapshot.
    pub fn state(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at: inner.opened_at,
            next_probe_at: inner.next_probe_at,
            reopen_count: inner.reopen_count,
            last_failure_reason: inner.last_failure_reason.clone(),
        }
    }

    /// Human-readable guidance plus the wait until the next probe.
    pub fn recommendation(&self) -> Recommendation {
        let now = self.clock.now_millis();
        let inner = self.inner.lock();
        match inner.status {
            CircuitState::Closed => Recommendation {
                reason: format!("{} is healthy", self.name),
                retry_after: None,
            },
            CircuitState::HalfOpen => Recommendation {
                reason: format!("{} is recovering; probing with limited traffic", self.name),
                retry_after: None,
            },
            CircuitState::Open => {
                let wait = inner.next_probe_at.map(|at| millis_to_duration(at - now));
                let cause = inner.last_failure_reason.as_deref().unwrap_or("repeated failures");
                let reason = match wait {
                    Some(w) => format!(
                        "{} unavailable after {} consecutive failures ({}); next attempt in {}s",
                        self.name,
                        inner.consecutive_failures,
                        cause,
                        w.as_secs().max(1)
                    ),
                    None => format!("{} unavailable ({})", self.name, cause),
                };
                Recommendation { reason, retry_after: wait }
            }
        }
    }

    /// Execute an async operation through the breaker.
    ///
    /// Takes a closure that returns a Future, so a rejected call never
    /// constructs the future.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.can_execute() {
            warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
            return Err(CircuitError::Rejected {
                reason: self.recommendation().reason,
            });
        }

        self.calls_total.fetch_add(1, Ordering::Relaxed);
        match f().await {
            Ok(result) => {
                self.on_success();
                debug!(circuit = %self.name, "Circuit call succeeded");
                Ok(result)
            }
            Err(e) => {
                self.on_failure(e.to_string());
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Force the breaker back to Closed (operator action).
    pub fn reset(&self) {
        *self.inner.lock() = Inner::closed();
        crate::metrics::set_circuit_state(&self.name, CircuitState::Closed);
        info!(circuit = %self.name, "Circuit manually reset");
    }

    /// Calls made through [`call`](Self::call).
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls refused while open.
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Failure rate over reported outcomes (0.0 - 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.successes() + self.failures();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}

/// Well-known breaker names.
pub mod names {
    pub const ORIGIN_API: &str = "origin_api";
    pub const CHANGE_STREAM: &str = "change_stream";
    pub const REMOTE_DB: &str = "remote_db";
}

/// One breaker per named remote resource.
pub struct CircuitRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: SharedClock,
    default_config: CircuitConfig,
}

impl CircuitRegistry {
    pub fn new(clock: SharedClock, default_config: CircuitConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            clock,
            default_config,
        }
    }

    /// Get the breaker for `name`, creating it with the default config.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_config.clone())
    }

    /// Get the breaker for `name`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps its original config.
    pub fn get_or_create(&self, name: &str, config: CircuitConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_clock(name, config, self.clock.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<CircuitSnapshot> = self.breakers.iter().map(|b| b.value().state()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn any_open(&self) -> bool {
        self.breakers
            .iter()
            .any(|b| b.value().current_state() == CircuitState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(config: CircuitConfig) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (CircuitBreaker::with_clock("test", config, clock.clone()), clock)
    }

    fn config(failures: u32, successes: u32, recovery_secs: u64) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: failures,
            success_threshold: successes,
            recovery_timeout: Duration::from_secs(recovery_secs),
            max_timeout: Duration::from_secs(recovery_secs * 8),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_opens_after_threshold_and_probes_lazily() {
        let (cb, clock) = breaker(config(3, 1, 30));
        for _ in 0..3 {
            assert!(cb.can_execute());
            cb.on_failure("connection refused");
        }
        assert_eq!(cb.current_state(), CircuitState::Open);

        clock.advance(Duration::from_secs(10));
        assert!(!cb.can_execute());
        assert_eq!(cb.current_state(), CircuitState::Open);

        clock.advance(Duration::from_secs(21));
        assert!(cb.can_execute());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let (cb, _clock) = breaker(config(3, 1, 30));
        cb.on_failure("a");
        cb.on_failure("b");
        cb.on_success();
        cb.on_failure("c");
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.state().consecutive_failures, 1);
    }

    #[test]
    fn test_success_while_open_is_ignored() {
        let (cb, clock) = breaker(config(1, 1, 30));
        cb.on_failure("boom");
        for _ in 0..10 {
            cb.on_success();
        }
        assert_eq!(cb.current_state(), CircuitState::Open);
        clock.advance(Duration::from_secs(5));
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let (cb, clock) = breaker(config(1, 2, 1));
        cb.on_failure("x");
        clock.advance(Duration::from_secs(1));
        assert!(cb.can_execute());
        cb.on_success();
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.state().reopen_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_with_longer_timeout() {
        let (cb, clock) = breaker(config(1, 1, 10));
        cb.on_failure("x");
        let first = cb.state();
        assert_eq!(first.next_probe_at.unwrap() - first.opened_at.unwrap(), 10_000);

        clock.advance(Duration::from_secs(10));
        assert!(cb.can_execute());
        cb.on_failure("still down");
        let second = cb.state();
        assert_eq!(second.status, CircuitState::Open);
        assert_eq!(second.reopen_count, 1);
        assert_eq!(second.next_probe_at.unwrap() - second.opened_at.unwrap(), 20_000);

        clock.advance(Duration::from_secs(15));
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_timeout_growth_is_capped() {
        let cfg = config(1, 1, 10);
        assert_eq!(cfg.timeout_for_reopen(0), Duration::from_secs(10));
        assert_eq!(cfg.timeout_for_reopen(1), Duration::from_secs(20));
        assert_eq!(cfg.timeout_for_reopen(3), Duration::from_secs(80));
        assert_eq!(cfg.timeout_for_reopen(10), Duration::from_secs(80));
    }

    #[test]
    fn test_recommendation_reports_wait() {
        let (cb, clock) = breaker(config(1, 1, 30));
        assert!(cb.recommendation().retry_after.is_none());
        cb.on_failure("HTTP 503");
        clock.advance(Duration::from_secs(10));
        let rec = cb.recommendation();
        assert_eq!(rec.retry_after, Some(Duration::from_secs(20)));
        assert!(rec.reason.contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_call_passes_successful_calls() {
        let (cb, _clock) = breaker(CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.calls_total(), 1);
    }

    #[tokio::test]
    async fn test_call_rejects_when_open() {
        let (cb, _clock) = breaker(CircuitConfig::test());
        for _ in 0..2 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        assert!(result.unwrap_err().is_rejected());
        assert_eq!(cb.rejections(), 1);
        assert_eq!(cb.calls_total(), 2);
    }

    #[test]
    fn test_failure_rate_and_reset() {
        let (cb, _clock) = breaker(config(100, 1, 30));
        cb.on_success();
        cb.on_failure("x");
        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
        cb.reset_metrics();
        assert_eq!(cb.failures(), 0);
        cb.reset();
        assert_eq!(cb.state().consecutive_failures, 0);
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        let aggressive = CircuitConfig::aggressive();
        let lenient = CircuitConfig::lenient();
        assert!(aggressive.failure_threshold < default.failure_threshold);
        assert!(lenient.failure_threshold > default.failure_threshold);
        assert!(aggressive.recovery_timeout > lenient.recovery_timeout);
    }

    #[test]
    fn test_registry_returns_same_breaker() {
        let registry = CircuitRegistry::new(Arc::new(ManualClock::default()), CircuitConfig::test());
        let a = registry.get(names::ORIGIN_API);
        let b = registry.get(names::ORIGIN_API);
        assert!(Arc::ptr_eq(&a, &b));
        a.on_failure("x");
        a.on_failure("y");
        assert!(registry.any_open());
        let snaps = registry.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].status, CircuitState::Open);
    }

    #[test]
    fn test_circuit_error_methods() {
        let rejected: CircuitError<&str> = CircuitError::Rejected { reason: "open".into() };
        assert!(rejected.is_rejected());
        assert!(rejected.inner().is_none());

        let inner: CircuitError<&str> = CircuitError::Inner("boom");
        assert!(inner.is_inner());
        assert_eq!(inner.inner(), Some(&"boom"));
    }
}
