// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry with backoff, rate limiting, bulkheads.
//!
//! - [`RetryConfig`] / [`Backoff`]: exponential backoff with bounded jitter
//! - [`RetryExecutor`]: runs an operation with retries, routes terminal
//!   failures to the [`DeadLetterStore`]
//! - [`RateLimiter`]: token bucket in front of the origin API
//! - [`Bulkhead`]: caps concurrent origin fetches
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), fixture_sync::resilience::BulkheadFull> {
//! use fixture_sync::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // waits if over limit
//!
//! let bulkhead = Bulkhead::new(4);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use crate::classifier::{classify, OperationContext};
use crate::dead_letter::DeadLetterStore;
use crate::error::{FixtureSyncError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Upper bound on jitter as a fraction of the computed delay.
pub const MAX_JITTER: f64 = 0.1;

/// Retry behaviour for one class of operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_retries: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Ceiling for any single delay, jitter included.
    pub max_delay: Duration,

    /// Growth factor per attempt (2.0 = double each time).
    pub backoff_multiplier: f64,

    /// Random extra delay as a fraction of the computed delay, at most 0.1.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: MAX_JITTER,
        }
    }
}

impl RetryConfig {
    /// Short schedule for reads a referee is waiting on.
    ///
    /// ```text
    /// Attempt  Delay before
    /// -------  ------------
    /// 1        -
    /// 2        250ms
    /// 3        500ms
    /// ```
    pub fn interactive() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: MAX_JITTER,
        }
    }

    /// Patient schedule for background write-forwarding.
    pub fn background() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: MAX_JITTER,
        }
    }

    /// Fast, deterministic schedule for tests.
    pub fn testing() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Delay before attempt `attempt + 1`, without jitter (1-indexed).
    ///
    /// `min(max_delay, base_delay × multiplier^(attempt-1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.base_delay.min(self.max_delay);
        }
        let multiplier = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1).min(64) as i32);
        let delay_secs = (self.base_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay_secs)
    }

    /// Start a fresh delay sequence.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            attempt: 0,
            last: Duration::ZERO,
        }
    }
}

/// Sequence of jittered delays that never decreases and never exceeds
/// `max_delay`.
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff<'_> {
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let base = self.config.delay_for_attempt(self.attempt);
        let jitter_fraction = self.config.jitter.clamp(0.0, MAX_JITTER);
        let jitter = if jitter_fraction > 0.0 {
            base.mul_f64(jitter_fraction * rand::random::<f64>())
        } else {
            Duration::ZERO
        };
        let delay = (base + jitter).min(self.config.max_delay).max(self.last);
        self.last = delay;
        delay
    }
}

/// Runs fallible operations with retries and dead-letters terminal failures.
#[derive(Clone)]
pub struct RetryExecutor {
    dead_letters: Arc<DeadLetterStore>,
}

impl RetryExecutor {
    pub fn new(dead_letters: Arc<DeadLetterStore>) -> Self {
        Self { dead_letters }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    /// Run `op` until it succeeds, fails non-retryably, or `max_retries`
    /// attempts are used up.
    ///
    /// `op` receives the 1-indexed attempt number. Each failure is
    /// classified; a non-retryable failure stops immediately. Either terminal
    /// outcome upserts a dead letter under `operation_key`; a success resolves
    /// any existing one.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        operation_key: &str,
        context: OperationContext,
        config: &RetryConfig,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let max_attempts = config.max_retries.max(1);
        let mut backoff = config.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let ctx = context.clone().with_attempt(attempt);
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation_key = %operation_key, attempt, "Operation succeeded after retry");
                    }
                    self.dead_letters.resolve(operation_key);
                    return Ok(value);
                }
                Err(e) => {
                    let classified = classify(&e, &ctx);
                    crate::metrics::record_operation_failure(&ctx.operation, classified.category.as_str());

                    if !classified.retryable {
                        warn!(
                            operation_key = %operation_key,
                            attempt,
                            category = %classified.category,
                            error = %classified.message,
                            "Non-retryable failure"
                        );
                        let category = classified.category;
                        let message = classified.message.clone();
                        self.dead_letters.upsert(operation_key, classified, attempt, None);
                        return Err(FixtureSyncError::NonRetryable {
                            operation: operation_key.to_string(),
                            category,
                            message,
                        });
                    }

                    if attempt >= max_attempts {
                        warn!(
                            operation_key = %operation_key,
                            attempts = attempt,
                            category = %classified.category,
                            error = %classified.message,
                            "Retries exhausted"
                        );
                        let category = classified.category;
                        let message = classified.message.clone();
                        self.dead_letters.upsert(operation_key, classified, attempt, None);
                        return Err(FixtureSyncError::RetriesExhausted {
                            operation: operation_key.to_string(),
                            attempts: attempt,
                            category,
                            message,
                        });
                    }

                    let delay = backoff.next_delay();
                    debug!(
                        operation_key = %operation_key,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        category = %classified.category,
                        "Retrying after failure"
                    );
                    crate::metrics::record_retry(&ctx.operation);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket settings: `refill_rate` tokens per second, up to `burst_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 10 origin calls/sec with a burst of 20.
    fn default() -> Self {
        Self {
            burst_size: 20,
            refill_rate: 10,
        }
    }
}

impl RateLimitConfig {
    /// For metered connections.
    pub fn conservative() -> Self {
        Self {
            burst_size: 5,
            refill_rate: 2,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            burst_size: u32::MAX,
            refill_rate: u32::MAX,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits how many operations of one kind run at once.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore.clone().acquire_owned().await.map_err(|_| BulkheadFull {
            max_concurrent: self.max_concurrent,
        })
    }

    /// `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorCategory;
    use crate::clock::ManualClock;
    use crate::dead_letter::{DeadLetterPolicy, DeadLetterStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor() -> RetryExecutor {
        let store = DeadLetterStore::new(DeadLetterPolicy::default(), Arc::new(ManualClock::default()));
        RetryExecutor::new(Arc::new(store))
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jittered_backoff_is_monotonic_and_capped() {
        let config = RetryConfig {
            max_retries: 20,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 1.05,
            jitter: 0.5, // clamped to 0.1
        };
        let mut backoff = config.backoff();
        let mut last = Duration::ZERO;
        for attempt in 1..=60 {
            let delay = backoff.next_delay();
            assert!(delay >= last, "attempt {attempt}: {delay:?} < {last:?}");
            assert!(delay <= config.max_delay);
            let base = config.delay_for_attempt(attempt);
            assert!(delay <= (base.mul_f64(1.0 + MAX_JITTER) + Duration::from_nanos(1)).max(last));
            last = delay;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_uses_all_attempts() {
        let exec = executor();
        let calls = AtomicU32::new(0);
        let result: Result<()> = exec
            .execute_with_retry("fetch:m1", OperationContext::new("fetch"), &RetryConfig::testing(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FixtureSyncError::network("fetch", "connection reset")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(FixtureSyncError::RetriesExhausted { attempts, category, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(category, ErrorCategory::Network);
            }
            other => panic!("unexpected: {other:?}"),
        }
        let entry = exec.dead_letters().get("fetch:m1").unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Pending);
        assert_eq!(entry.retry_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_runs_once() {
        let exec = executor();
        let calls = AtomicU32::new(0);
        let result: Result<()> = exec
            .execute_with_retry("submit:score", OperationContext::new("submit"), &RetryConfig::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FixtureSyncError::Validation("score must be >= 0".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(FixtureSyncError::NonRetryable { .. })));
        let entry = exec.dead_letters().get("submit:score").unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Failed);
        assert_eq!(entry.error.category, ErrorCategory::DataValidation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failure_resolves_dead_letter() {
        let exec = executor();
        let calls = AtomicU32::new(0);
        let _: Result<()> = exec
            .execute_with_retry("fetch:m2", OperationContext::new("fetch"), &RetryConfig::testing(), |_| async {
                Err::<(), _>(FixtureSyncError::network("fetch", "offline"))
            })
            .await;
        assert!(exec.dead_letters().get("fetch:m2").is_some());

        let value = exec
            .execute_with_retry("fetch:m2", OperationContext::new("fetch"), &RetryConfig::testing(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(FixtureSyncError::timeout("fetch", Duration::from_secs(1)))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(exec.dead_letters().get("fetch:m2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_between_attempts_follow_schedule() {
        let exec = executor();
        let stamps = parking_lot::Mutex::new(Vec::new());
        let config = RetryConfig {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };
        let _: Result<()> = exec
            .execute_with_retry("k", OperationContext::new("op"), &config, |_| {
                stamps.lock().push(tokio::time::Instant::now());
                async { Err::<(), _>(FixtureSyncError::network("op", "connection refused")) }
            })
            .await;

        let stamps = stamps.into_inner();
        assert_eq!(stamps.len(), 4);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(250)]);
    }

    #[test]
    fn test_rate_limiter_try_acquire_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1,
        });
        for _ in 0..5 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }
        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
        assert_eq!(limiter.config().burst_size, 5);
    }

    #[test]
    fn test_bulkhead_try_acquire() {
        let bulkhead = Bulkhead::new(2);
        let p1 = bulkhead.try_acquire();
        let p2 = bulkhead.try_acquire();
        assert!(p1.is_some() && p2.is_some());
        assert!(bulkhead.try_acquire().is_none());
        drop(p1);
        assert_eq!(bulkhead.available(), 1);
    }

    #[test]
    fn test_bulkhead_zero_is_clamped() {
        assert_eq!(Bulkhead::new(0).max_concurrent(), 1);
    }
}
