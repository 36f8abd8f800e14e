// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for fixture sync.
//!
//! Configuration is passed to [`FixtureSync::open()`](crate::FixtureSync::open)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Every field has a default, so an empty document is a valid config.
//!
//! # Quick Start
//!
//! ```rust
//! use fixture_sync::config::{FixtureSyncConfig, StorageConfig};
//!
//! let config = FixtureSyncConfig {
//!     storage: StorageConfig::at("/data/fixtures.db"),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! FixtureSyncConfig
//! ├── cache: CacheSettings              # memory tier limits, TTL, timeouts
//! ├── queue: QueueSettings              # drain cadence and retry bounds
//! ├── circuits: CircuitSettings         # one breaker per remote resource
//! ├── retry: RetrySettings              # execute_with_retry schedule
//! ├── subscription: SubscriptionSettings # change stream + classification rules
//! ├── dead_letter: DeadLetterSettings   # cooldowns, max age, replay cadence
//! └── storage: StorageConfig            # SQLite path (None = memory only)
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! cache:
//!   max_entries: 1000
//!   default_ttl: "10m"
//! queue:
//!   periodic_interval: "2m"
//! subscription:
//!   rules:
//!     terminal_statuses: ["cancelled", "abandoned"]
//! storage:
//!   sqlite_path: "/data/fixtures.db"
//! ```

use crate::cache::{CacheConfig, StaleFallbackPolicy};
use crate::circuit_breaker::CircuitConfig;
use crate::dead_letter::DeadLetterPolicy;
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::subscription::{ClassificationRules, SubscriptionConfig};
use crate::sync_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureSyncConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub circuits: CircuitSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub subscription: SubscriptionSettings,
    #[serde(default)]
    pub dead_letter: DeadLetterSettings,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl FixtureSyncConfig {
    /// Memory-only storage and short timers.
    pub fn for_testing() -> Self {
        Self {
            cache: CacheSettings::for_testing(),
            queue: QueueSettings::for_testing(),
            circuits: CircuitSettings::for_testing(),
            retry: RetrySettings::for_testing(),
            subscription: SubscriptionSettings::for_testing(),
            dead_letter: DeadLetterSettings::default(),
            storage: StorageConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CacheSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Memory tier byte budget.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// TTL for reads that pass none (humantime, e.g. "5m").
    #[serde(default = "default_ttl")]
    pub default_ttl: String,

    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    #[serde(default = "default_origin_timeout_ms")]
    pub origin_timeout_ms: u64,

    #[serde(default = "default_origin_concurrency")]
    pub origin_concurrency: usize,

    /// Token bucket in front of the origin API.
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Serve stale data when the origin is unavailable.
    #[serde(default = "default_true")]
    pub stale_fallback: bool,

    /// Oldest data the stale fallback may serve (humantime). Unset = no bound.
    #[serde(default)]
    pub max_stale_age: Option<String>,

    /// Whether the offline snapshot may back a failed online read.
    #[serde(default = "default_true")]
    pub use_offline_snapshot: bool,
}

fn default_max_entries() -> usize {
    500
}

fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_ttl() -> String {
    "5m".to_string()
}

fn default_remote_timeout_ms() -> u64 {
    5_000
}

fn default_origin_timeout_ms() -> u64 {
    15_000
}

fn default_origin_concurrency() -> usize {
    4
}

fn default_rate_limit_per_sec() -> u32 {
    10
}

fn default_rate_limit_burst() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            default_ttl: default_ttl(),
            remote_timeout_ms: default_remote_timeout_ms(),
            origin_timeout_ms: default_origin_timeout_ms(),
            origin_concurrency: default_origin_concurrency(),
            rate_limit_enabled: true,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            stale_fallback: true,
            max_stale_age: None,
            use_offline_snapshot: true,
        }
    }
}

impl CacheSettings {
    pub fn for_testing() -> Self {
        Self {
            max_entries: 50,
            max_bytes: 64 * 1024,
            default_ttl: "1m".to_string(),
            remote_timeout_ms: 100,
            origin_timeout_ms: 200,
            origin_concurrency: 2,
            rate_limit_enabled: false,
            ..Default::default()
        }
    }

    pub fn default_ttl_duration(&self) -> Duration {
        parse_duration_or(&self.default_ttl, Duration::from_secs(300))
    }

    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }

    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            default_ttl: self.default_ttl_duration(),
            remote_timeout: Duration::from_millis(self.remote_timeout_ms),
            origin_timeout: Duration::from_millis(self.origin_timeout_ms),
            origin_concurrency: self.origin_concurrency,
            origin_rate_limit: self.rate_limit_config(),
            stale: StaleFallbackPolicy {
                enabled: self.stale_fallback,
                max_stale_age: self.max_stale_age.as_deref().and_then(|s| humantime::parse_duration(s).ok()),
                use_offline_snapshot: self.use_offline_snapshot,
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Retry bound given to new tasks.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,

    /// Pause before re-draining a pass that left work.
    #[serde(default = "default_retry_cooldown_ms")]
    pub retry_cooldown_ms: u64,

    /// Safety-net drain cadence while online (humantime).
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval: String,

    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_task_timeout_sec")]
    pub task_timeout_sec: u64,

    #[serde(default = "default_max_force_passes")]
    pub max_force_passes: u32,

    #[serde(default = "default_force_pass_delay_ms")]
    pub force_pass_delay_ms: u64,
}

fn default_queue_max_retries() -> u32 {
    3
}

fn default_retry_cooldown_ms() -> u64 {
    5_000
}

fn default_periodic_interval() -> String {
    "5m".to_string()
}

fn default_queue_concurrency() -> usize {
    1
}

fn default_task_timeout_sec() -> u64 {
    30
}

fn default_max_force_passes() -> u32 {
    5
}

fn default_force_pass_delay_ms() -> u64 {
    1_000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: default_queue_max_retries(),
            retry_cooldown_ms: default_retry_cooldown_ms(),
            periodic_interval: default_periodic_interval(),
            concurrency: default_queue_concurrency(),
            task_timeout_sec: default_task_timeout_sec(),
            max_force_passes: default_max_force_passes(),
            force_pass_delay_ms: default_force_pass_delay_ms(),
        }
    }
}

impl QueueSettings {
    pub fn for_testing() -> Self {
        Self {
            max_retries: 2,
            retry_cooldown_ms: 50,
            periodic_interval: "1s".to_string(),
            task_timeout_sec: 1,
            force_pass_delay_ms: 10,
            ..Default::default()
        }
    }

    pub fn periodic_interval_duration(&self) -> Duration {
        parse_duration_or(&self.periodic_interval, Duration::from_secs(300))
    }

    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_retries: self.max_retries,
            retry_cooldown: Duration::from_millis(self.retry_cooldown_ms),
            periodic_interval: self.periodic_interval_duration(),
            concurrency: self.concurrency.max(1),
            task_timeout: Duration::from_secs(self.task_timeout_sec),
            max_force_passes: self.max_force_passes,
            force_pass_delay: Duration::from_millis(self.force_pass_delay_ms),
            ..QueueConfig::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CircuitSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// One breaker's thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_recovery_timeout_sec")]
    pub recovery_timeout_sec: u64,
    #[serde(default = "default_max_timeout_sec")]
    pub max_timeout_sec: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout_sec() -> u64 {
    30
}

fn default_max_timeout_sec() -> u64 {
    300
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitConfig::default())
    }
}

impl From<&CircuitConfig> for BreakerSettings {
    fn from(c: &CircuitConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            success_threshold: c.success_threshold,
            recovery_timeout_sec: c.recovery_timeout.as_secs(),
            max_timeout_sec: c.max_timeout.as_secs(),
            backoff_multiplier: c.backoff_multiplier,
        }
    }
}

impl BreakerSettings {
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold.max(1),
            success_threshold: self.success_threshold.max(1),
            recovery_timeout: Duration::from_secs(self.recovery_timeout_sec),
            max_timeout: Duration::from_secs(self.max_timeout_sec),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default)]
    pub origin_api: BreakerSettings,
    #[serde(default = "default_change_stream_breaker")]
    pub change_stream: BreakerSettings,
    #[serde(default)]
    pub remote_db: BreakerSettings,
}

fn default_change_stream_breaker() -> BreakerSettings {
    BreakerSettings::from(&CircuitConfig::aggressive())
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            origin_api: BreakerSettings::default(),
            change_stream: default_change_stream_breaker(),
            remote_db: BreakerSettings::default(),
        }
    }
}

impl CircuitSettings {
    /// Second-granularity settings cannot express the millisecond test
    /// timeouts, so tests trip at two failures and recover after one second.
    pub fn for_testing() -> Self {
        let fast = BreakerSettings {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout_sec: 1,
            max_timeout_sec: 4,
            backoff_multiplier: 2.0,
        };
        Self {
            origin_api: fast.clone(),
            change_stream: fast.clone(),
            remote_db: fast,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    #[serde(default = "default_retry_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Fraction of the delay added at random, capped at 0.1.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_retry_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    crate::resilience::MAX_JITTER
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_retry_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    pub fn for_testing() -> Self {
        Self {
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter: 0.0,
            ..Default::default()
        }
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter.clamp(0.0, crate::resilience::MAX_JITTER),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SubscriptionSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Table the change channels watch.
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_batch_delay_ms")]
    pub default_batch_delay_ms: u64,
    /// Batches buffered per subscriber before drops.
    #[serde(default = "default_listener_capacity")]
    pub listener_capacity: usize,
    #[serde(default)]
    pub rules: ClassificationRules,
}

fn default_table() -> String {
    "matches".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_batch_delay_ms() -> u64 {
    500
}

fn default_listener_capacity() -> usize {
    32
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            table: default_table(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            default_batch_delay_ms: default_batch_delay_ms(),
            listener_capacity: default_listener_capacity(),
            rules: ClassificationRules::default(),
        }
    }
}

impl SubscriptionSettings {
    pub fn for_testing() -> Self {
        Self {
            handshake_timeout_ms: 100,
            default_batch_delay_ms: 20,
            listener_capacity: 4,
            ..Default::default()
        }
    }

    pub fn to_subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            table: self.table.clone(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            default_batch_delay: Duration::from_millis(self.default_batch_delay_ms),
            listener_capacity: self.listener_capacity.max(1),
            rules: self.rules.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeadLetterSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterSettings {
    /// Entries older than this stop being replayed (humantime).
    #[serde(default = "default_max_age")]
    pub max_age: String,
    /// How often due entries are replayed and the store flushed.
    #[serde(default = "default_replay_interval_sec")]
    pub replay_interval_sec: u64,
    #[serde(default = "default_network_cooldown_sec")]
    pub network_cooldown_sec: u64,
    #[serde(default = "default_network_cooldown_sec")]
    pub timeout_cooldown_sec: u64,
    #[serde(default = "default_rate_limit_cooldown_sec")]
    pub rate_limit_cooldown_sec: u64,
    #[serde(default = "default_api_cooldown_sec")]
    pub api_cooldown_sec: u64,
    #[serde(default = "default_database_cooldown_sec")]
    pub database_cooldown_sec: u64,
}

fn default_max_age() -> String {
    "24h".to_string()
}

fn default_replay_interval_sec() -> u64 {
    30
}

fn default_network_cooldown_sec() -> u64 {
    30
}

fn default_rate_limit_cooldown_sec() -> u64 {
    60
}

fn default_api_cooldown_sec() -> u64 {
    120
}

fn default_database_cooldown_sec() -> u64 {
    300
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            replay_interval_sec: default_replay_interval_sec(),
            network_cooldown_sec: default_network_cooldown_sec(),
            timeout_cooldown_sec: default_network_cooldown_sec(),
            rate_limit_cooldown_sec: default_rate_limit_cooldown_sec(),
            api_cooldown_sec: default_api_cooldown_sec(),
            database_cooldown_sec: default_database_cooldown_sec(),
        }
    }
}

impl DeadLetterSettings {
    pub fn replay_interval(&self) -> Duration {
        Duration::from_secs(self.replay_interval_sec.max(1))
    }

    pub fn to_policy(&self) -> DeadLetterPolicy {
        DeadLetterPolicy {
            max_age: parse_duration_or(&self.max_age, Duration::from_secs(24 * 60 * 60)),
            network_cooldown: Duration::from_secs(self.network_cooldown_sec),
            timeout_cooldown: Duration::from_secs(self.timeout_cooldown_sec),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_sec),
            api_cooldown: Duration::from_secs(self.api_cooldown_sec),
            database_cooldown: Duration::from_secs(self.database_cooldown_sec),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Local persistence. With no path, every tier and the dead-letter store
/// live in memory and nothing survives a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

impl StorageConfig {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: Some(path.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self { sqlite_path: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config: FixtureSyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.queue.periodic_interval_duration(), Duration::from_secs(300));
        assert_eq!(config.circuits.change_stream.failure_threshold, 3);
        assert!(config.storage.sqlite_path.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config: FixtureSyncConfig = serde_json::from_str(
            r#"{
                "cache": {"default_ttl": "10m", "max_stale_age": "1h"},
                "subscription": {"rules": {"terminal_statuses": ["void"]}},
                "storage": {"sqlite_path": "/tmp/f.db"}
            }"#,
        )
        .unwrap();

        let cache = config.cache.to_cache_config();
        assert_eq!(cache.default_ttl, Duration::from_secs(600));
        assert_eq!(cache.stale.max_stale_age, Some(Duration::from_secs(3600)));
        assert_eq!(cache.max_entries, 500);

        let rules = config.subscription.to_subscription_config().rules;
        assert_eq!(rules.terminal_statuses, vec!["void".to_string()]);
        assert_eq!(rules.status_field, "status");
        assert_eq!(config.storage.sqlite_path.as_deref(), Some("/tmp/f.db"));
    }

    #[test]
    fn test_bad_duration_falls_back() {
        let settings = CacheSettings {
            default_ttl: "soon".into(),
            ..Default::default()
        };
        assert_eq!(settings.default_ttl_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_conversions_clamp() {
        let retry = RetrySettings {
            max_retries: 0,
            jitter: 0.5,
            ..Default::default()
        };
        let config = retry.to_retry_config();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.jitter, crate::resilience::MAX_JITTER);

        let breaker = BreakerSettings {
            failure_threshold: 0,
            ..Default::default()
        };
        assert_eq!(breaker.to_circuit_config().failure_threshold, 1);
    }

    #[test]
    fn test_rate_limit_toggle() {
        let mut settings = CacheSettings::default();
        assert_eq!(settings.rate_limit_config().unwrap().refill_rate, 10);
        settings.rate_limit_enabled = false;
        assert!(settings.rate_limit_config().is_none());
    }

    #[test]
    fn test_dead_letter_policy() {
        let policy = DeadLetterSettings::default().to_policy();
        assert_eq!(policy.max_age, Duration::from_secs(86_400));
        assert_eq!(policy.rate_limit_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_for_testing_is_memory_only() {
        let config = FixtureSyncConfig::for_testing();
        assert!(config.storage.sqlite_path.is_none());
        assert!(config.cache.to_cache_config().origin_rate_limit.is_none());
    }
}
