// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Fixture Sync
//!
//! Offline-first data freshness and resilience for a referee client that
//! mirrors tournament fixtures over an unreliable mobile connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              FixtureSync                                  │
//! │                                                                           │
//! │  read(key) ──► TieredCache                                                │
//! │                memory → local → offline → remote_db → origin_api          │
//! │                   │ stale                                 ▲               │
//! │                   ▼                                       │ breaker       │
//! │               SyncTaskQueue ──── drain (online) ──► TaskExecutor          │
//! │                   │ terminal failure                                      │
//! │                   ▼                                                       │
//! │            DeadLetterStore ── replay after cooldown ──► SyncTaskQueue     │
//! │                                                                           │
//! │  ChangeStream ──► ChangeEventSubscriptionManager ──► EventBatch ──► apps  │
//! │                        (breaker, classify, batch)        └──► cache merge │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Bounded reads**: every network tier has a timeout; offline skips them.
//! 2. **Eventual delivery**: queued work drains on reconnect and periodically,
//!    and dead letters are replayed after a per-category cooldown.
//! 3. **No retry storms**: bounded retries, jittered backoff, breakers and an
//!    optional token bucket in front of the origin.
//! 4. **Ordered notifications**: change events arrive batched, priority first.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fixture_sync::{Connectivity, ConnectivityMonitor, FixtureSync, FixtureSyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> fixture_sync::Result<()> {
//!     let monitor = ConnectivityMonitor::new(Connectivity::Online);
//!     let mut sync = FixtureSync::open_standalone(FixtureSyncConfig::default(), monitor.subscribe()).await?;
//!     sync.start().await?;
//!
//!     let fixtures = sync
//!         .read("fixtures:today", || async { Ok::<_, std::io::Error>(vec!["m1".to_string()]) }, None)
//!         .await?;
//!     println!("{} fixtures from {}", fixtures.data.len(), fixtures.tier);
//!
//!     sync.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod storage;
pub mod subscription;
pub mod sync_queue;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = error::Result<T>> + Send + 'a>>;

// Re-exports for convenience
pub use cache::{CacheResult, CacheTier, RemoteSource, TierStore, TieredCache};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitRegistry, CircuitState};
pub use classifier::{classify, ClassifiedError, ErrorCategory, OperationContext, Severity};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::FixtureSyncConfig;
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use coordinator::{Backends, EngineState, FixtureSync, HealthCheck};
pub use dead_letter::{DeadLetterEntry, DeadLetterStatus, DeadLetterStore};
pub use error::{FixtureSyncError, Result};
pub use subscription::{ChangeEvent, ChangeEventSubscriptionManager, ChangeStream, EventBatch, EventType};
pub use sync_queue::{SyncTask, SyncTaskQueue, TaskExecutor};
