// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Scripted `TaskExecutor`, `ChangeStream` and `RemoteSource` mocks
//! - Raw change builders
//! - Harness construction over a `ManualClock`

#![allow(dead_code)]

pub mod mocks;

pub use mocks::*;

use fixture_sync::config::StorageConfig;
use fixture_sync::subscription::{ChangeOp, RawChange};
use fixture_sync::{Backends, ConnectivityMonitor, FixtureSync, FixtureSyncConfig, ManualClock};
use serde_json::{Map, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub monitor: ConnectivityMonitor,
    pub executor: Arc<MockExecutor>,
    pub stream: Arc<MockChangeStream>,
    pub remote: Arc<MockRemote>,
    pub sync: FixtureSync<MockExecutor, MockChangeStream>,
}

pub fn sqlite_config(dir: &Path) -> FixtureSyncConfig {
    let path = dir.join("fixtures.db");
    FixtureSyncConfig {
        storage: StorageConfig::at(path.to_string_lossy().to_string()),
        ..FixtureSyncConfig::for_testing()
    }
}

impl Harness {
    pub async fn new(config: FixtureSyncConfig) -> Self {
        Self::with_clock(config, Arc::new(ManualClock::new(1_700_000_000_000))).await
    }

    pub async fn with_clock(config: FixtureSyncConfig, clock: Arc<ManualClock>) -> Self {
        init_tracing();
        let monitor = ConnectivityMonitor::default();
        let executor = Arc::new(MockExecutor::default());
        let stream = Arc::new(MockChangeStream::default());
        let remote = Arc::new(MockRemote::default());
        let backends = Backends::new(Arc::clone(&executor), Arc::clone(&stream))
            .with_remote(remote.clone())
            .with_clock(clock.clone());
        let sync = FixtureSync::open_with(config, backends, monitor.subscribe())
            .await
            .expect("open fixture sync");
        Self {
            clock,
            monitor,
            executor,
            stream,
            remote,
            sync,
        }
    }

    pub async fn in_memory() -> Self {
        Self::new(FixtureSyncConfig::for_testing()).await
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// UPDATE on `table` from `old` to `new` at `timestamp`.
pub fn update(table: &str, old: Value, new: Value, timestamp: i64) -> RawChange {
    RawChange {
        table: table.to_string(),
        op: ChangeOp::Update,
        old: Some(object(old)),
        new: Some(object(new)),
        commit_timestamp: timestamp,
    }
}

/// Poll `check` until it returns true or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
