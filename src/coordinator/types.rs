// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Facade state and status types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (workers spawned)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//!    (storage unusable during start) → Failed
//! ```
//!
//! - **Created**: after `FixtureSync::open()`. Reads, writes and subscriptions
//!   work; nothing drains in the background yet.
//! - **Starting**: `start()` is spawning the workers.
//! - **Running**: queue worker, dead-letter replay and change merge active.
//! - **ShuttingDown**: workers signalled, channels closing, dead letters flushing.
//! - **Stopped**: storage closed. Safe to drop.
//! - **Failed**: startup could not complete.

use crate::circuit_breaker::CircuitSnapshot;
use crate::connectivity::Connectivity;
use crate::dead_letter::DeadLetterStats;
use crate::sync_queue::{QueueStatus, SyncTask};
use serde::Serialize;

/// Lifecycle of a [`FixtureSync`](super::FixtureSync).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue length, processing flag and last attempt.
pub type SyncStatus = QueueStatus;

/// Detailed queue view for diagnostics screens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueReport {
    pub status: QueueStatus,
    /// Tasks waiting, in drain order.
    pub pending: Vec<SyncTask>,
    pub circuit: CircuitSnapshot,
    pub dead_letters: DeadLetterStats,
}

/// Health snapshot. Collected from in-process state only; no network I/O.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    pub connectivity: Connectivity,
    /// Running, with workers alive.
    pub ready: bool,
    /// Ready, online, and no breaker open.
    pub healthy: bool,
    pub queue_length: usize,
    pub active_channels: usize,
    pub cache_entries: usize,
    pub dead_letters: DeadLetterStats,
    pub circuits: Vec<CircuitSnapshot>,
}

impl HealthCheck {
    pub fn open_circuits(&self) -> impl Iterator<Item = &CircuitSnapshot> {
        self.circuits
            .iter()
            .filter(|c| c.status == crate::circuit_breaker::CircuitState::Open)
    }
}
