// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Network connectivity signal.
//!
//! The host app owns the platform's reachability API and pushes transitions
//! into a [`ConnectivityMonitor`]. Everything else holds a
//! `watch::Receiver<Connectivity>`: the cache skips network tiers while
//! offline, and the sync queue drains on every Offline → Online edge.

use crate::error::{FixtureSyncError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Current reachability of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Owner of the connectivity signal.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// Publish a new state. Repeated identical states are not re-broadcast.
    pub fn set(&self, state: Connectivity) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(connectivity = %state, "Connectivity changed");
            crate::metrics::set_connectivity(state);
        }
    }

    pub fn set_online(&self) {
        self.set(Connectivity::Online);
    }

    pub fn set_offline(&self) {
        self.set(Connectivity::Offline);
    }

    /// Return `Offline` as an error when the device has no network.
    pub fn require_online(&self) -> Result<()> {
        if self.current().is_online() {
            Ok(())
        } else {
            Err(FixtureSyncError::Offline("operation requires network".into()))
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let monitor = ConnectivityMonitor::new(Connectivity::Online);
        let mut rx = monitor.subscribe();

        monitor.set_offline();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connectivity::Offline);
        assert!(monitor.require_online().is_err());

        monitor.set_online();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_online());
    }

    #[tokio::test]
    async fn test_repeated_state_not_rebroadcast() {
        let monitor = ConnectivityMonitor::new(Connectivity::Online);
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.set_online();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_display() {
        assert_eq!(Connectivity::Online.to_string(), "online");
        assert_eq!(Connectivity::Offline.to_string(), "offline");
    }
}
