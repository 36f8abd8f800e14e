// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Seam to the remote change stream.
//!
//! A channel is keyed by resource table and a filter expression. Opening one
//! performs the subscribe handshake; once open it yields [`ChannelMessage`]s
//! until the remote side closes it or the receiver is dropped.

use super::event::RawChange;
use crate::BoxFuture;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// What to listen to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub table: String,
    /// Filter expression, e.g. `id=in.(m1,m2)`.
    pub filter: String,
}

impl ChannelSpec {
    /// Filter to a set of entity ids.
    pub fn for_entities(table: &str, id_field: &str, entity_ids: &[String]) -> Self {
        Self {
            table: table.to_string(),
            filter: format!("{}=in.({})", id_field, entity_ids.join(",")),
        }
    }

    /// Channel name as the remote side sees it.
    pub fn topic(&self) -> String {
        format!("{}:{}", self.table, self.filter)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Change(RawChange),
    /// The remote side ended the channel.
    Closed { reason: String },
}

/// An open channel. Dropping `events` stops listening locally.
#[derive(Debug)]
pub struct ChangeChannel {
    pub id: String,
    pub events: mpsc::Receiver<ChannelMessage>,
}

/// Remote change-stream client.
pub trait ChangeStream: Send + Sync + 'static {
    /// Subscribe handshake. Resolves once the remote side has acknowledged.
    fn open<'a>(&'a self, spec: &'a ChannelSpec) -> BoxFuture<'a, ChangeChannel>;

    /// Release a channel on the remote side.
    fn close<'a>(&'a self, channel_id: &'a str) -> BoxFuture<'a, ()> {
        debug!(channel_id = %channel_id, "Closing change channel");
        Box::pin(async { Ok(()) })
    }
}

/// Stream whose channels open instantly and never carry changes.
#[derive(Debug, Default)]
pub struct NoOpChangeStream {
    open: DashMap<String, mpsc::Sender<ChannelMessage>>,
    next_id: AtomicU64,
}

impl NoOpChangeStream {
    pub fn open_channels(&self) -> usize {
        self.open.len()
    }
}

impl ChangeStream for NoOpChangeStream {
    fn open<'a>(&'a self, spec: &'a ChannelSpec) -> BoxFuture<'a, ChangeChannel> {
        let id = format!("noop-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(1);
        // Holding the sender keeps the channel open.
        self.open.insert(id.clone(), tx);
        debug!(channel_id = %id, topic = %spec.topic(), "NoOp change stream: channel opened");
        Box::pin(async move { Ok(ChangeChannel { id, events: rx }) })
    }

    fn close<'a>(&'a self, channel_id: &'a str) -> BoxFuture<'a, ()> {
        self.open.remove(channel_id);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_filter() {
        let spec = ChannelSpec::for_entities("matches", "id", &["m1".to_string(), "m2".to_string()]);
        assert_eq!(spec.filter, "id=in.(m1,m2)");
        assert_eq!(spec.topic(), "matches:id=in.(m1,m2)");
    }

    #[tokio::test]
    async fn test_noop_channel_stays_open_until_closed() {
        let stream = NoOpChangeStream::default();
        let spec = ChannelSpec::for_entities("matches", "id", &["m1".to_string()]);
        let mut channel = stream.open(&spec).await.unwrap();
        assert_eq!(stream.open_channels(), 1);
        assert!(channel.events.try_recv().is_err());

        stream.close(&channel.id).await.unwrap();
        assert_eq!(stream.open_channels(), 0);
        assert!(channel.events.recv().await.is_none());
    }
}
