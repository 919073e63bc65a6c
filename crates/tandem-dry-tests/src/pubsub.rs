// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory pub/sub transport.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tandem_store_port::{ChannelMessage, PubSub, TransportError};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Inner {
    channels: BTreeMap<String, Vec<mpsc::Sender<ChannelMessage>>>,
    subscribes: usize,
    unsubscribes: usize,
    published: usize,
    unavailable: bool,
}

/// In-memory [`PubSub`]. Clones share the same channels.
#[derive(Debug, Clone, Default)]
pub struct MemoryPubSub {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryPubSub {
    /// Create a transport with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels with at least one subscriber, ordered.
    pub fn active_channels(&self) -> Vec<String> {
        self.lock().channels.keys().cloned().collect()
    }

    /// Whether `channel` currently has a subscriber.
    pub fn is_active(&self, channel: &str) -> bool {
        self.lock().channels.contains_key(channel)
    }

    /// Number of `subscribe` calls.
    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribes
    }

    /// Number of `unsubscribe` calls.
    pub fn unsubscribe_count(&self) -> usize {
        self.lock().unsubscribes
    }

    /// Number of messages delivered to at least one subscriber.
    pub fn published_count(&self) -> usize {
        self.lock().published
    }

    /// Refuse new subscriptions while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<ChannelMessage>, TransportError> {
        let mut inner = self.lock();
        inner.subscribes += 1;
        if inner.unavailable {
            return Err(TransportError::Unavailable(channel.to_string()));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        inner.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.unsubscribes += 1;
        inner.channels.remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: ChannelMessage) -> Result<(), TransportError> {
        let senders = {
            let mut inner = self.lock();
            let Some(senders) = inner.channels.get_mut(channel) else {
                return Ok(());
            };
            senders.retain(|tx| !tx.is_closed());
            let senders = senders.clone();
            if !senders.is_empty() {
                inner.published += 1;
            }
            senders
        };
        for tx in senders {
            let _ = tx.send(message.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tandem_store_port::ChannelEvent;

    #[tokio::test]
    async fn messages_reach_subscribers_until_unsubscribed() {
        let pubsub = MemoryPubSub::new();
        let mut rx = pubsub.subscribe("posts:id:p1").await.unwrap();
        pubsub
            .publish("posts:id:p1", ChannelMessage::new(ChannelEvent::Update, "p1"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().entity_id(), Some("p1"));

        pubsub.unsubscribe("posts:id:p1").await.unwrap();
        assert!(!pubsub.is_active("posts:id:p1"));
        assert!(rx.recv().await.is_none());
        assert_eq!((pubsub.subscribe_count(), pubsub.unsubscribe_count()), (1, 1));
    }
}
