// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pub/sub transport port.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandem_schema::Row;
use thiserror::Error;
use tokio::sync::mpsc;

/// Header carrying the changed entity's primary key.
pub const ENTITY_ID_HEADER: &str = "entity-id";
/// Header carrying the changed entity's update timestamp.
pub const UPDATED_AT_HEADER: &str = "updated-at";

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport refused or lost the channel.
    #[error("channel `{0}` unavailable")]
    Unavailable(String),
    /// The transport shut down.
    #[error("transport closed")]
    Closed,
    /// Anything else.
    #[error("transport error: {0}")]
    Other(String),
}

/// Kind of change a message announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEvent {
    /// Row created.
    Insert,
    /// Row changed.
    Update,
    /// Row removed.
    Delete,
}

/// One message on a change channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Change kind.
    pub event: ChannelEvent,
    /// Out-of-band headers (entity id, update time).
    pub headers: BTreeMap<String, String>,
    /// Changed row in column space, when sent inline.
    pub payload: Option<Row>,
}

impl ChannelMessage {
    /// Message for `entity_id` without payload.
    pub fn new(event: ChannelEvent, entity_id: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(ENTITY_ID_HEADER.to_string(), entity_id.to_string());
        Self {
            event,
            headers,
            payload: None,
        }
    }

    /// Attach the declared update time.
    pub fn with_updated_at(mut self, updated_at: &str) -> Self {
        self.headers.insert(UPDATED_AT_HEADER.to_string(), updated_at.to_string());
        self
    }

    /// Attach the row inline.
    pub fn with_payload(mut self, row: Row) -> Self {
        self.payload = Some(row);
        self
    }

    /// Entity id header.
    pub fn entity_id(&self) -> Option<&str> {
        self.headers.get(ENTITY_ID_HEADER).map(String::as_str)
    }

    /// Update time header.
    pub fn updated_at(&self) -> Option<&str> {
        self.headers.get(UPDATED_AT_HEADER).map(String::as_str)
    }
}

/// Named-channel transport.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Open `channel`; messages arrive on the returned receiver until
    /// [`unsubscribe`](Self::unsubscribe).
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<ChannelMessage>, TransportError>;

    /// Close `channel`. Closing an unknown channel is not an error.
    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Publish to every subscriber of `channel`.
    async fn publish(&self, channel: &str, message: ChannelMessage) -> Result<(), TransportError>;
}
