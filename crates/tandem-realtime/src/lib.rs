// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Realtime change channels for a Tandem replica.
//!
//! A live query result is turned into a minimal set of [`ChannelName`]s
//! ([`derive_channels`]). The [`ChannelManager`] reference-counts those
//! names across every caller: the first subscriber attaches the transport
//! channel, the last one to leave schedules a detach after a short delay,
//! and a subscriber arriving inside that window keeps the channel warm.
//!
//! Messages are handed to a [`MessageHandler`]. [`ReplicaHandler`] turns
//! them into pulls: deletes tombstone the local document, inserts and updates
//! use the inline row or a point fetch, and messages older than the local
//! copy are dropped.

mod channel;
mod derive;
mod handler;
mod manager;

pub use channel::{ChannelName, ENTITY_KIND};
pub use derive::derive_channels;
pub use handler::{MessageHandler, ReplicaHandler};
pub use manager::{ChannelManager, Subscription, DEFAULT_DETACH_DELAY};

use tandem_replication::SyncError;
use tandem_schema::SchemaError;
use tandem_store_port::{RemoteError, StoreError, TransportError};
use thiserror::Error;

/// Errors raised by channel management and message handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    /// A channel name is not `table:kind:value`.
    #[error("invalid channel name `{0}`")]
    InvalidChannel(String),
    /// The pub/sub transport refused the channel.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The local store failed while checking staleness.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A point fetch for a header-only message failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The message names a table the schema does not know.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// The pull stream refused the document.
    #[error(transparent)]
    Sync(#[from] SyncError),
}
