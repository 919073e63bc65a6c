// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Leader coordination port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{ChangeRow, LocalDocument, TransportError};

/// Messages exchanged between cooperating replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeaderMessage {
    /// Follower → leader: push these change rows upstream.
    Push {
        /// Table the rows belong to.
        table: String,
        /// Change rows, in write order.
        rows: Vec<ChangeRow>,
    },
    /// Leader → followers: apply these pulled documents.
    Pull {
        /// Table the documents belong to.
        table: String,
        /// Whether the documents are authoritative conflict resolutions.
        authoritative: bool,
        /// Documents, in pull order.
        documents: Vec<LocalDocument>,
    },
}

/// Broadcast capability between replicas, with one elected leader.
///
/// The sync core only ever asks "am I leader"; election is the adapter's job.
#[async_trait]
pub trait LeaderChannel: Send + Sync {
    /// Whether this replica currently owns the remote connection.
    fn is_leader(&self) -> bool;

    /// Send to every other replica.
    async fn broadcast(&self, message: LeaderMessage) -> Result<(), TransportError>;

    /// Receive messages broadcast by other replicas.
    fn on_message(&self) -> mpsc::UnboundedReceiver<LeaderMessage>;
}
