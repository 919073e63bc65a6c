// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replication engine for the Tandem sync core.
//!
//! Mutations move through `pending → {confirmed | conflicted | failed}`:
//!
//! - [`ReplicationEngine::push`] sends each [`ChangeRow`](tandem_store_port::ChangeRow)
//!   upstream (delete by key, full row for inserts, field diff plus a version
//!   guard for updates). Pushes for the same document are serialized.
//! - Confirmed rows and conflict resolutions re-enter the replica through the
//!   [`PullHub`], one strictly ordered stream per table. The consumer drops
//!   pulls that would regress a fresher local write.
//! - [`StaleReconciler`] converges rows a fresh fetch no longer returns.
//! - [`LeaderRelay`] forwards pushes to the leader and fans pulls out to
//!   followers when several replicas cooperate.
//!
//! Conflicts are outcomes, not errors: only transport failures (remote
//! errors without a structured code) surface as [`SyncError::Transport`].
//! Nothing here retries.

mod locks;
mod pull;
mod push;
mod reconcile;
mod relay;

pub use locks::DocumentLocks;
pub use pull::{apply_pull, MasterStates, PullDecision, PullEvent, PullHub, PullOrigin, PullStream};
pub use push::{PushOutcome, ReplicationEngine};
pub use reconcile::{ReconcileReport, StaleReconciler};
pub use relay::{LeaderRelay, Submission};

use std::sync::Arc;

use tandem_schema::SchemaError;
use tandem_store_port::{LocalDocument, RemoteError, StoreError, TransportError};
use thiserror::Error;

/// Errors surfaced by replication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The remote store failed without a structured answer.
    #[error("transport failure: {0}")]
    Transport(RemoteError),
    /// The local store refused an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A table is unknown to the schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// No consumer is attached to the table's pull stream.
    #[error("pull stream for `{0}` is closed")]
    PullClosed(String),
    /// The leader channel failed.
    #[error(transparent)]
    Relay(#[from] TransportError),
}

/// Kind of write a push carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushOperation {
    /// Full row, no assumed master state.
    Insert,
    /// Field diff against the assumed master state.
    Update,
    /// Delete by primary key.
    Delete,
}

impl PushOperation {
    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Payload handed to the push-error callback.
#[derive(Debug, Clone, PartialEq)]
pub struct PushErrorReport {
    /// Table of the failed push.
    pub table: String,
    /// Operation that failed.
    pub operation: PushOperation,
    /// Document the push tried to write.
    pub document: LocalDocument,
    /// Remote error (coded for conflicts, bare for transport failures).
    pub error: RemoteError,
}

/// Callback invoked for every conflict and transport failure.
pub type PushErrorCallback = Arc<dyn Fn(&PushErrorReport) + Send + Sync>;
