// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sync-session context for a Tandem replica.
//!
//! A [`SyncSession`] owns every piece of per-replica state: pull streams,
//! the master-state cache, the replication engine, the stale-entity
//! reconciler, the leader relay and the realtime channel manager. Nothing is
//! global, so two sessions in one process never see each other and closing a
//! session tears all of it down.
//!
//! Sessions are opened through [`SessionBuilder`], which loads
//! [`SyncPrefs`](tandem_app_core::prefs::SyncPrefs), resets the replica when
//! the schema fingerprint changed, creates the collections and migrates
//! documents stored under an older schema version.

mod builder;
mod live;
mod session;

pub use builder::{MigrationStrategy, SessionBuilder};
pub use live::LiveQuery;
pub use session::{RefreshReport, SyncSession};

use tandem_app_core::config::ConfigError;
use tandem_query::QueryError;
use tandem_realtime::RealtimeError;
use tandem_replication::SyncError;
use tandem_schema::SchemaError;
use tandem_store_port::{RemoteError, StoreError};
use thiserror::Error;

/// Errors surfaced by a sync session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown table or column.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// The query descriptor did not compile.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// The local store refused an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Replication failed (transport failure, closed pull stream).
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// A realtime channel could not be attached.
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    /// A refresh fetch failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Persisted session state could not be written.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The document does not exist locally (or is a tombstone).
    #[error("`{table}` has no document `{id}`")]
    NotFound {
        /// Table searched.
        table: String,
        /// Primary key searched.
        id: String,
    },
    /// An insert collided with a live local document.
    #[error("`{table}` already holds document `{id}`")]
    Exists {
        /// Table written.
        table: String,
        /// Colliding primary key.
        id: String,
    },
    /// The live query was closed.
    #[error("live query closed")]
    Closed,
}
