// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Local storage port.

use async_trait::async_trait;
use tandem_query::{FlatRow, LocalPlan};
use tandem_schema::CollectionShape;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::LocalDocument;

/// Errors raised by a local store adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The collection was never created.
    #[error("unknown collection `{0}`")]
    UnknownCollection(String),
    /// The document does not satisfy the collection shape.
    #[error("document `{id}` rejected by `{table}`: {reason}")]
    Rejected {
        /// Collection.
        table: String,
        /// Document id.
        id: String,
        /// Why the write was refused.
        reason: String,
    },
    /// Engine-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Notification that a document of `table` changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreChange {
    /// Collection.
    pub table: String,
    /// Document id.
    pub id: String,
}

/// The local embedded store, seen as a capability.
///
/// Writes replace whole documents; callers never mutate a previously read
/// document in place.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Create (or open) a typed collection.
    ///
    /// Returns the schema version the collection was stored under before
    /// this call, or `None` when it was newly created.
    async fn create_collection(&self, table: &str, shape: &CollectionShape) -> Result<Option<u32>, StoreError>;

    /// Drop every collection and document.
    async fn reset(&self) -> Result<(), StoreError>;

    /// Read one document (tombstones included).
    async fn get(&self, table: &str, id: &str) -> Result<Option<LocalDocument>, StoreError>;

    /// Insert or replace one document.
    async fn upsert(&self, table: &str, document: LocalDocument) -> Result<(), StoreError>;

    /// Physically remove one document.
    async fn remove(&self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Every document of a collection (tombstones included).
    async fn all(&self, table: &str) -> Result<Vec<LocalDocument>, StoreError>;

    /// Execute a local join plan, returning flat aliased rows.
    ///
    /// Tombstoned (`_deleted`) documents never appear in results: they match
    /// neither the root selector nor any join, so a parent whose only related
    /// document is a tombstone joins nothing.
    async fn query(&self, plan: &LocalPlan) -> Result<Vec<FlatRow>, StoreError>;

    /// Subscribe to change notifications.
    fn changes(&self) -> broadcast::Receiver<StoreChange>;
}
