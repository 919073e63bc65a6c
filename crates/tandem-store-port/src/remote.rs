// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Remote store port.

use async_trait::async_trait;
use serde_json::Value;
use tandem_query::{PageRange, QueryNode, RemoteRequest};
use tandem_schema::Row;
use thiserror::Error;

/// Remote failure. A structured `code` marks a rejection by the store
/// (treated as a write conflict); no code means the request never got a
/// structured answer (transport failure).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote error [{}]: {message}", code.as_deref().unwrap_or("transport"))]
pub struct RemoteError {
    /// Structured error code, when the store answered with one.
    pub code: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl RemoteError {
    /// Rejection carrying a structured code.
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Failure without a structured answer.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Whether this error is a conflict (structured rejection).
    pub fn is_conflict(&self) -> bool {
        self.code.is_some()
    }
}

/// Optimistic-concurrency guard on an update: the write only applies while
/// `column` still holds `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionGuard {
    /// Column carrying the version token or update timestamp.
    pub column: String,
    /// Value the writer last saw.
    pub expected: Value,
}

/// The remote relational store.
///
/// Rows cross this boundary in column space (snake_case).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Execute one window of a compiled fetch; rows embed the include tree.
    async fn fetch(&self, query: &QueryNode, range: PageRange) -> Result<Vec<Row>, RemoteError>;

    /// Point lookup by primary key.
    async fn fetch_by_id(&self, table: &str, id: &str) -> Result<Option<Row>, RemoteError>;

    /// Insert a full row; returns the stored row (with its version token).
    async fn insert(&self, table: &str, row: Row) -> Result<Row, RemoteError>;

    /// Apply `patch` to one row, subject to `guard`; returns the stored row.
    async fn update(&self, table: &str, id: &str, patch: Row, guard: Option<VersionGuard>) -> Result<Row, RemoteError>;

    /// Delete by primary key.
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    /// Execute every batch of `request` and return the logical result: the
    /// rows of its result windows, concatenated. A short page ends the fetch.
    async fn fetch_request(&self, request: &RemoteRequest) -> Result<Vec<Row>, RemoteError> {
        for range in request.prefix_ranges() {
            if self.fetch(&request.root, *range).await?.len() < range.limit {
                return Ok(Vec::new());
            }
        }
        let mut rows = Vec::new();
        let mut last = None;
        for range in request.result_ranges() {
            let page = self.fetch(&request.root, *range).await?;
            let short = page.len() < range.limit;
            rows.extend(page);
            if short {
                return Ok(rows);
            }
            last = Some(*range);
        }
        while let Some(range) = last.filter(|_| request.open_ended) {
            let next = request.next_range(range);
            let page = self.fetch(&request.root, next).await?;
            let short = page.len() < next.limit;
            rows.extend(page);
            last = (!short).then_some(next);
        }
        Ok(rows)
    }
}
