// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Relation-aware query compiler and result materializer.
//!
//! One [`QueryDescriptor`] is lowered into two execution targets that must
//! agree on semantics:
//!
//! - [`LocalPlan`]: a join tree for the local incremental engine. Root
//!   filter/sort/limit/offset run in the engine; nested relations only carry
//!   their filter into the join, and their sort/limit/offset are deferred to
//!   [`materialize`].
//! - [`RemoteRequest`]: one filtered fetch whose select expression embeds the
//!   include tree, plus the page batches needed to reach deep offsets.
//!
//! Both lowerings start from the same normalized [`QueryNode`] tree so filter
//! and sort normalization is written once.
//!
//! # Semantics
//!
//! Predicates use SQL three-valued logic (a comparison against a missing or
//! NULL value is unknown, and unknown never matches, even under `not`).
//! Ordering follows the remote store default: NULLs sort last ascending and
//! first descending. Every sort ends with the primary key so pagination is
//! stable.

mod descriptor;
mod eval;
mod filter;
mod local;
mod materialize;
mod normalize;
mod remote;
mod sort;

pub use descriptor::{FilterInput, QueryDescriptor, RelationRequest, SortInput, SortItem};
pub use eval::{compare_values, like_match, order_values};
pub use filter::{Comparison, Operator, Predicate};
pub use local::{flat_key, FlatRow, LocalJoin, LocalPlan, ROOT_ALIAS};
pub use materialize::{collect_entities, materialize, EntityIndex};
pub use normalize::QueryNode;
pub use remote::{PageRange, RemoteRequest};
pub use sort::{compare_rows, Collation, Direction, SortKey};

use std::sync::Arc;

use tandem_schema::{Schema, SchemaError};

/// Default maximum window a single remote fetch may cover.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Errors raised while compiling a query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Unknown table/column or unresolvable relation.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// An operator was used against an incompatible value or column.
    #[error("invalid filter on `{column}` ({operator}): {reason}")]
    InvalidFilter {
        /// Column (or combinator keyword) being filtered.
        column: String,
        /// Operator name.
        operator: String,
        /// What made the shape incompatible.
        reason: String,
    },
    /// A sort spec could not be normalized.
    #[error("invalid sort: {0}")]
    InvalidSort(String),
    /// The descriptor itself is malformed (bad relation name, bad JSON shape).
    #[error("invalid query descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Compiles query descriptors against one schema.
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    schema: Arc<Schema>,
    page_size: usize,
}

impl QueryCompiler {
    /// Create a compiler with the default page size.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the maximum remote fetch window (clamped to at least 1).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Schema this compiler resolves against.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Maximum remote fetch window.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Run the shared normalization pass.
    pub fn normalize(&self, descriptor: &QueryDescriptor) -> Result<QueryNode, QueryError> {
        normalize::normalize(&self.schema, descriptor)
    }

    /// Lower a descriptor into a local join plan.
    pub fn compile_local(&self, descriptor: &QueryDescriptor) -> Result<LocalPlan, QueryError> {
        let root = self.normalize(descriptor)?;
        Ok(local::lower(&self.schema, &root))
    }

    /// Lower a descriptor into a remote fetch request.
    pub fn compile_remote(&self, descriptor: &QueryDescriptor) -> Result<RemoteRequest, QueryError> {
        let root = self.normalize(descriptor)?;
        Ok(remote::lower(root, self.page_size))
    }
}
