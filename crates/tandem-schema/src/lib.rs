// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Schema reflection and foreign-key resolution for Tandem.
//!
//! A [`Schema`] is built once at startup from a relational schema description
//! (either the native [`SchemaDescription`] JSON form or a PostgREST-style
//! OpenAPI document) and is immutable afterwards. It answers three kinds of
//! questions for the rest of the workspace:
//!
//! - column metadata (semantic type, nullability, default expression),
//! - column ↔ local property name mapping for documents in the local replica,
//! - join resolution between two tables ([`Schema::resolve`]).
//!
//! # Resolution Invariant
//!
//! Resolution never guesses. When foreign keys connect two tables in both
//! directions (or more than once in the same direction) and no hint
//! disambiguates, [`Schema::resolve`] fails with
//! [`SchemaError::AmbiguousRelation`].

mod fingerprint;
mod naming;
mod reflect;
mod resolve;
mod shape;
mod types;

pub use fingerprint::SchemaFingerprint;
pub use naming::{column_name, property_name};
pub use reflect::{ColumnDescription, ColumnRef, ForeignKeyDescription, SchemaDescription, TableDescription};
pub use resolve::{Cardinality, JoinPlanEdge, RelationHint};
pub use shape::{CollectionShape, PropertyShape};
pub use types::{ColumnDescriptor, ColumnType, ForeignKeyEdge, Row, Schema, TableDescriptor};

/// Primary key column every table must declare.
pub const PRIMARY_KEY: &str = "id";
/// Column holding the last update timestamp (staleness comparisons).
pub const UPDATED_AT: &str = "updated_at";
/// Column holding the creation timestamp (default nested sort key).
pub const CREATED_AT: &str = "created_at";
/// Column holding the opaque version token.
pub const VERSION: &str = "version";
/// Local-only property flagging an unconfirmed optimistic write.
pub const PENDING_PROPERTY: &str = "isPending";
/// Local-only tombstone property.
pub const DELETED_PROPERTY: &str = "_deleted";

/// Errors raised while reflecting a schema or resolving relations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// A table identifier is not part of the schema.
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    /// A column is not declared on the given table.
    #[error("unknown column `{column}` on table `{table}`")]
    UnknownColumn {
        /// Table that was searched.
        table: String,
        /// Column that was requested.
        column: String,
    },
    /// A table does not declare the mandatory `id` column.
    #[error("table `{0}` has no `id` primary key column")]
    MissingPrimaryKey(String),
    /// A foreign key points at a table or column that does not exist.
    #[error("foreign key `{table}.{column}` references missing `{target}`")]
    DanglingForeignKey {
        /// Table declaring the key.
        table: String,
        /// Local column of the key.
        column: String,
        /// Missing `table.column` target.
        target: String,
    },
    /// Both join directions (or several keys) are possible and nothing disambiguates.
    #[error("ambiguous relation between `{from}` and `{to}`: {candidates} candidate foreign keys")]
    AmbiguousRelation {
        /// Table the relation starts from.
        from: String,
        /// Related table.
        to: String,
        /// Number of structurally possible edges.
        candidates: usize,
    },
    /// No foreign key connects the two tables in either direction.
    #[error("no relation between `{from}` and `{to}`")]
    NoRelation {
        /// Table the relation starts from.
        from: String,
        /// Related table.
        to: String,
    },
    /// A join hint names columns that exist but are not connected by a declared key.
    #[error("hint for `{from}` -> `{to}` does not match a declared foreign key: {reason}")]
    InvalidHint {
        /// Table the relation starts from.
        from: String,
        /// Related table.
        to: String,
        /// What failed the cross-check.
        reason: String,
    },
    /// The schema description could not be parsed.
    #[error("schema parse error: {0}")]
    Parse(String),
}
