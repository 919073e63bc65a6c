// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Foreign-key resolution between two tables.
//!
//! Direction vocabulary: the *forward* direction is a foreign key declared on
//! the current table that references the related table (many-to-one); the
//! *reverse* direction is a foreign key declared on the related table that
//! references the current table (one-to-many).

use serde::{Deserialize, Serialize};

use crate::types::{ForeignKeyEdge, Schema, TableDescriptor};
use crate::SchemaError;

/// Cardinality of a resolved relation, seen from the current table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Each current row matches at most one related row.
    ManyToOne,
    /// Each current row matches zero or more related rows.
    OneToMany,
}

/// Explicit join hint attached to a relation request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelationHint {
    /// A single column name declared on one of the two tables.
    Column(String),
    /// Explicit `local` (current table) → `foreign` (related table) column pair.
    Columns {
        /// Column on the current table.
        local: String,
        /// Column on the related table.
        foreign: String,
    },
    /// Explicit cardinality, optionally narrowed to one foreign-key column.
    Cardinality {
        /// Requested cardinality.
        cardinality: Cardinality,
        /// Foreign-key column (on whichever table owns the key).
        column: Option<String>,
    },
}

/// A resolved join between the current table and a related table.
///
/// `local_column` lives on the current table, `foreign_column` on
/// `foreign_table`. For many-to-one edges `local_column` is the foreign-key
/// column; for one-to-many edges `foreign_column` is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JoinPlanEdge {
    /// Join column on the current table.
    pub local_column: String,
    /// Join column on the related table.
    pub foreign_column: String,
    /// Related table.
    pub foreign_table: String,
    /// Relation cardinality.
    pub cardinality: Cardinality,
}

impl JoinPlanEdge {
    fn forward(fk: &ForeignKeyEdge) -> Self {
        Self {
            local_column: fk.column.clone(),
            foreign_column: fk.target_column.clone(),
            foreign_table: fk.target_table.clone(),
            cardinality: Cardinality::ManyToOne,
        }
    }

    fn reverse(fk: &ForeignKeyEdge, related: &str) -> Self {
        Self {
            local_column: fk.target_column.clone(),
            foreign_column: fk.column.clone(),
            foreign_table: related.to_string(),
            cardinality: Cardinality::OneToMany,
        }
    }

    /// Column that carries the foreign key (the one a relation is keyed by).
    pub fn key_column(&self) -> &str {
        match self.cardinality {
            Cardinality::ManyToOne => &self.local_column,
            Cardinality::OneToMany => &self.foreign_column,
        }
    }
}

struct Candidates<'a> {
    forward: Vec<&'a ForeignKeyEdge>,
    reverse: Vec<&'a ForeignKeyEdge>,
}

impl Schema {
    /// Resolve the join between `current` and `related`.
    ///
    /// Without a hint, a single forward key wins (many-to-one), otherwise a
    /// single reverse key (one-to-many). Keys in both directions, or several
    /// keys in the winning direction, fail with
    /// [`SchemaError::AmbiguousRelation`]. Hints are always cross-checked
    /// against the declared keys.
    pub fn resolve(
        &self,
        current: &str,
        related: &str,
        hint: Option<&RelationHint>,
    ) -> Result<JoinPlanEdge, SchemaError> {
        let current_table = self.table(current)?;
        let related_table = self.table(related)?;
        let candidates = Candidates {
            forward: current_table.foreign_keys_to(related).collect(),
            reverse: related_table.foreign_keys_to(current).collect(),
        };
        match hint {
            None => resolve_unhinted(current, related, &candidates),
            Some(RelationHint::Column(column)) => {
                resolve_column(current_table, related_table, column, &candidates)
            }
            Some(RelationHint::Columns { local, foreign }) => {
                resolve_pair(current_table, related_table, local, foreign, &candidates)
            }
            Some(RelationHint::Cardinality { cardinality, column }) => {
                resolve_cardinality(current, related, *cardinality, column.as_deref(), &candidates)
            }
        }
    }
}

fn ambiguous(from: &str, to: &str, candidates: usize) -> SchemaError {
    SchemaError::AmbiguousRelation {
        from: from.to_string(),
        to: to.to_string(),
        candidates,
    }
}

fn no_relation(from: &str, to: &str) -> SchemaError {
    SchemaError::NoRelation {
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn invalid_hint(from: &str, to: &str, reason: String) -> SchemaError {
    SchemaError::InvalidHint {
        from: from.to_string(),
        to: to.to_string(),
        reason,
    }
}

fn resolve_unhinted(current: &str, related: &str, c: &Candidates<'_>) -> Result<JoinPlanEdge, SchemaError> {
    match (c.forward.as_slice(), c.reverse.as_slice()) {
        ([], []) => Err(no_relation(current, related)),
        ([fk], []) => Ok(JoinPlanEdge::forward(fk)),
        ([], [fk]) => Ok(JoinPlanEdge::reverse(fk, related)),
        (forward, reverse) => Err(ambiguous(current, related, forward.len() + reverse.len())),
    }
}

fn resolve_column(
    current: &TableDescriptor,
    related: &TableDescriptor,
    column: &str,
    c: &Candidates<'_>,
) -> Result<JoinPlanEdge, SchemaError> {
    let forward: Vec<_> = c.forward.iter().filter(|fk| fk.column == column).collect();
    let reverse: Vec<_> = c.reverse.iter().filter(|fk| fk.column == column).collect();
    match (current.has_column(column), related.has_column(column)) {
        (false, false) => Err(SchemaError::UnknownColumn {
            table: format!("{}|{}", current.name, related.name),
            column: column.to_string(),
        }),
        (true, false) => forward
            .first()
            .map(|fk| JoinPlanEdge::forward(fk))
            .ok_or_else(|| {
                invalid_hint(
                    &current.name,
                    &related.name,
                    format!("`{}.{column}` is not a foreign key to `{}`", current.name, related.name),
                )
            }),
        (false, true) => reverse
            .first()
            .map(|fk| JoinPlanEdge::reverse(fk, &related.name))
            .ok_or_else(|| {
                invalid_hint(
                    &current.name,
                    &related.name,
                    format!("`{}.{column}` is not a foreign key to `{}`", related.name, current.name),
                )
            }),
        // Both tables declare the column: only the declared keys can decide.
        (true, true) => match (forward.as_slice(), reverse.as_slice()) {
            ([fk], []) => Ok(JoinPlanEdge::forward(fk)),
            ([], [fk]) => Ok(JoinPlanEdge::reverse(fk, &related.name)),
            ([], []) => Err(invalid_hint(
                &current.name,
                &related.name,
                format!("`{column}` carries no foreign key between the two tables"),
            )),
            (f, r) => Err(ambiguous(&current.name, &related.name, f.len() + r.len())),
        },
    }
}

fn resolve_pair(
    current: &TableDescriptor,
    related: &TableDescriptor,
    local: &str,
    foreign: &str,
    c: &Candidates<'_>,
) -> Result<JoinPlanEdge, SchemaError> {
    current.require_column(local)?;
    related.require_column(foreign)?;
    let forward = c
        .forward
        .iter()
        .find(|fk| fk.column == local && fk.target_column == foreign);
    let mirror = c
        .reverse
        .iter()
        .find(|fk| fk.column == foreign && fk.target_column == local);
    match (forward, mirror) {
        (Some(fk), None) => Ok(JoinPlanEdge::forward(fk)),
        (None, Some(fk)) => Ok(JoinPlanEdge::reverse(fk, &related.name)),
        (Some(_), Some(_)) => Err(ambiguous(&current.name, &related.name, 2)),
        (None, None) => Err(invalid_hint(
            &current.name,
            &related.name,
            format!(
                "no foreign key connects `{}.{local}` and `{}.{foreign}`",
                current.name, related.name
            ),
        )),
    }
}

fn resolve_cardinality(
    current: &str,
    related: &str,
    cardinality: Cardinality,
    column: Option<&str>,
    c: &Candidates<'_>,
) -> Result<JoinPlanEdge, SchemaError> {
    let pool = match cardinality {
        Cardinality::ManyToOne => &c.forward,
        Cardinality::OneToMany => &c.reverse,
    };
    let matching: Vec<_> = pool
        .iter()
        .filter(|fk| column.is_none_or(|col| fk.column == col))
        .collect();
    match (matching.as_slice(), cardinality) {
        ([], _) => Err(no_relation(current, related)),
        ([fk], Cardinality::ManyToOne) => Ok(JoinPlanEdge::forward(fk)),
        ([fk], Cardinality::OneToMany) => Ok(JoinPlanEdge::reverse(fk, related)),
        (many, _) => Err(ambiguous(current, related, many.len())),
    }
}
