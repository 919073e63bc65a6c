// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Local lowering: normalized tree → flat left-join plan in property space.

use serde::Serialize;
use tandem_schema::{property_name, Cardinality, Row, Schema};

use crate::filter::Predicate;
use crate::normalize::QueryNode;
use crate::sort::{map_keys, SortKey};

/// Alias of the root table in flat rows.
pub const ROOT_ALIAS: &str = "root";

/// One row of the local join product; keys are `"<alias>.<property>"`.
pub type FlatRow = Row;

/// One left join of the local plan.
///
/// The join filter restricts which child rows attach; it never removes the
/// parent. Sort, limit and offset are per-parent and applied by
/// [`materialize`](crate::materialize), not by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalJoin {
    /// Unique alias (`<parent alias>__<relation>`).
    pub alias: String,
    /// Alias this join hangs off.
    pub parent_alias: String,
    /// Relation name (property the materializer fills on the parent).
    pub relation: String,
    /// Joined table.
    pub table: String,
    /// Join property on the parent document.
    pub parent_property: String,
    /// Join property on the child document.
    pub child_property: String,
    /// Relation cardinality.
    pub cardinality: Cardinality,
    /// Child filter (property space).
    pub filter: Option<Predicate>,
    /// Deferred per-parent ordering (property space).
    pub sort: Vec<SortKey>,
    /// Deferred per-parent limit.
    pub limit: Option<usize>,
    /// Deferred per-parent offset.
    pub offset: Option<usize>,
}

/// A local incremental-join query plan.
///
/// The plan carries no tombstone predicate: a store executing it must skip
/// documents flagged `_deleted`, at the root and on every join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalPlan {
    /// Root table.
    pub table: String,
    /// Root alias ([`ROOT_ALIAS`]).
    pub alias: String,
    /// Root selector (property space).
    pub selector: Option<Predicate>,
    /// Root ordering (property space), applied by the engine.
    pub sort: Vec<SortKey>,
    /// Root limit, applied by the engine before joining.
    pub limit: Option<usize>,
    /// Root offset, applied by the engine before joining.
    pub offset: Option<usize>,
    /// Joins in pre-order: every parent alias precedes its children.
    pub joins: Vec<LocalJoin>,
}

impl LocalPlan {
    /// Joins hanging directly off `alias`.
    pub fn joins_of<'a>(&'a self, alias: &'a str) -> impl Iterator<Item = &'a LocalJoin> + 'a {
        self.joins.iter().filter(move |j| j.parent_alias == alias)
    }

    /// Every table the plan reads, root first.
    pub fn tables(&self) -> Vec<&str> {
        let mut out = vec![self.table.as_str()];
        for join in &self.joins {
            if !out.contains(&join.table.as_str()) {
                out.push(&join.table);
            }
        }
        out
    }
}

/// Flat-row key for `property` under `alias`.
pub fn flat_key(alias: &str, property: &str) -> String {
    format!("{alias}.{property}")
}

fn renamer<'a>(schema: &'a Schema, table: &'a str) -> impl Fn(&str) -> String + 'a {
    move |column| {
        schema
            .table(table)
            .map_or_else(|_| property_name(column), |t| t.property_of(column))
    }
}

pub(crate) fn lower(schema: &Schema, root: &QueryNode) -> LocalPlan {
    let rename = renamer(schema, &root.table);
    let mut plan = LocalPlan {
        table: root.table.clone(),
        alias: ROOT_ALIAS.to_string(),
        selector: root.filter.as_ref().map(|p| p.map_columns(&rename)),
        sort: map_keys(&root.sort, &rename),
        limit: root.limit,
        offset: root.offset,
        joins: Vec::new(),
    };
    lower_children(schema, root, ROOT_ALIAS, &mut plan.joins);
    plan
}

fn lower_children(schema: &Schema, parent: &QueryNode, parent_alias: &str, joins: &mut Vec<LocalJoin>) {
    let parent_rename = renamer(schema, &parent.table);
    for child in &parent.children {
        let (Some(relation), Some(edge)) = (child.relation.as_deref(), child.edge.as_ref()) else {
            continue;
        };
        let rename = renamer(schema, &child.table);
        let alias = format!("{parent_alias}__{relation}");
        joins.push(LocalJoin {
            alias: alias.clone(),
            parent_alias: parent_alias.to_string(),
            relation: relation.to_string(),
            table: child.table.clone(),
            parent_property: parent_rename(&edge.local_column),
            child_property: rename(&edge.foreign_column),
            cardinality: edge.cardinality,
            filter: child.filter.as_ref().map(|p| p.map_columns(&rename)),
            sort: map_keys(&child.sort, &rename),
            limit: child.limit,
            offset: child.offset,
        });
        lower_children(schema, child, &alias, joins);
    }
}
