// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared normalization pass: descriptor → resolved, schema-checked tree.

use serde::Serialize;
use tandem_schema::{JoinPlanEdge, Schema, TableDescriptor};
use tracing::debug;

use crate::descriptor::{QueryDescriptor, RelationRequest};
use crate::filter::Predicate;
use crate::sort::{normalize_sort, SortKey};
use crate::QueryError;

/// One node of the normalized query tree, in remote column space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryNode {
    /// Table this node reads.
    pub table: String,
    /// Relation name under the parent (`None` at the root).
    pub relation: Option<String>,
    /// Resolved join to the parent (`None` at the root).
    pub edge: Option<JoinPlanEdge>,
    /// Normalized filter.
    pub filter: Option<Predicate>,
    /// Normalized sort, primary key last.
    pub sort: Vec<SortKey>,
    /// Limit at this level.
    pub limit: Option<usize>,
    /// Offset at this level.
    pub offset: Option<usize>,
    /// Nested relations, ordered by relation name.
    pub children: Vec<QueryNode>,
}

impl QueryNode {
    /// Pre-order traversal with the relation path of each node.
    pub fn walk<'a>(&'a self, path: &mut Vec<&'a str>, visit: &mut impl FnMut(&[&'a str], &'a QueryNode)) {
        visit(path, self);
        for child in &self.children {
            path.push(child.relation.as_deref().unwrap_or_default());
            child.walk(path, visit);
            path.pop();
        }
    }

    /// Tables touched by this tree (with repeats removed, first-seen order).
    pub fn tables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        self.walk(&mut Vec::new(), &mut |_, node| {
            if !out.contains(&node.table.as_str()) {
                out.push(&node.table);
            }
        });
        out
    }
}

pub(crate) fn normalize(schema: &Schema, descriptor: &QueryDescriptor) -> Result<QueryNode, QueryError> {
    let root = node(schema, &descriptor.as_relation(), None, None)?;
    debug!(table = %root.table, relations = root.children.len(), "normalized query");
    Ok(root)
}

fn check_relation_name(parent: &TableDescriptor, name: &str) -> Result<(), QueryError> {
    let reason = if name.is_empty() {
        "relation names must not be empty"
    } else if name.contains("__") || name.contains('.') {
        "relation names must not contain `__` or `.`"
    } else if parent.has_column(name) || parent.column_by_property(name).is_some() {
        "relation name shadows a column"
    } else {
        return Ok(());
    };
    Err(QueryError::InvalidDescriptor(format!("`{}.{name}`: {reason}", parent.name)))
}

fn node(
    schema: &Schema,
    request: &RelationRequest,
    relation: Option<&str>,
    parent: Option<&TableDescriptor>,
) -> Result<QueryNode, QueryError> {
    let table = schema.table(&request.table)?;
    let edge = match (relation, parent) {
        (Some(name), Some(parent)) => {
            check_relation_name(parent, name)?;
            Some(schema.resolve(&parent.name, &table.name, request.hint.as_ref())?)
        }
        _ => None,
    };
    let filter = match &request.filter {
        Some(input) => Predicate::normalize(table, input)?,
        None => None,
    };
    let sort = normalize_sort(table, request.sort.as_ref(), parent.is_some())?;
    let children = request
        .include
        .iter()
        .map(|(name, child)| node(schema, child, Some(name), Some(table)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(QueryNode {
        table: table.name.clone(),
        relation: relation.map(str::to_string),
        edge,
        filter,
        sort,
        limit: request.limit,
        offset: request.offset,
        children,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_schema::{Cardinality, SchemaError};

    fn schema() -> Schema {
        Schema::from_json(
            r#"{"tables": {
                "users": {"columns": [{"name": "id"}, {"name": "name"}]},
                "posts": {"columns": [{"name": "id"}, {"name": "author_id"}, {"name": "title"}],
                          "foreign_keys": [{"column": "author_id", "references": {"table": "users", "column": "id"}}]},
                "comments": {"columns": [{"name": "id"}, {"name": "post_id"}, {"name": "created_at", "type": "timestamptz"}],
                             "foreign_keys": [{"column": "post_id", "references": {"table": "posts", "column": "id"}}]}
            }}"#,
        )
        .unwrap()
    }

    #[test]
    fn include_tree_resolves_edges() {
        let q = QueryDescriptor::from_json(&json!({
            "table": "posts",
            "include": {"author": "users", "comments": "comments"}
        }))
        .unwrap();
        let root = normalize(&schema(), &q).unwrap();
        assert_eq!(root.children.len(), 2);
        let author = root.children.iter().find(|c| c.relation.as_deref() == Some("author")).unwrap();
        assert_eq!(author.edge.as_ref().unwrap().cardinality, Cardinality::ManyToOne);
        let comments = root.children.iter().find(|c| c.table == "comments").unwrap();
        assert_eq!(comments.edge.as_ref().unwrap().key_column(), "post_id");
        assert_eq!(comments.sort[0].column, "created_at");
        assert_eq!(root.tables(), vec!["posts", "users", "comments"]);
    }

    #[test]
    fn unknown_tables_and_bad_relation_names_fail() {
        let s = schema();
        let q = QueryDescriptor::new("posts").include("x", RelationRequest::new("ghosts"));
        assert!(matches!(
            normalize(&s, &q),
            Err(QueryError::Schema(SchemaError::UnknownTable(_)))
        ));
        for name in ["", "a__b", "a.b", "title", "authorId"] {
            let q = QueryDescriptor::new("posts").include(name, RelationRequest::new("users"));
            assert!(matches!(normalize(&s, &q), Err(QueryError::InvalidDescriptor(_))), "{name}");
        }
    }
}
