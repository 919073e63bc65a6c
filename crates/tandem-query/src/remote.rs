// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Remote lowering: one embedded-select fetch plus page batches, rendered as
//! PostgREST query pairs.

use serde::Serialize;
use serde_json::Value;
use tandem_schema::{Row, Schema};
use tracing::debug;

use crate::filter::{Comparison, Operator, Predicate};
use crate::normalize::QueryNode;
use crate::QueryError;

/// One `offset`/`limit` window of a remote fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PageRange {
    /// First row.
    pub offset: usize,
    /// Row count (never above the page size).
    pub limit: usize,
}

/// A compiled remote fetch.
///
/// `batches` is executed in order. The leading [`prefix_ranges`] cover
/// `[0, offset)` in page-size chunks because the remote window cannot start
/// past one page; their rows are discarded. The [`result_ranges`] split the
/// requested slice `[offset, offset + limit)` into page-size windows whose
/// rows, concatenated, form the logical result. Without a limit the result is
/// open-ended: keep requesting [`next_range`] until a page comes back short.
///
/// [`prefix_ranges`]: Self::prefix_ranges
/// [`result_ranges`]: Self::result_ranges
/// [`next_range`]: Self::next_range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteRequest {
    /// Normalized query tree (column space).
    pub root: QueryNode,
    /// Page windows, prefix first.
    pub batches: Vec<PageRange>,
    /// How many leading batches cover the prefix.
    pub prefix: usize,
    /// The root had no limit; the result continues past the last batch.
    pub open_ended: bool,
    /// Largest window one fetch may request.
    pub page_size: usize,
}

pub(crate) fn lower(root: QueryNode, page_size: usize) -> RemoteRequest {
    let page_size = page_size.max(1);
    let offset = root.offset.unwrap_or(0);
    let mut batches = Vec::new();
    if offset >= page_size {
        batches.extend(windows(0, offset, page_size));
    }
    let prefix = batches.len();
    match root.limit {
        Some(limit) => batches.extend(windows(offset, offset + limit, page_size)),
        None => batches.push(PageRange {
            offset,
            limit: page_size,
        }),
    }
    debug!(table = %root.table, batches = batches.len(), prefix, "lowered remote request");
    RemoteRequest {
        open_ended: root.limit.is_none(),
        root,
        batches,
        prefix,
        page_size,
    }
}

fn windows(start: usize, end: usize, page_size: usize) -> impl Iterator<Item = PageRange> {
    (start..end).step_by(page_size).map(move |offset| PageRange {
        offset,
        limit: (end - offset).min(page_size),
    })
}

impl RemoteRequest {
    /// Windows covering `[0, offset)`; their rows are not part of the result.
    pub fn prefix_ranges(&self) -> &[PageRange] {
        self.batches.get(..self.prefix).unwrap_or_default()
    }

    /// Windows whose rows, in order, form the logical result.
    pub fn result_ranges(&self) -> &[PageRange] {
        self.batches.get(self.prefix..).unwrap_or_default()
    }

    /// The page after `range`, for open-ended results.
    pub const fn next_range(&self, range: PageRange) -> PageRange {
        PageRange {
            offset: range.offset + range.limit,
            limit: self.page_size,
        }
    }

    /// PostgREST query pairs for one batch.
    pub fn query_pairs(&self, range: PageRange) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), select_expr(&self.root))];
        node_pairs(&self.root, "", &mut pairs);
        pairs.push(("offset".into(), range.offset.to_string()));
        pairs.push(("limit".into(), range.limit.to_string()));
        pairs
    }

    /// URL query string for one batch (`a=b&c=d`, values left unencoded).
    pub fn query_string(&self, range: PageRange) -> String {
        self.query_pairs(range)
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn select_expr(node: &QueryNode) -> String {
    let mut out = String::from("*");
    for child in &node.children {
        let (Some(relation), Some(edge)) = (&child.relation, &child.edge) else {
            continue;
        };
        out.push_str(&format!(
            ",{relation}:{}!{}({})",
            child.table,
            edge.key_column(),
            select_expr(child)
        ));
    }
    out
}

fn node_pairs(node: &QueryNode, prefix: &str, pairs: &mut Vec<(String, String)>) {
    if let Some(filter) = &node.filter {
        filter_pairs(filter, prefix, pairs);
    }
    if !node.sort.is_empty() {
        let order = node
            .sort
            .iter()
            .map(|k| format!("{}.{}", k.column, k.direction.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        pairs.push((format!("{prefix}order"), order));
    }
    if !prefix.is_empty() {
        if let Some(offset) = node.offset {
            pairs.push((format!("{prefix}offset"), offset.to_string()));
        }
        if let Some(limit) = node.limit {
            pairs.push((format!("{prefix}limit"), limit.to_string()));
        }
    }
    for child in &node.children {
        if let Some(relation) = &child.relation {
            node_pairs(child, &format!("{prefix}{relation}."), pairs);
        }
    }
}

fn filter_pairs(predicate: &Predicate, prefix: &str, pairs: &mut Vec<(String, String)>) {
    match predicate {
        Predicate::And(children) => {
            for child in children {
                filter_pairs(child, prefix, pairs);
            }
        }
        Predicate::Or(children) => pairs.push((format!("{prefix}or"), group(children))),
        Predicate::Compare(cmp) => pairs.push((format!("{prefix}{}", cmp.column), leaf_value(cmp))),
        Predicate::Not(inner) => match inner.as_ref() {
            Predicate::Compare(cmp) => {
                pairs.push((format!("{prefix}{}", cmp.column), format!("not.{}", leaf_value(cmp))));
            }
            Predicate::And(children) => pairs.push((format!("{prefix}not.and"), group(children))),
            Predicate::Or(children) => pairs.push((format!("{prefix}not.or"), group(children))),
            Predicate::Not(twice) => filter_pairs(twice, prefix, pairs),
        },
    }
}

fn group(children: &[Predicate]) -> String {
    format!("({})", children.iter().map(tree_term).collect::<Vec<_>>().join(","))
}

/// One term inside a logical tree (`col.op.val`, `and(...)`, `not.or(...)`).
fn tree_term(predicate: &Predicate) -> String {
    match predicate {
        // an empty conjunction is true; the primary key is never null
        Predicate::And(children) if children.is_empty() => "id.not.is.null".to_string(),
        Predicate::And(children) => format!("and{}", group(children)),
        Predicate::Or(children) => format!("or{}", group(children)),
        Predicate::Compare(cmp) => format!("{}.{}", cmp.column, leaf_value(cmp)),
        Predicate::Not(inner) => match inner.as_ref() {
            Predicate::Compare(cmp) => format!("{}.not.{}", cmp.column, leaf_value(cmp)),
            Predicate::Not(twice) => tree_term(twice),
            other => format!("not.{}", tree_term(other)),
        },
    }
}

fn leaf_value(cmp: &Comparison) -> String {
    let operand = match (cmp.op, &cmp.operand) {
        (Operator::In, Value::Array(items)) => {
            format!("({})", items.iter().map(render_scalar).collect::<Vec<_>>().join(","))
        }
        (Operator::Like | Operator::Ilike, Value::String(pattern)) => pattern.replace('%', "*"),
        (_, value) => render_scalar(value),
    };
    format!("{}.{operand}", cmp.op)
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) if s.chars().any(|c| ",.:()\" \\".contains(c)) => {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl QueryNode {
    /// Convert a nested remote row (column names) into a local document tree
    /// (property names, relations under their relation names).
    pub fn to_local(&self, schema: &Schema, row: &Row) -> Result<Row, QueryError> {
        let table = schema.table(&self.table)?;
        let mut doc = Row::new();
        for (key, value) in row {
            let Some(child) = self.children.iter().find(|c| c.relation.as_deref() == Some(key.as_str())) else {
                doc.insert(table.property_of(key), value.clone());
                continue;
            };
            let converted = match value {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .filter_map(Value::as_object)
                        .map(|item| child.to_local(schema, item).map(Value::Object))
                        .collect::<Result<_, _>>()?,
                ),
                Value::Object(item) => Value::Object(child.to_local(schema, item)?),
                other => other.clone(),
            };
            doc.insert(key.clone(), converted);
        }
        Ok(doc)
    }

    /// Split a nested remote row into flat `(table, local document)` pairs,
    /// parents before children, relation properties stripped.
    pub fn split_entities(&self, schema: &Schema, row: &Row, out: &mut Vec<(String, Row)>) -> Result<(), QueryError> {
        let table = schema.table(&self.table)?;
        let mut doc = Row::new();
        let mut nested = Vec::new();
        for (key, value) in row {
            match self.children.iter().find(|c| c.relation.as_deref() == Some(key.as_str())) {
                Some(child) => nested.push((child, value)),
                None => {
                    doc.insert(table.property_of(key), value.clone());
                }
            }
        }
        out.push((self.table.clone(), doc));
        for (child, value) in nested {
            match value {
                Value::Array(items) => {
                    for item in items.iter().filter_map(Value::as_object) {
                        child.split_entities(schema, item, out)?;
                    }
                }
                Value::Object(item) => child.split_entities(schema, item, out)?,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{QueryCompiler, QueryDescriptor};
    use serde_json::json;
    use std::sync::Arc;

    fn compiler(page_size: usize) -> QueryCompiler {
        let schema = Schema::from_json(
            r#"{"tables": {
                "users": {"columns": [{"name": "id"}, {"name": "display_name"}]},
                "posts": {"columns": [{"name": "id"}, {"name": "author_id"}, {"name": "title"}, {"name": "score", "type": "int4"}],
                          "foreign_keys": [{"column": "author_id", "references": {"table": "users", "column": "id"}}]},
                "comments": {"columns": [{"name": "id"}, {"name": "post_id"}, {"name": "body"}],
                             "foreign_keys": [{"column": "post_id", "references": {"table": "posts", "column": "id"}}]}
            }}"#,
        )
        .unwrap();
        QueryCompiler::new(Arc::new(schema)).with_page_size(page_size)
    }

    #[test]
    fn renders_postgrest_pairs() {
        let q = QueryDescriptor::from_json(&json!({
            "table": "posts",
            "filter": {"score": {"gte": 3}, "or": [{"title": {"like": "a%"}}, {"title": {"in": ["x,y", "z"]}}]},
            "sort": [{"score": "desc"}],
            "limit": 10,
            "include": {
                "author": "users",
                "comments": {"filter": {"not": {"body": null}}, "limit": 2}
            }
        }))
        .unwrap();
        let req = compiler(1000).compile_remote(&q).unwrap();
        assert_eq!(req.batches, vec![PageRange { offset: 0, limit: 10 }]);
        let pairs = req.query_pairs(req.result_ranges()[0]);
        let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("select"), Some("*,author:users!author_id(*),comments:comments!post_id(*)"));
        assert_eq!(get("score"), Some("gte.3"));
        assert_eq!(get("or"), Some(r#"(title.like.a*,title.in.("x,y",z))"#));
        assert_eq!(get("order"), Some("score.desc,id.asc"));
        assert_eq!(get("comments.body"), Some("not.is.null"));
        assert_eq!(get("comments.limit"), Some("2"));
        assert_eq!(get("limit"), Some("10"));
    }

    #[test]
    fn deep_offsets_batch_the_prefix() {
        let q = QueryDescriptor::new("posts").offset(250).limit(500);
        let req = compiler(100).compile_remote(&q).unwrap();
        let windows = |ranges: &[PageRange]| ranges.iter().map(|b| (b.offset, b.limit)).collect::<Vec<_>>();
        assert_eq!(windows(req.prefix_ranges()), vec![(0, 100), (100, 100), (200, 50)]);
        assert_eq!(
            windows(req.result_ranges()),
            vec![(250, 100), (350, 100), (450, 100), (550, 100), (650, 100)]
        );
        assert!(!req.open_ended);

        let shallow = compiler(100).compile_remote(&QueryDescriptor::new("posts").offset(20)).unwrap();
        assert_eq!(shallow.batches, vec![PageRange { offset: 20, limit: 100 }]);
        assert!(shallow.prefix_ranges().is_empty());
        assert!(shallow.open_ended);
        assert_eq!(shallow.next_range(shallow.batches[0]), PageRange { offset: 120, limit: 100 });
    }

    #[test]
    fn limits_above_one_page_span_several_result_windows() {
        let req = compiler(3).compile_remote(&QueryDescriptor::new("posts").limit(5)).unwrap();
        assert!(req.prefix_ranges().is_empty());
        assert_eq!(
            req.result_ranges(),
            &[PageRange { offset: 0, limit: 3 }, PageRange { offset: 3, limit: 2 }]
        );

        let empty = compiler(3).compile_remote(&QueryDescriptor::new("posts").offset(4).limit(0)).unwrap();
        assert_eq!(empty.prefix_ranges(), &[PageRange { offset: 0, limit: 3 }, PageRange { offset: 3, limit: 1 }]);
        assert!(empty.result_ranges().is_empty());
    }

    #[test]
    fn nested_rows_convert_and_split() {
        let q = QueryDescriptor::new("posts").include("author", crate::RelationRequest::new("users"));
        let c = compiler(1000);
        let req = c.compile_remote(&q).unwrap();
        let row = json!({"id": "p1", "author_id": "u1", "author": {"id": "u1", "display_name": "Ada"}});
        let local = req.root.to_local(c.schema(), row.as_object().unwrap()).unwrap();
        assert_eq!(Value::Object(local), json!({"id": "p1", "authorId": "u1", "author": {"id": "u1", "displayName": "Ada"}}));

        let mut out = Vec::new();
        req.root.split_entities(c.schema(), row.as_object().unwrap(), &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, "posts");
        assert!(!out[0].1.contains_key("author"));
        assert_eq!(out[1], ("users".to_string(), json!({"id": "u1", "displayName": "Ada"}).as_object().unwrap().clone()));
    }
}
