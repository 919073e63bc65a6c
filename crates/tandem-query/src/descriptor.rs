// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Query descriptors and the boundary normalization of their JSON form.
//!
//! Callers may describe relations with a string shorthand (`"author": "users"`)
//! or an object; both collapse into one [`RelationRequest`] here, before any
//! compiler logic runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_schema::{Cardinality, RelationHint};

use crate::QueryError;

/// Raw filter input (shorthand allowed); normalized into a [`Predicate`](crate::Predicate).
pub type FilterInput = Value;

/// Sort spec in any of the accepted caller shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortInput {
    /// One column, ascending.
    Column(String),
    /// Ordered list of columns and/or `{column: direction}` maps.
    List(Vec<SortItem>),
}

/// One entry of a [`SortInput::List`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortItem {
    /// Column, ascending.
    Column(String),
    /// Single-entry `{column: "asc" | "desc"}` map.
    Directed(BTreeMap<String, String>),
}

/// A node of the include tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationRequest {
    /// Related table.
    pub table: String,
    /// Optional explicit join hint.
    pub hint: Option<RelationHint>,
    /// Filter applied to this relation's rows only.
    pub filter: Option<FilterInput>,
    /// Per-parent ordering of this relation.
    pub sort: Option<SortInput>,
    /// Per-parent limit.
    pub limit: Option<usize>,
    /// Per-parent offset.
    pub offset: Option<usize>,
    /// Nested relations keyed by relation name.
    pub include: BTreeMap<String, RelationRequest>,
}

/// A full query: root table plus the relation-request fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryDescriptor {
    /// Root table.
    pub table: String,
    /// Root filter.
    pub filter: Option<FilterInput>,
    /// Root ordering.
    pub sort: Option<SortInput>,
    /// Root limit (never applied across the join product).
    pub limit: Option<usize>,
    /// Root offset (never applied across the join product).
    pub offset: Option<usize>,
    /// Relations keyed by relation name.
    pub include: BTreeMap<String, RelationRequest>,
}

macro_rules! node_builders {
    ($ty:ty) => {
        impl $ty {
            /// Set the filter.
            pub fn filter(mut self, filter: FilterInput) -> Self {
                self.filter = Some(filter);
                self
            }

            /// Set the sort spec.
            pub fn sort(mut self, sort: SortInput) -> Self {
                self.sort = Some(sort);
                self
            }

            /// Set the limit.
            pub fn limit(mut self, limit: usize) -> Self {
                self.limit = Some(limit);
                self
            }

            /// Set the offset.
            pub fn offset(mut self, offset: usize) -> Self {
                self.offset = Some(offset);
                self
            }

            /// Add a relation under `name`.
            pub fn include(mut self, name: &str, relation: RelationRequest) -> Self {
                self.include.insert(name.to_string(), relation);
                self
            }
        }
    };
}

node_builders!(QueryDescriptor);
node_builders!(RelationRequest);

impl QueryDescriptor {
    /// Start a descriptor for `table`.
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    /// Parse the JSON form.
    pub fn from_json(value: &Value) -> Result<Self, QueryError> {
        let obj = value
            .as_object()
            .ok_or_else(|| QueryError::InvalidDescriptor("query must be an object".into()))?;
        let table = obj
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::InvalidDescriptor("query needs a `table`".into()))?;
        let fields = parse_node_fields(obj)?;
        Ok(Self {
            table: table.to_string(),
            filter: fields.filter,
            sort: fields.sort,
            limit: fields.limit,
            offset: fields.offset,
            include: fields.include,
        })
    }

    /// View the root as a relation request (no hint).
    pub fn as_relation(&self) -> RelationRequest {
        RelationRequest {
            table: self.table.clone(),
            hint: None,
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            limit: self.limit,
            offset: self.offset,
            include: self.include.clone(),
        }
    }
}

impl TryFrom<Value> for QueryDescriptor {
    type Error = QueryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

impl RelationRequest {
    /// Start a relation targeting `table`.
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    /// Set the join hint.
    pub fn hint(mut self, hint: RelationHint) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Parse one include entry: string shorthand or object form.
    ///
    /// An object without `table` targets the table named like the relation.
    pub fn from_json(name: &str, value: &Value) -> Result<Self, QueryError> {
        match value {
            Value::String(table) => Ok(Self::new(table)),
            Value::Bool(true) => Ok(Self::new(name)),
            Value::Object(obj) => {
                let table = obj.get("table").and_then(Value::as_str).unwrap_or(name);
                let hint = obj.get("hint").map(parse_hint).transpose()?;
                let fields = parse_node_fields(obj)?;
                Ok(Self {
                    table: table.to_string(),
                    hint,
                    filter: fields.filter,
                    sort: fields.sort,
                    limit: fields.limit,
                    offset: fields.offset,
                    include: fields.include,
                })
            }
            other => Err(QueryError::InvalidDescriptor(format!(
                "relation `{name}` must be a table name or an object, got {other}"
            ))),
        }
    }
}

struct NodeFields {
    filter: Option<FilterInput>,
    sort: Option<SortInput>,
    limit: Option<usize>,
    offset: Option<usize>,
    include: BTreeMap<String, RelationRequest>,
}

fn parse_node_fields(obj: &serde_json::Map<String, Value>) -> Result<NodeFields, QueryError> {
    let filter = obj.get("filter").filter(|f| !f.is_null()).cloned();
    let sort = obj
        .get("sort")
        .filter(|s| !s.is_null())
        .map(|s| {
            serde_json::from_value::<SortInput>(s.clone())
                .map_err(|e| QueryError::InvalidSort(e.to_string()))
        })
        .transpose()?;
    let include = match obj.get("include") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, rel)| Ok((name.clone(), RelationRequest::from_json(name, rel)?)))
            .collect::<Result<_, QueryError>>()?,
        Some(other) => {
            return Err(QueryError::InvalidDescriptor(format!(
                "`include` must be an object, got {other}"
            )))
        }
    };
    Ok(NodeFields {
        filter,
        sort,
        limit: parse_count(obj, "limit")?,
        offset: parse_count(obj, "offset")?,
        include,
    })
}

fn parse_count(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<usize>, QueryError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| QueryError::InvalidDescriptor(format!("`{key}` must be a non-negative integer"))),
    }
}

fn parse_cardinality(text: &str) -> Result<Cardinality, QueryError> {
    match text {
        "many_to_one" | "manyToOne" | "one" => Ok(Cardinality::ManyToOne),
        "one_to_many" | "oneToMany" | "many" => Ok(Cardinality::OneToMany),
        other => Err(QueryError::InvalidDescriptor(format!("unknown cardinality `{other}`"))),
    }
}

fn parse_hint(value: &Value) -> Result<RelationHint, QueryError> {
    match value {
        Value::String(column) => Ok(RelationHint::Column(column.clone())),
        Value::Object(obj) => {
            let local = obj.get("local").and_then(Value::as_str);
            let foreign = obj.get("foreign").and_then(Value::as_str);
            let column = obj.get("column").and_then(Value::as_str);
            match (local, foreign, obj.get("cardinality").and_then(Value::as_str)) {
                (Some(local), Some(foreign), None) => Ok(RelationHint::Columns {
                    local: local.to_string(),
                    foreign: foreign.to_string(),
                }),
                (None, None, Some(cardinality)) => Ok(RelationHint::Cardinality {
                    cardinality: parse_cardinality(cardinality)?,
                    column: column.map(str::to_string),
                }),
                (None, None, None) => column
                    .map(|c| RelationHint::Column(c.to_string()))
                    .ok_or_else(|| QueryError::InvalidDescriptor("empty relation hint".into())),
                _ => Err(QueryError::InvalidDescriptor(
                    "hint must be a column, a local/foreign pair, or a cardinality".into(),
                )),
            }
        }
        other => Err(QueryError::InvalidDescriptor(format!("unsupported hint {other}"))),
    }
}
