// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filter predicate trees: normalization from caller shorthand and
//! three-valued evaluation.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tandem_schema::{ColumnType, Row, TableDescriptor};

use crate::eval::{compare_values, like_match};
use crate::sort::Collation;
use crate::QueryError;

/// Comparison operator of a normalized predicate leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Case-sensitive pattern match (`%` any run, `_` one char).
    Like,
    /// Case-insensitive pattern match.
    Ilike,
    /// Membership in a list of scalars.
    In,
    /// Identity test against `null`, `true` or `false`.
    Is,
}

impl Operator {
    /// Parse an operator keyword.
    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "eq" => Self::Eq,
            "neq" => Self::Neq,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "like" => Self::Like,
            "ilike" => Self::Ilike,
            "in" => Self::In,
            "is" => Self::Is,
            _ => return None,
        })
    }

    /// Operator keyword (also the remote filter prefix).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Like => "like",
            Self::Ilike => "ilike",
            Self::In => "in",
            Self::Is => "is",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `{column, operator, operand}` leaf.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    /// Column (remote space) or property (local space) being tested.
    pub column: String,
    /// Operator.
    pub op: Operator,
    /// Operand; shape already validated against `op`.
    pub operand: Value,
    /// How ordered comparisons treat the column's values.
    pub collation: Collation,
}

/// Normalized filter tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// All children hold. Empty means true.
    And(Vec<Predicate>),
    /// At least one child holds.
    Or(Vec<Predicate>),
    /// Single-child negation.
    Not(Box<Predicate>),
    /// Leaf comparison.
    Compare(Comparison),
}

const COMBINATORS: [&str; 4] = ["and", "or", "not", "nor"];

impl Predicate {
    /// Normalize caller shorthand against `table`.
    ///
    /// A bare value means equality, a bare `null` means `is null`, and an
    /// object value is an operator map. Several clauses in one object are
    /// conjoined. Returns `None` for an empty filter.
    pub fn normalize(table: &TableDescriptor, input: &Value) -> Result<Option<Self>, QueryError> {
        let obj = match input {
            Value::Null => return Ok(None),
            Value::Object(obj) => obj,
            other => {
                return Err(QueryError::InvalidFilter {
                    column: table.name.clone(),
                    operator: "filter".into(),
                    reason: format!("filter must be an object, got {other}"),
                })
            }
        };
        let mut clauses = Vec::new();
        for (key, value) in obj {
            if COMBINATORS.contains(&key.as_str()) {
                clauses.push(Self::combinator(table, key, value)?);
            } else {
                clauses.extend(Self::column_clauses(table, key, value)?);
            }
        }
        Ok(match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Self::And(clauses)),
        })
    }

    fn combinator(table: &TableDescriptor, key: &str, value: &Value) -> Result<Self, QueryError> {
        let invalid = |reason: &str| QueryError::InvalidFilter {
            column: key.to_string(),
            operator: key.to_string(),
            reason: reason.to_string(),
        };
        if key == "not" {
            let inner = Self::normalize(table, value)?.ok_or_else(|| invalid("`not` needs a non-empty object"))?;
            return Ok(Self::Not(Box::new(inner)));
        }
        let items = value
            .as_array()
            .ok_or_else(|| invalid("expected an array of filter objects"))?;
        if items.is_empty() && key != "and" {
            return Err(invalid("expected at least one filter object"));
        }
        let children = items
            .iter()
            .map(|item| Ok(Self::normalize(table, item)?.unwrap_or(Self::And(Vec::new()))))
            .collect::<Result<Vec<_>, QueryError>>()?;
        Ok(match key {
            "and" => Self::And(children),
            "or" => Self::Or(children),
            _ => Self::Not(Box::new(Self::Or(children))),
        })
    }

    fn column_clauses(table: &TableDescriptor, key: &str, value: &Value) -> Result<Vec<Self>, QueryError> {
        let column = table.require_column(key)?;
        let collation = Collation::for_type(column.column_type);
        let leaf = |op: Operator, operand: &Value| -> Result<Self, QueryError> {
            check_operand(key, column.column_type, op, operand)?;
            Ok(Self::Compare(Comparison {
                column: key.to_string(),
                op,
                operand: operand.clone(),
                collation,
            }))
        };
        match value {
            Value::Null => Ok(vec![leaf(Operator::Is, value)?]),
            Value::Array(_) => Err(QueryError::InvalidFilter {
                column: key.to_string(),
                operator: "eq".into(),
                reason: "bare arrays are not equality operands; use `in`".into(),
            }),
            Value::Object(ops) => {
                if ops.is_empty() {
                    return Err(QueryError::InvalidFilter {
                        column: key.to_string(),
                        operator: "{}".into(),
                        reason: "empty operator map".into(),
                    });
                }
                ops.iter()
                    .map(|(name, operand)| {
                        let op = Operator::parse(name).ok_or_else(|| QueryError::InvalidFilter {
                            column: key.to_string(),
                            operator: name.clone(),
                            reason: "unknown operator".into(),
                        })?;
                        leaf(op, operand)
                    })
                    .collect()
            }
            scalar => Ok(vec![leaf(Operator::Eq, scalar)?]),
        }
    }

    /// Rename every leaf column with `rename`.
    pub fn map_columns(&self, rename: &impl Fn(&str) -> String) -> Self {
        match self {
            Self::And(children) => Self::And(children.iter().map(|c| c.map_columns(rename)).collect()),
            Self::Or(children) => Self::Or(children.iter().map(|c| c.map_columns(rename)).collect()),
            Self::Not(inner) => Self::Not(Box::new(inner.map_columns(rename))),
            Self::Compare(cmp) => Self::Compare(Comparison {
                column: rename(&cmp.column),
                ..cmp.clone()
            }),
        }
    }

    /// Top-level equality constraints (leaves reachable through `and` only).
    pub fn equalities(&self) -> Vec<(&str, &Value)> {
        match self {
            Self::Compare(Comparison {
                column,
                op: Operator::Eq,
                operand,
                ..
            }) => vec![(column.as_str(), operand)],
            Self::And(children) => children.iter().flat_map(Self::equalities).collect(),
            _ => Vec::new(),
        }
    }

    /// Three-valued evaluation: `None` is SQL unknown.
    pub fn evaluate(&self, row: &Row) -> Option<bool> {
        match self {
            Self::And(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(row) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                (!unknown).then_some(true)
            }
            Self::Or(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(row) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                (!unknown).then_some(false)
            }
            Self::Not(inner) => inner.evaluate(row).map(|b| !b),
            Self::Compare(cmp) => cmp.evaluate(row.get(&cmp.column).unwrap_or(&Value::Null)),
        }
    }

    /// Whether `row` satisfies the predicate (unknown does not match).
    pub fn matches(&self, row: &Row) -> bool {
        self.evaluate(row) == Some(true)
    }
}

impl Comparison {
    fn evaluate(&self, value: &Value) -> Option<bool> {
        use std::cmp::Ordering::{Equal, Greater, Less};
        if self.op == Operator::Is {
            return Some(match &self.operand {
                Value::Bool(b) => value.as_bool() == Some(*b),
                _ => value.is_null(),
            });
        }
        if value.is_null() {
            return None;
        }
        match self.op {
            Operator::Eq => compare_values(value, &self.operand, self.collation).map(|o| o == Equal),
            Operator::Neq => compare_values(value, &self.operand, self.collation).map(|o| o != Equal),
            Operator::Gt => compare_values(value, &self.operand, self.collation).map(|o| o == Greater),
            Operator::Gte => compare_values(value, &self.operand, self.collation).map(|o| o != Less),
            Operator::Lt => compare_values(value, &self.operand, self.collation).map(|o| o == Less),
            Operator::Lte => compare_values(value, &self.operand, self.collation).map(|o| o != Greater),
            Operator::Like | Operator::Ilike => {
                let text = value.as_str()?;
                let pattern = self.operand.as_str()?;
                Some(like_match(pattern, text, self.op == Operator::Ilike))
            }
            Operator::In => {
                let items = self.operand.as_array()?;
                let mut unknown = false;
                for item in items {
                    match compare_values(value, item, self.collation) {
                        Some(Equal) => return Some(true),
                        None => unknown = true,
                        Some(_) => {}
                    }
                }
                (!unknown).then_some(false)
            }
            Operator::Is => None,
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn check_operand(column: &str, ty: ColumnType, op: Operator, operand: &Value) -> Result<(), QueryError> {
    let fail = |reason: &str| {
        Err(QueryError::InvalidFilter {
            column: column.to_string(),
            operator: op.as_str().to_string(),
            reason: reason.to_string(),
        })
    };
    match op {
        Operator::Eq | Operator::Neq if !is_scalar(operand) => {
            fail("operand must be a string, number or boolean (use `is` for null)")
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            if matches!(ty, ColumnType::Boolean | ColumnType::Json) {
                fail("range comparison on a non-ordered column")
            } else if !matches!(operand, Value::String(_) | Value::Number(_)) {
                fail("range operand must be a string or number")
            } else {
                Ok(())
            }
        }
        Operator::Like | Operator::Ilike => {
            if !matches!(ty, ColumnType::Text | ColumnType::Other) {
                fail("pattern match on a non-text column")
            } else if !operand.is_string() {
                fail("pattern must be a string")
            } else {
                Ok(())
            }
        }
        Operator::In => match operand.as_array() {
            Some(items) if items.iter().all(is_scalar) => Ok(()),
            _ => fail("operand must be an array of scalars"),
        },
        Operator::Is => match operand {
            Value::Null => Ok(()),
            Value::Bool(_) if ty == ColumnType::Boolean => Ok(()),
            Value::Bool(_) => fail("boolean identity test on a non-boolean column"),
            _ => fail("operand must be null, true or false"),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_schema::{ColumnDescriptor, SchemaError};

    fn table() -> TableDescriptor {
        TableDescriptor {
            name: "posts".into(),
            columns: vec![
                ColumnDescriptor::new("id", ColumnType::Uuid, false, None),
                ColumnDescriptor::new("title", ColumnType::Text, true, None),
                ColumnDescriptor::new("score", ColumnType::Integer, true, None),
                ColumnDescriptor::new("published", ColumnType::Boolean, false, None),
                ColumnDescriptor::new("meta", ColumnType::Json, true, None),
            ],
            foreign_keys: vec![],
        }
    }

    fn row(v: &Value) -> Row {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn bare_values_become_equality_and_nulls_become_is() {
        let p = Predicate::normalize(&table(), &json!({"title": "a", "score": null}))
            .unwrap()
            .unwrap();
        let Predicate::And(children) = p else { panic!("expected and") };
        assert_eq!(children.len(), 2);
        let ops: Vec<_> = children
            .iter()
            .map(|c| match c {
                Predicate::Compare(cmp) => cmp.op,
                _ => panic!("expected leaf"),
            })
            .collect();
        assert!(ops.contains(&Operator::Eq));
        assert!(ops.contains(&Operator::Is));
    }

    #[test]
    fn nor_is_negated_or() {
        let p = Predicate::normalize(&table(), &json!({"nor": [{"title": "a"}, {"title": "b"}]}))
            .unwrap()
            .unwrap();
        assert!(matches!(p, Predicate::Not(ref inner) if matches!(**inner, Predicate::Or(ref c) if c.len() == 2)));
        assert!(p.matches(&row(&json!({"title": "c"}))));
        assert!(!p.matches(&row(&json!({"title": "b"}))));
    }

    #[test]
    fn shape_errors_are_rejected() {
        let t = table();
        for bad in [
            json!({"title": ["a"]}),
            json!({"published": {"gt": true}}),
            json!({"score": {"like": "1%"}}),
            json!({"title": {"in": "a"}}),
            json!({"title": {"is": true}}),
            json!({"title": {"near": 1}}),
            json!({"or": []}),
            json!({"meta": {"lt": 3}}),
        ] {
            assert!(
                matches!(Predicate::normalize(&t, &bad), Err(QueryError::InvalidFilter { .. })),
                "{bad}"
            );
        }
        assert!(matches!(
            Predicate::normalize(&t, &json!({"nope": 1})),
            Err(QueryError::Schema(SchemaError::UnknownColumn { .. }))
        ));
    }

    #[test]
    fn unknown_never_matches_even_under_not() {
        let p = Predicate::normalize(&table(), &json!({"not": {"score": {"gt": 5}}}))
            .unwrap()
            .unwrap();
        assert!(!p.matches(&row(&json!({"score": null}))));
        assert!(!p.matches(&row(&json!({}))));
        assert!(p.matches(&row(&json!({"score": 2}))));
    }

    #[test]
    fn in_like_and_is_evaluate() {
        let t = table();
        let p = Predicate::normalize(&t, &json!({"title": {"ilike": "he%o"}, "score": {"in": [1, 2]}}))
            .unwrap()
            .unwrap();
        assert!(p.matches(&row(&json!({"title": "HELLO", "score": 2}))));
        assert!(!p.matches(&row(&json!({"title": "HELLO", "score": 3}))));
        let is_true = Predicate::normalize(&t, &json!({"published": {"is": true}}))
            .unwrap()
            .unwrap();
        assert_eq!(is_true.evaluate(&row(&json!({"published": null}))), Some(false));
    }

    #[test]
    fn equalities_see_through_and_only() {
        let p = Predicate::normalize(&table(), &json!({"title": "a", "or": [{"score": 1}]}))
            .unwrap()
            .unwrap();
        assert_eq!(p.equalities(), vec![("title", &json!("a"))]);
    }
}
