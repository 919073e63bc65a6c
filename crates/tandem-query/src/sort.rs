// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sort normalization and row ordering.

use std::cmp::Ordering;

use serde::Serialize;
use serde_json::Value;
use tandem_schema::{ColumnType, Row, TableDescriptor, CREATED_AT, PRIMARY_KEY};

use crate::descriptor::{SortInput, SortItem};
use crate::eval::order_values;
use crate::QueryError;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Ascending, NULLs last.
    Asc,
    /// Descending, NULLs first.
    Desc,
}

impl Direction {
    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Asc),
            "desc" | "descending" => Some(Self::Desc),
            _ => None,
        }
    }

    /// Keyword used by the remote `order` parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// String-collation strategy derived from the column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collation {
    /// Codepoint order.
    Binary,
    /// Numbers, including numeric strings.
    Numeric,
    /// RFC 3339 instants.
    Timestamp,
    /// `false < true`.
    Boolean,
}

impl Collation {
    /// Collation used for a column of type `ty`.
    pub fn for_type(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Integer | ColumnType::Float => Self::Numeric,
            ColumnType::Timestamp => Self::Timestamp,
            ColumnType::Boolean => Self::Boolean,
            ColumnType::Text | ColumnType::Uuid | ColumnType::Json | ColumnType::Other => Self::Binary,
        }
    }
}

/// One normalized sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SortKey {
    /// Column (remote space) or property (local space).
    pub column: String,
    /// Direction.
    pub direction: Direction,
    /// Collation.
    pub collation: Collation,
}

impl SortKey {
    /// Order two rows on this key. NULL (or missing) is greater than any
    /// value, so it lands last ascending and first descending.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let left = a.get(&self.column).unwrap_or(&Value::Null);
        let right = b.get(&self.column).unwrap_or(&Value::Null);
        let ord = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => order_values(left, right, self.collation),
        };
        match self.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

/// Lexicographic row comparison over `keys`.
pub fn compare_rows(keys: &[SortKey], a: &Row, b: &Row) -> Ordering {
    keys.iter()
        .map(|key| key.compare(a, b))
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Rewrite key columns with `rename`.
pub(crate) fn map_keys(keys: &[SortKey], rename: &impl Fn(&str) -> String) -> Vec<SortKey> {
    keys.iter()
        .map(|key| SortKey {
            column: rename(&key.column),
            ..key.clone()
        })
        .collect()
}

/// Normalize a sort spec against `table`.
///
/// Without a spec, nested relations default to `created_at` ascending when
/// the table tracks it. The primary key is always appended as a tie-break.
pub(crate) fn normalize_sort(
    table: &TableDescriptor,
    input: Option<&SortInput>,
    nested: bool,
) -> Result<Vec<SortKey>, QueryError> {
    let mut entries: Vec<(String, Direction)> = Vec::new();
    match input {
        None if nested && table.has_created_at() => entries.push((CREATED_AT.to_string(), Direction::Asc)),
        None => {}
        Some(SortInput::Column(column)) => entries.push((column.clone(), Direction::Asc)),
        Some(SortInput::List(items)) => {
            for item in items {
                match item {
                    SortItem::Column(column) => entries.push((column.clone(), Direction::Asc)),
                    SortItem::Directed(map) => {
                        let mut iter = map.iter();
                        let (Some((column, dir)), None) = (iter.next(), iter.next()) else {
                            return Err(QueryError::InvalidSort(
                                "each directed sort entry needs exactly one column".into(),
                            ));
                        };
                        let direction = Direction::parse(dir).ok_or_else(|| {
                            QueryError::InvalidSort(format!("unknown direction `{dir}` for `{column}`"))
                        })?;
                        entries.push((column.clone(), direction));
                    }
                }
            }
        }
    }
    if !entries.iter().any(|(column, _)| column == PRIMARY_KEY) {
        entries.push((PRIMARY_KEY.to_string(), Direction::Asc));
    }
    let mut keys: Vec<SortKey> = Vec::with_capacity(entries.len());
    for (column, direction) in entries {
        let descriptor = table.require_column(&column)?;
        if keys.iter().any(|k| k.column == column) {
            continue;
        }
        keys.push(SortKey {
            collation: Collation::for_type(descriptor.column_type),
            column,
            direction,
        });
    }
    Ok(keys)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_schema::ColumnDescriptor;

    fn comments() -> TableDescriptor {
        TableDescriptor {
            name: "comments".into(),
            columns: vec![
                ColumnDescriptor::new("id", ColumnType::Text, false, None),
                ColumnDescriptor::new("score", ColumnType::Integer, true, None),
                ColumnDescriptor::new("created_at", ColumnType::Timestamp, false, Some("now()".into())),
            ],
            foreign_keys: vec![],
        }
    }

    fn columns(keys: &[SortKey]) -> Vec<(&str, Direction)> {
        keys.iter().map(|k| (k.column.as_str(), k.direction)).collect()
    }

    #[test]
    fn every_shape_normalizes_and_ends_with_primary_key() {
        let t = comments();
        let single = normalize_sort(&t, Some(&SortInput::Column("score".into())), false).unwrap();
        assert_eq!(columns(&single), vec![("score", Direction::Asc), ("id", Direction::Asc)]);

        let list: SortInput = serde_json::from_value(json!([{"score": "desc"}, "created_at"])).unwrap();
        let keys = normalize_sort(&t, Some(&list), false).unwrap();
        assert_eq!(
            columns(&keys),
            vec![("score", Direction::Desc), ("created_at", Direction::Asc), ("id", Direction::Asc)]
        );
        assert_eq!(keys[1].collation, Collation::Timestamp);

        let explicit_id: SortInput = serde_json::from_value(json!([{"id": "desc"}])).unwrap();
        let keys = normalize_sort(&t, Some(&explicit_id), false).unwrap();
        assert_eq!(columns(&keys), vec![("id", Direction::Desc)]);
    }

    #[test]
    fn nested_default_is_creation_time() {
        let keys = normalize_sort(&comments(), None, true).unwrap();
        assert_eq!(columns(&keys), vec![("created_at", Direction::Asc), ("id", Direction::Asc)]);
        let keys = normalize_sort(&comments(), None, false).unwrap();
        assert_eq!(columns(&keys), vec![("id", Direction::Asc)]);
    }

    #[test]
    fn bad_specs_are_rejected() {
        let t = comments();
        let two: SortInput = serde_json::from_value(json!([{"score": "asc", "id": "asc"}])).unwrap();
        assert!(matches!(normalize_sort(&t, Some(&two), false), Err(QueryError::InvalidSort(_))));
        let sideways: SortInput = serde_json::from_value(json!([{"score": "up"}])).unwrap();
        assert!(matches!(normalize_sort(&t, Some(&sideways), false), Err(QueryError::InvalidSort(_))));
        assert!(matches!(
            normalize_sort(&t, Some(&SortInput::Column("nope".into())), false),
            Err(QueryError::Schema(_))
        ));
    }

    #[test]
    fn nulls_last_ascending_first_descending() {
        let asc = SortKey {
            column: "score".into(),
            direction: Direction::Asc,
            collation: Collation::Numeric,
        };
        let desc = SortKey {
            direction: Direction::Desc,
            ..asc.clone()
        };
        let null = json!({"score": null}).as_object().unwrap().clone();
        let one = json!({"score": 1}).as_object().unwrap().clone();
        assert_eq!(asc.compare(&null, &one), Ordering::Greater);
        assert_eq!(desc.compare(&null, &one), Ordering::Less);
    }
}
