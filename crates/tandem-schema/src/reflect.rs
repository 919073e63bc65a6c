// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Schema reflectors.
//!
//! Two input forms are accepted:
//!
//! - [`SchemaDescription`]: the native JSON form (`tables.<name>.columns` and
//!   `tables.<name>.foreign_keys`).
//! - A PostgREST-style OpenAPI document, where columns live under
//!   `definitions.<table>.properties`, nullability is the complement of
//!   `required`, and foreign keys are announced by a
//!   `<fk table='..' column='..'/>` marker in the column description.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::types::{ColumnDescriptor, ColumnType, ForeignKeyEdge, Schema, TableDescriptor};
use crate::SchemaError;

/// Native schema description: logical table name → table description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    /// Tables keyed by logical name.
    pub tables: BTreeMap<String, TableDescription>,
}

/// One table in a [`SchemaDescription`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    /// Columns in declaration order.
    #[serde(default)]
    pub columns: Vec<ColumnDescription>,
    /// Outgoing foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDescription>,
}

/// One column in a [`TableDescription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    /// Column name.
    pub name: String,
    /// SQL type name (`text`, `uuid`, `timestamptz`, ...).
    #[serde(rename = "type", default = "default_sql_type")]
    pub sql_type: String,
    /// Whether NULL is accepted.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Default-value expression.
    #[serde(default)]
    pub default: Option<String>,
}

/// One foreign key in a [`TableDescription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDescription {
    /// Local column.
    pub column: String,
    /// Referenced column.
    pub references: ColumnRef,
}

/// `table.column` reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Referenced table.
    pub table: String,
    /// Referenced column.
    pub column: String,
}

fn default_sql_type() -> String {
    "text".to_string()
}

fn default_nullable() -> bool {
    true
}

impl Schema {
    /// Reflect a native [`SchemaDescription`].
    pub fn from_description(desc: &SchemaDescription) -> Result<Self, SchemaError> {
        let tables = desc.tables.iter().map(|(name, table)| TableDescriptor {
            name: name.clone(),
            columns: table
                .columns
                .iter()
                .map(|c| {
                    ColumnDescriptor::new(
                        &c.name,
                        ColumnType::from_sql(&c.sql_type),
                        c.nullable,
                        c.default.clone(),
                    )
                })
                .collect(),
            foreign_keys: table
                .foreign_keys
                .iter()
                .map(|fk| ForeignKeyEdge {
                    column: fk.column.clone(),
                    target_table: fk.references.table.clone(),
                    target_column: fk.references.column.clone(),
                })
                .collect(),
        });
        let schema = Self::from_tables(tables)?;
        debug!(tables = schema.tables.len(), "reflected schema description");
        Ok(schema)
    }

    /// Parse and reflect a native schema description from JSON text.
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let desc: SchemaDescription =
            serde_json::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))?;
        Self::from_description(&desc)
    }

    /// Reflect a PostgREST-style OpenAPI document.
    pub fn from_openapi(doc: &Value) -> Result<Self, SchemaError> {
        let definitions = doc
            .get("definitions")
            .and_then(Value::as_object)
            .ok_or_else(|| SchemaError::Parse("missing `definitions` object".into()))?;

        let mut tables = Vec::with_capacity(definitions.len());
        for (name, definition) in definitions {
            let properties = definition
                .get("properties")
                .and_then(Value::as_object)
                .ok_or_else(|| SchemaError::Parse(format!("table `{name}` has no `properties`")))?;
            let required: Vec<&str> = definition
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();

            let mut columns = Vec::with_capacity(properties.len());
            let mut foreign_keys = Vec::new();
            for (column, prop) in properties {
                let format = prop
                    .get("format")
                    .or_else(|| prop.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("text");
                let default = prop.get("default").map(|d| match d {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                columns.push(ColumnDescriptor::new(
                    column,
                    ColumnType::from_sql(format),
                    !required.contains(&column.as_str()),
                    default,
                ));
                if let Some((target_table, target_column)) = prop
                    .get("description")
                    .and_then(Value::as_str)
                    .and_then(parse_fk_marker)
                {
                    foreign_keys.push(ForeignKeyEdge {
                        column: column.clone(),
                        target_table,
                        target_column,
                    });
                }
            }
            tables.push(TableDescriptor {
                name: name.clone(),
                columns,
                foreign_keys,
            });
        }
        let schema = Self::from_tables(tables)?;
        debug!(tables = schema.tables.len(), "reflected openapi schema");
        Ok(schema)
    }
}

/// Extract `(table, column)` from a `<fk table='t' column='c'/>` marker.
fn parse_fk_marker(description: &str) -> Option<(String, String)> {
    let start = description.find("<fk ")?;
    let rest = &description[start..];
    let tag = &rest[..rest.find("/>")?];
    Some((marker_attr(tag, "table")?, marker_attr(tag, "column")?))
}

fn marker_attr(tag: &str, name: &str) -> Option<String> {
    let needle = format!("{name}='");
    let start = tag.find(&needle)? + needle.len();
    let len = tag[start..].find('\'')?;
    Some(tag[start..start + len].to_string())
}
