// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Immutable table descriptors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::naming::{column_name, property_name};
use crate::{SchemaError, CREATED_AT, DELETED_PROPERTY, PENDING_PROPERTY, PRIMARY_KEY, UPDATED_AT, VERSION};

/// A JSON object keyed by column (remote) or property (local) names.
pub type Row = serde_json::Map<String, Value>;

/// Semantic column type, coarse enough to drive collation and shape generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Character data.
    Text,
    /// UUID rendered as a string.
    Uuid,
    /// Integral numbers.
    Integer,
    /// Floating point or arbitrary precision numbers.
    Float,
    /// Booleans.
    Boolean,
    /// Dates and timestamps rendered as RFC 3339 strings.
    Timestamp,
    /// Structured JSON values.
    Json,
    /// Anything the reflector does not recognise; treated as text.
    Other,
}

impl ColumnType {
    /// Map a SQL (or OpenAPI `format`) type name onto a semantic type.
    pub fn from_sql(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase();
        let base = lower.split(['(', ' ', '[']).next().unwrap_or_default();
        match base {
            "text" | "varchar" | "character" | "char" | "citext" | "string" | "name" => Self::Text,
            "uuid" => Self::Uuid,
            "int" | "int2" | "int4" | "int8" | "integer" | "smallint" | "bigint" | "serial"
            | "bigserial" => Self::Integer,
            "float" | "float4" | "float8" | "real" | "double" | "numeric" | "decimal" | "number" => {
                Self::Float
            }
            "bool" | "boolean" => Self::Boolean,
            "timestamp" | "timestamptz" | "date" | "time" | "timetz" | "date-time" => Self::Timestamp,
            "json" | "jsonb" | "object" | "array" => Self::Json,
            _ => Self::Other,
        }
    }

    /// JSON-schema type keyword used in collection shapes.
    pub fn json_type(self) -> &'static str {
        match self {
            Self::Text | Self::Uuid | Self::Timestamp | Self::Other => "string",
            Self::Integer => "integer",
            Self::Float => "number",
            Self::Boolean => "boolean",
            Self::Json => "object",
        }
    }

    /// Returns `true` for types ordered numerically.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

/// One reflected column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    /// Remote column name (snake_case).
    pub name: String,
    /// Local property name (camelCase).
    pub property: String,
    /// Semantic type.
    pub column_type: ColumnType,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Default-value expression, if any.
    pub default: Option<String>,
}

impl ColumnDescriptor {
    /// Build a descriptor, deriving the property name from the column name.
    pub fn new(name: &str, column_type: ColumnType, nullable: bool, default: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            property: property_name(name),
            column_type,
            nullable,
            default,
        }
    }

    /// Whether the remote store fills this column when it is omitted.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

/// Outgoing foreign key: `column` on the owning table references `target_table.target_column`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ForeignKeyEdge {
    /// Local column on the owning table.
    pub column: String,
    /// Referenced table.
    pub target_table: String,
    /// Referenced column.
    pub target_column: String,
}

/// Reflected table. Immutable once the [`Schema`] is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescriptor {
    /// Logical table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDescriptor>,
    /// Outgoing foreign keys.
    pub foreign_keys: Vec<ForeignKeyEdge>,
}

impl TableDescriptor {
    /// Look up a column by remote name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a column by remote name, failing with [`SchemaError::UnknownColumn`].
    pub fn require_column(&self, name: &str) -> Result<&ColumnDescriptor, SchemaError> {
        self.column(name).ok_or_else(|| SchemaError::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }

    /// Whether the table declares `name`.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Look up a column by local property name.
    pub fn column_by_property(&self, property: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.property == property)
    }

    /// Local property name for a column; unknown columns fall back to the naming rule.
    pub fn property_of(&self, column: &str) -> String {
        self.column(column)
            .map_or_else(|| property_name(column), |c| c.property.clone())
    }

    /// Foreign keys declared on this table that reference `table`.
    pub fn foreign_keys_to<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKeyEdge> + 'a {
        self.foreign_keys.iter().filter(move |fk| fk.target_table == table)
    }

    /// Foreign key declared on `column`, if any.
    pub fn foreign_key_on(&self, column: &str) -> Option<&ForeignKeyEdge> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    /// Whether `column` carries a foreign key.
    pub fn is_foreign_key(&self, column: &str) -> bool {
        self.foreign_key_on(column).is_some()
    }

    /// Whether the table tracks an update timestamp.
    pub fn has_updated_at(&self) -> bool {
        self.has_column(UPDATED_AT)
    }

    /// Whether the table tracks a creation timestamp.
    pub fn has_created_at(&self) -> bool {
        self.has_column(CREATED_AT)
    }

    /// Whether the table carries an explicit version token column.
    pub fn has_version(&self) -> bool {
        self.has_column(VERSION)
    }

    /// Convert a remote row (column names) into a local document body (property names).
    ///
    /// Embedded relation objects and arrays are left as-is; callers that know
    /// the include shape convert them recursively.
    pub fn to_local(&self, row: &Row) -> Row {
        row.iter()
            .map(|(key, value)| (self.property_of(key), value.clone()))
            .collect()
    }

    /// Convert a local document body into a remote row.
    ///
    /// Local-only bookkeeping (`isPending`, `_deleted`) and properties that do
    /// not map onto a declared column are dropped.
    pub fn to_remote(&self, doc: &Row) -> Row {
        doc.iter()
            .filter(|(key, _)| key.as_str() != PENDING_PROPERTY && key.as_str() != DELETED_PROPERTY)
            .filter_map(|(key, value)| {
                self.column_by_property(key)
                    .map(|c| (c.name.clone(), value.clone()))
                    .or_else(|| {
                        let column = column_name(key);
                        self.has_column(&column).then(|| (column, value.clone()))
                    })
            })
            .collect()
    }
}

/// The full reflected schema: logical table name → descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Schema {
    pub(crate) tables: BTreeMap<String, TableDescriptor>,
}

impl Schema {
    /// Build a schema from already-validated descriptors.
    ///
    /// Runs the same structural validation as the reflectors.
    pub fn from_tables(tables: impl IntoIterator<Item = TableDescriptor>) -> Result<Self, SchemaError> {
        let schema = Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Result<&TableDescriptor, SchemaError> {
        self.tables
            .get(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))
    }

    /// Whether the schema declares `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// All tables, ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    /// Table names, ordered.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub(crate) fn validate(&self) -> Result<(), SchemaError> {
        for table in self.tables.values() {
            if !table.has_column(PRIMARY_KEY) {
                return Err(SchemaError::MissingPrimaryKey(table.name.clone()));
            }
            for fk in &table.foreign_keys {
                table.require_column(&fk.column)?;
                let target_ok = self
                    .tables
                    .get(&fk.target_table)
                    .is_some_and(|t| t.has_column(&fk.target_column));
                if !target_ok {
                    return Err(SchemaError::DanglingForeignKey {
                        table: table.name.clone(),
                        column: fk.column.clone(),
                        target: format!("{}.{}", fk.target_table, fk.target_column),
                    });
                }
            }
        }
        Ok(())
    }
}
