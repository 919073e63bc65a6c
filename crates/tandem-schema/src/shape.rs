// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON-schema-like collection shapes handed to the local store.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::TableDescriptor;
use crate::{DELETED_PROPERTY, PENDING_PROPERTY, PRIMARY_KEY};

/// Maximum primary key length advertised to the local store (indexed strings need a bound).
pub const PRIMARY_KEY_MAX_LENGTH: usize = 128;

/// Typed collection definition derived from a [`TableDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionShape {
    /// Collection (table) name.
    pub title: String,
    /// Schema version the local store tags documents with.
    pub version: u32,
    /// Primary key property.
    pub primary_key: String,
    /// Always `"object"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Property name → property shape.
    pub properties: BTreeMap<String, PropertyShape>,
    /// Properties that must be present.
    pub required: Vec<String>,
}

/// Shape of a single property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyShape {
    /// Accepted JSON types (`"null"` is appended for nullable columns).
    #[serde(rename = "type")]
    pub types: Vec<&'static str>,
    /// Length bound for indexed string properties.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl TableDescriptor {
    /// Derive the local collection shape for this table at `version`.
    ///
    /// Columns with a default are not required locally; the remote store
    /// fills them on insert and the confirmed row flows back through the pull
    /// channel.
    pub fn collection_shape(&self, version: u32) -> CollectionShape {
        let mut properties = BTreeMap::new();
        let mut required = vec![PRIMARY_KEY.to_string()];
        for column in &self.columns {
            let mut types = vec![column.column_type.json_type()];
            if column.nullable {
                types.push("null");
            }
            let max_length = (column.name == PRIMARY_KEY).then_some(PRIMARY_KEY_MAX_LENGTH);
            properties.insert(column.property.clone(), PropertyShape { types, max_length });
            if !column.nullable && !column.has_default() && column.name != PRIMARY_KEY {
                required.push(column.property.clone());
            }
        }
        for flag in [PENDING_PROPERTY, DELETED_PROPERTY] {
            properties.insert(
                flag.to_string(),
                PropertyShape {
                    types: vec!["boolean"],
                    max_length: None,
                },
            );
        }
        CollectionShape {
            title: self.name.clone(),
            version,
            primary_key: PRIMARY_KEY.to_string(),
            kind: "object",
            properties,
            required,
        }
    }
}
