// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Local documents and the change rows the push pipeline consumes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_schema::{Row, DELETED_PROPERTY, PENDING_PROPERTY, PRIMARY_KEY};

/// Property carrying the update timestamp (from the `updated_at` column).
pub const UPDATED_AT_PROPERTY: &str = "updatedAt";
/// Property carrying the opaque version token (from the `version` column).
pub const VERSION_PROPERTY: &str = "version";

/// A document in the local replica.
///
/// `fields` holds every property except the primary key and the two
/// bookkeeping flags, which are lifted into typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDocument {
    /// Primary key.
    pub id: String,
    /// Remaining properties (camelCase).
    #[serde(flatten)]
    pub fields: Row,
    /// A locally issued mutation awaits remote confirmation.
    #[serde(rename = "isPending", default)]
    pub is_pending: bool,
    /// Tombstone flag.
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
}

impl LocalDocument {
    /// A confirmed, live document.
    pub fn new(id: impl Into<String>, fields: Row) -> Self {
        Self {
            id: id.into(),
            fields,
            is_pending: false,
            deleted: false,
        }
    }

    /// A bare tombstone for `id` (no fields known).
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            deleted: true,
            ..Self::new(id, Row::new())
        }
    }

    /// Split a flat property map into a document.
    ///
    /// Returns `None` when the map has no string or numeric `id`.
    pub fn from_row(mut row: Row) -> Option<Self> {
        let id = match row.remove(PRIMARY_KEY)? {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let is_pending = row.remove(PENDING_PROPERTY).and_then(|v| v.as_bool()).unwrap_or(false);
        let deleted = row.remove(DELETED_PROPERTY).and_then(|v| v.as_bool()).unwrap_or(false);
        Some(Self {
            id,
            fields: row,
            is_pending,
            deleted,
        })
    }

    /// Flatten back into one property map (id and flags included).
    pub fn to_row(&self) -> Row {
        let mut row = self.fields.clone();
        row.insert(PRIMARY_KEY.to_string(), Value::String(self.id.clone()));
        row.insert(PENDING_PROPERTY.to_string(), Value::Bool(self.is_pending));
        row.insert(DELETED_PROPERTY.to_string(), Value::Bool(self.deleted));
        row
    }

    /// Property map without the bookkeeping flags (what the remote store sees).
    pub fn body(&self) -> Row {
        let mut row = self.fields.clone();
        row.insert(PRIMARY_KEY.to_string(), Value::String(self.id.clone()));
        row
    }

    /// Property lookup.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.fields.get(property)
    }

    /// Declared update timestamp, if the table tracks one.
    pub fn updated_at(&self) -> Option<&str> {
        self.fields.get(UPDATED_AT_PROPERTY).and_then(Value::as_str)
    }

    /// Copy flagged as pending.
    pub fn pending(mut self) -> Self {
        self.is_pending = true;
        self
    }

    /// Copy flagged as confirmed (not pending).
    pub fn confirmed(mut self) -> Self {
        self.is_pending = false;
        self
    }
}

/// One unit of push work emitted by a local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    /// State after the local write.
    pub new_document: LocalDocument,
    /// State the write was based on, if known (`None` for true inserts).
    pub assumed_master_state: Option<LocalDocument>,
}

impl ChangeRow {
    /// Whether the row deletes its document.
    pub fn is_delete(&self) -> bool {
        self.new_document.deleted
    }

    /// Property-level difference from the assumed master state.
    ///
    /// Without a master state the full body is returned. Properties the new
    /// state dropped are sent as `null`.
    pub fn diff(&self) -> Row {
        let body = self.new_document.body();
        let Some(master) = &self.assumed_master_state else {
            return body;
        };
        let master = master.body();
        let mut patch: Row = body
            .iter()
            .filter(|(key, value)| master.get(key.as_str()) != Some(value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for key in master.keys() {
            if !body.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
        patch
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn flags_lift_out_of_rows_and_back() {
        let doc = LocalDocument::from_row(row(json!({"id": "a", "title": "t", "isPending": true}))).unwrap();
        assert!(doc.is_pending);
        assert!(!doc.deleted);
        assert_eq!(doc.fields, row(json!({"title": "t"})));
        assert_eq!(doc.to_row(), row(json!({"id": "a", "title": "t", "isPending": true, "_deleted": false})));
        assert!(LocalDocument::from_row(row(json!({"title": "no id"}))).is_none());
    }

    #[test]
    fn serde_uses_local_flag_names() {
        let doc = LocalDocument::tombstone("x");
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value, json!({"id": "x", "isPending": false, "_deleted": true}));
        let back: LocalDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn diff_sends_only_changed_properties() {
        let master = LocalDocument::new("a", row(json!({"title": "old", "body": "same", "tag": "x"})));
        let new = LocalDocument::new("a", row(json!({"title": "new", "body": "same"}))).pending();
        let change = ChangeRow {
            new_document: new.clone(),
            assumed_master_state: Some(master),
        };
        assert_eq!(change.diff(), row(json!({"title": "new", "tag": null})));

        let insert = ChangeRow {
            new_document: new,
            assumed_master_state: None,
        };
        assert_eq!(insert.diff(), row(json!({"id": "a", "title": "new", "body": "same"})));
    }
}
