// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Schema fixtures and row builders.

use std::sync::Arc;

use serde_json::Value;
use tandem_schema::{Row, Schema};

/// A small blog: users write posts, posts collect comments.
///
/// Every table carries `created_at`; posts and comments also carry
/// `updated_at`, and posts a `version` token.
pub const BLOG_SCHEMA_JSON: &str = r#"{
  "tables": {
    "users": {
      "columns": [
        {"name": "id", "type": "uuid", "nullable": false},
        {"name": "display_name", "type": "text", "nullable": false},
        {"name": "created_at", "type": "timestamptz", "nullable": false, "default": "now()"}
      ]
    },
    "posts": {
      "columns": [
        {"name": "id", "type": "uuid", "nullable": false},
        {"name": "author_id", "type": "uuid", "nullable": false},
        {"name": "title", "type": "text", "nullable": false},
        {"name": "score", "type": "int4"},
        {"name": "created_at", "type": "timestamptz", "nullable": false, "default": "now()"},
        {"name": "updated_at", "type": "timestamptz", "nullable": false, "default": "now()"},
        {"name": "version", "type": "int8", "nullable": false, "default": "1"}
      ],
      "foreign_keys": [
        {"column": "author_id", "references": {"table": "users", "column": "id"}}
      ]
    },
    "comments": {
      "columns": [
        {"name": "id", "type": "uuid", "nullable": false},
        {"name": "post_id", "type": "uuid", "nullable": false},
        {"name": "body", "type": "text", "nullable": false},
        {"name": "created_at", "type": "timestamptz", "nullable": false, "default": "now()"},
        {"name": "updated_at", "type": "timestamptz", "nullable": false, "default": "now()"}
      ],
      "foreign_keys": [
        {"column": "post_id", "references": {"table": "posts", "column": "id"}}
      ]
    }
  }
}"#;

/// Parsed [`BLOG_SCHEMA_JSON`].
#[allow(clippy::expect_used)]
pub fn blog_schema() -> Arc<Schema> {
    Arc::new(Schema::from_json(BLOG_SCHEMA_JSON).expect("blog fixture schema is valid"))
}

/// Build a [`Row`] from a JSON object literal; non-objects yield an empty row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}
