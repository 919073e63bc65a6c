// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Channel names.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::RealtimeError;

/// Match kind of a per-entity channel.
pub const ENTITY_KIND: &str = "id";

/// `table:kind:value`, e.g. `posts:id:p1` or `comments:post_id:p1`.
///
/// `kind` is the column the change is matched on; the value may itself
/// contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName {
    /// Table whose rows the channel announces.
    pub table: String,
    /// Column matched against `value`.
    pub kind: String,
    /// Rendered column value.
    pub value: String,
}

impl ChannelName {
    /// Channel for rows of `table` whose `kind` column equals `value`.
    pub fn new(table: &str, kind: &str, value: &str) -> Self {
        Self {
            table: table.to_string(),
            kind: kind.to_string(),
            value: value.to_string(),
        }
    }

    /// Channel for one entity.
    pub fn entity(table: &str, id: &str) -> Self {
        Self::new(table, ENTITY_KIND, id)
    }

    /// Channel matching `value` rendered the way the remote store renders it.
    ///
    /// Returns `None` for nulls and composite values.
    pub fn for_value(table: &str, kind: &str, value: &Value) -> Option<Self> {
        render(value).map(|value| Self::new(table, kind, &value))
    }

    /// Whether this is a per-entity channel.
    pub fn is_entity(&self) -> bool {
        self.kind == ENTITY_KIND
    }
}

pub(crate) fn render(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.table, self.kind, self.value)
    }
}

impl FromStr for ChannelName {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(table), Some(kind), Some(value)) if !table.is_empty() && !kind.is_empty() && !value.is_empty() => {
                Ok(Self::new(table, kind, value))
            }
            _ => Err(RealtimeError::InvalidChannel(s.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_round_trip_through_text() {
        let name: ChannelName = "events:starts_at:2024-01-01T10:00:00Z".parse().unwrap();
        assert_eq!(name.table, "events");
        assert_eq!(name.kind, "starts_at");
        assert_eq!(name.value, "2024-01-01T10:00:00Z");
        assert_eq!(name.to_string(), "events:starts_at:2024-01-01T10:00:00Z");
        assert!(ChannelName::entity("posts", "p1").is_entity());
    }

    #[test]
    fn malformed_names_are_rejected() {
        for bad in ["posts", "posts:id", "posts::p1", ":id:p1", "posts:id:"] {
            assert_eq!(
                bad.parse::<ChannelName>(),
                Err(RealtimeError::InvalidChannel(bad.to_string()))
            );
        }
    }

    #[test]
    fn only_scalars_name_channels() {
        assert_eq!(
            ChannelName::for_value("posts", "score", &json!(7)).unwrap().to_string(),
            "posts:score:7"
        );
        assert!(ChannelName::for_value("posts", "author_id", &json!(null)).is_none());
        assert!(ChannelName::for_value("posts", "tags", &json!(["a"])).is_none());
    }
}
