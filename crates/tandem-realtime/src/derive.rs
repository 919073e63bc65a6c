// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Channel-set derivation for a materialized result.

use std::collections::BTreeSet;

use serde_json::Value;
use tandem_query::QueryNode;
use tandem_schema::{Row, Schema, PRIMARY_KEY};

use crate::{ChannelName, RealtimeError};

/// Channels that announce every change able to alter `docs`, the
/// materialized result of `root`.
///
/// The root contributes one entity channel per row, unless its filter pins a
/// foreign key to one value; then the single foreign-key channel also
/// announces rows entering the result. Every include contributes one channel
/// per distinct join value on the parent side, so fan-out relations cost one
/// subscription per parent rather than one per child row.
pub fn derive_channels(schema: &Schema, root: &QueryNode, docs: &[Row]) -> Result<BTreeSet<ChannelName>, RealtimeError> {
    let table = schema.table(&root.table)?;
    let mut channels = BTreeSet::new();
    let pinned = root
        .filter
        .as_ref()
        .map(|filter| filter.equalities())
        .unwrap_or_default()
        .into_iter()
        .find_map(|(column, value)| {
            table
                .is_foreign_key(column)
                .then(|| ChannelName::for_value(&root.table, column, value))
                .flatten()
        });
    match pinned {
        Some(channel) => {
            channels.insert(channel);
        }
        None => channels.extend(
            docs.iter()
                .filter_map(|doc| doc.get(PRIMARY_KEY))
                .filter_map(|id| ChannelName::for_value(&root.table, crate::ENTITY_KIND, id)),
        ),
    }
    let parents: Vec<&Row> = docs.iter().collect();
    collect_includes(schema, root, &parents, &mut channels)?;
    Ok(channels)
}

fn collect_includes(
    schema: &Schema,
    node: &QueryNode,
    parents: &[&Row],
    channels: &mut BTreeSet<ChannelName>,
) -> Result<(), RealtimeError> {
    let parent_table = schema.table(&node.table)?;
    for child in &node.children {
        let (Some(edge), Some(relation)) = (&child.edge, &child.relation) else {
            continue;
        };
        let join_property = parent_table.property_of(&edge.local_column);
        let mut nested = Vec::new();
        for parent in parents {
            if let Some(channel) = parent
                .get(&join_property)
                .and_then(|value| ChannelName::for_value(&child.table, &edge.foreign_column, value))
            {
                channels.insert(channel);
            }
            match parent.get(relation) {
                Some(Value::Array(items)) => nested.extend(items.iter().filter_map(Value::as_object)),
                Some(Value::Object(item)) => nested.push(item),
                _ => {}
            }
        }
        collect_includes(schema, child, &nested, channels)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_dry_tests::{blog_schema, row};
    use tandem_query::{QueryCompiler, QueryDescriptor, RelationRequest};

    fn names(channels: &BTreeSet<ChannelName>) -> Vec<String> {
        channels.iter().map(ToString::to_string).collect()
    }

    fn root_of(descriptor: &QueryDescriptor) -> QueryNode {
        QueryCompiler::new(blog_schema()).normalize(descriptor).unwrap()
    }

    #[test]
    fn plain_results_watch_each_row() {
        let root = root_of(&QueryDescriptor::new("posts"));
        let docs = [row(json!({"id": "p1"})), row(json!({"id": "p2"}))];
        let channels = derive_channels(&blog_schema(), &root, &docs).unwrap();
        assert_eq!(names(&channels), ["posts:id:p1", "posts:id:p2"]);
    }

    #[test]
    fn a_pinned_foreign_key_watches_the_whole_set() {
        let root = root_of(&QueryDescriptor::new("comments").filter(json!({"post_id": "p1"})));
        let docs = [row(json!({"id": "c1"})), row(json!({"id": "c2"}))];
        let channels = derive_channels(&blog_schema(), &root, &docs).unwrap();
        assert_eq!(names(&channels), ["comments:post_id:p1"]);
    }

    #[test]
    fn includes_watch_one_channel_per_distinct_parent_key() {
        let descriptor = QueryDescriptor::new("posts")
            .include("author", RelationRequest::new("users"))
            .include("comments", RelationRequest::new("comments"));
        let root = root_of(&descriptor);
        let docs = [
            row(json!({
                "id": "p1", "authorId": "u1",
                "author": {"id": "u1"},
                "comments": [{"id": "c1"}, {"id": "c2"}, {"id": "c3"}]
            })),
            row(json!({"id": "p2", "authorId": "u1", "author": {"id": "u1"}, "comments": []})),
        ];
        let channels = derive_channels(&blog_schema(), &root, &docs).unwrap();
        assert_eq!(
            names(&channels),
            [
                "comments:post_id:p1",
                "comments:post_id:p2",
                "posts:id:p1",
                "posts:id:p2",
                "users:id:u1",
            ]
        );
    }

    #[test]
    fn nested_includes_follow_materialized_children() {
        let descriptor = QueryDescriptor::new("users")
            .include("posts", RelationRequest::new("posts").include("comments", RelationRequest::new("comments")));
        let root = root_of(&descriptor);
        let docs = [row(json!({"id": "u1", "posts": [{"id": "p1", "comments": []}, {"id": "p2"}]}))];
        let channels = derive_channels(&blog_schema(), &root, &docs).unwrap();
        assert_eq!(
            names(&channels),
            ["comments:post_id:p1", "comments:post_id:p2", "posts:author_id:u1", "users:id:u1"]
        );
    }
}
