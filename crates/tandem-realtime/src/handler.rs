// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Channel message handling.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tandem_query::{compare_values, Collation};
use tandem_replication::{PullEvent, PullHub, PullOrigin};
use tandem_schema::{Schema, PRIMARY_KEY};
use tandem_store_port::{ChannelEvent, ChannelMessage, LocalDocument, LocalStore, RemoteStore};
use tracing::debug;

use crate::channel::render;
use crate::{ChannelName, RealtimeError};

/// Receives every message of every attached channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message delivered on `channel`.
    async fn handle(&self, channel: &ChannelName, message: ChannelMessage) -> Result<(), RealtimeError>;
}

/// Feeds channel messages into a replica's pull streams.
pub struct ReplicaHandler {
    schema: Arc<Schema>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    pulls: Arc<PullHub>,
}

impl std::fmt::Debug for ReplicaHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandler").finish_non_exhaustive()
    }
}

impl ReplicaHandler {
    /// Create a handler for one replica.
    pub fn new(schema: Arc<Schema>, store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>, pulls: Arc<PullHub>) -> Self {
        Self {
            schema,
            store,
            remote,
            pulls,
        }
    }

    async fn local_is_newer(&self, table: &str, id: &str, declared: &str) -> Result<bool, RealtimeError> {
        let Some(local) = self.store.get(table, id).await? else {
            return Ok(false);
        };
        Ok(local.updated_at().is_some_and(|ours| {
            compare_values(
                &Value::String(ours.to_string()),
                &Value::String(declared.to_string()),
                Collation::Timestamp,
            ) == Some(Ordering::Greater)
        }))
    }
}

#[async_trait]
impl MessageHandler for ReplicaHandler {
    async fn handle(&self, channel: &ChannelName, message: ChannelMessage) -> Result<(), RealtimeError> {
        let table = self.schema.table(&channel.table)?;
        let id = message.entity_id().map(str::to_string).or_else(|| {
            message
                .payload
                .as_ref()
                .and_then(|row| row.get(PRIMARY_KEY))
                .and_then(render)
        });
        let Some(id) = id else {
            debug!(channel = %channel, "message without entity id ignored");
            return Ok(());
        };

        let document = if message.event == ChannelEvent::Delete {
            LocalDocument::tombstone(&id)
        } else {
            if let Some(declared) = message.updated_at() {
                if self.local_is_newer(&table.name, &id, declared).await? {
                    debug!(channel = %channel, %id, declared, "stale channel message dropped");
                    return Ok(());
                }
            }
            let row = match message.payload {
                Some(row) => Some(row),
                None => self.remote.fetch_by_id(&table.name, &id).await?,
            };
            match row {
                Some(row) => match LocalDocument::from_row(table.to_local(&row)) {
                    Some(document) => document.confirmed(),
                    None => {
                        debug!(channel = %channel, %id, "message row without primary key ignored");
                        return Ok(());
                    }
                },
                // Gone again before the point fetch ran.
                None => LocalDocument::tombstone(&id),
            }
        };
        debug!(channel = %channel, %id, event = ?message.event, "channel message applied");
        self.pulls
            .emit(PullEvent::new(&table.name, PullOrigin::Realtime, document))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_dry_tests::{blog_schema, row, MemoryLocalStore, MemoryRemoteStore};
    use tandem_replication::MasterStates;

    struct Fixture {
        store: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemoteStore>,
        pulls: Arc<PullHub>,
        handler: ReplicaHandler,
    }

    async fn fixture() -> Fixture {
        let schema = blog_schema();
        let store = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new(Arc::clone(&schema)));
        let pulls = Arc::new(PullHub::new());
        let posts = schema.table("posts").unwrap();
        store.create_collection("posts", &posts.collection_shape(0)).await.unwrap();
        let stream = pulls.open("posts");
        let local: Arc<dyn LocalStore> = store.clone();
        tokio::spawn(stream.run(local, Arc::new(MasterStates::new())));
        let handler = ReplicaHandler::new(schema, store.clone(), remote.clone(), Arc::clone(&pulls));
        Fixture {
            store,
            remote,
            pulls,
            handler,
        }
    }

    fn post(title: &str, updated_at: &str) -> LocalDocument {
        LocalDocument::new(
            "p1",
            row(json!({"authorId": "u1", "title": title, "updatedAt": updated_at})),
        )
    }

    #[tokio::test]
    async fn inline_rows_are_applied_as_confirmed() {
        let f = fixture().await;
        let channel = ChannelName::entity("posts", "p1");
        let message = ChannelMessage::new(ChannelEvent::Update, "p1")
            .with_updated_at("2024-01-02T00:00:00Z")
            .with_payload(row(
                json!({"id": "p1", "author_id": "u1", "title": "server", "updated_at": "2024-01-02T00:00:00Z"}),
            ));
        f.handler.handle(&channel, message).await.unwrap();
        f.pulls.flush("posts").await.unwrap();
        let doc = f.store.document("posts", "p1").unwrap();
        assert_eq!(doc.get("title"), Some(&json!("server")));
        assert!(!doc.is_pending);
        assert_eq!(f.remote.lookup_count(), 0);
    }

    #[tokio::test]
    async fn header_only_messages_fall_back_to_a_point_fetch() {
        let f = fixture().await;
        f.remote.seed(
            "posts",
            row(json!({"id": "p1", "author_id": "u1", "title": "fetched", "updated_at": "2024-01-02T00:00:00Z"})),
        );
        let message = ChannelMessage::new(ChannelEvent::Insert, "p1");
        f.handler
            .handle(&ChannelName::new("posts", "author_id", "u1"), message)
            .await
            .unwrap();
        f.pulls.flush("posts").await.unwrap();
        assert_eq!(f.remote.lookup_count(), 1);
        assert_eq!(
            f.store.document("posts", "p1").unwrap().get("title"),
            Some(&json!("fetched"))
        );
    }

    #[tokio::test]
    async fn older_messages_never_regress_local_state() {
        let f = fixture().await;
        f.store
            .upsert("posts", post("mine", "2024-01-03T00:00:00Z").pending())
            .await
            .unwrap();
        let message = ChannelMessage::new(ChannelEvent::Update, "p1").with_updated_at("2024-01-02T00:00:00Z");
        f.handler
            .handle(&ChannelName::entity("posts", "p1"), message)
            .await
            .unwrap();
        f.pulls.flush("posts").await.unwrap();
        assert_eq!(f.remote.lookup_count(), 0);
        assert_eq!(
            f.store.document("posts", "p1").unwrap().get("title"),
            Some(&json!("mine"))
        );
    }

    #[tokio::test]
    async fn deletes_tombstone_the_local_document() {
        let f = fixture().await;
        f.store
            .upsert("posts", post("doomed", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        f.handler
            .handle(
                &ChannelName::entity("posts", "p1"),
                ChannelMessage::new(ChannelEvent::Delete, "p1"),
            )
            .await
            .unwrap();
        f.pulls.flush("posts").await.unwrap();
        let doc = f.store.document("posts", "p1").unwrap();
        assert!(doc.deleted);
        assert_eq!(doc.get("title"), Some(&json!("doomed")));
    }

    #[tokio::test]
    async fn unknown_tables_are_rejected() {
        let f = fixture().await;
        let err = f
            .handler
            .handle(
                &ChannelName::entity("ghosts", "g1"),
                ChannelMessage::new(ChannelEvent::Update, "g1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Schema(_)));
    }
}
