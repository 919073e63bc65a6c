// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Channel manager reference counting, debounce and delivery.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tandem_dry_tests::{blog_schema, row, MemoryLocalStore, MemoryPubSub, MemoryRemoteStore};
use tandem_realtime::{ChannelManager, ChannelName, MessageHandler, RealtimeError, ReplicaHandler};
use tandem_replication::{MasterStates, PullHub};
use tandem_store_port::{ChannelEvent, ChannelMessage, LocalDocument, LocalStore, PubSub};
use tokio::sync::mpsc;

const DELAY: Duration = Duration::from_millis(3000);

struct Recorder(mpsc::UnboundedSender<(String, Option<String>)>);

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, channel: &ChannelName, message: ChannelMessage) -> Result<(), RealtimeError> {
        let _ = self
            .0
            .send((channel.to_string(), message.entity_id().map(str::to_string)));
        Ok(())
    }
}

fn manager(pubsub: &MemoryPubSub) -> (ChannelManager, mpsc::UnboundedReceiver<(String, Option<String>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = ChannelManager::new(Arc::new(pubsub.clone()), Arc::new(Recorder(tx)), DELAY);
    (manager, rx)
}

#[tokio::test(start_paused = true)]
async fn resubscribing_inside_the_window_keeps_the_channel_warm() {
    let pubsub = MemoryPubSub::new();
    let (manager, _rx) = manager(&pubsub);
    let name = ChannelName::entity("posts", "p1");

    let first = manager.subscribe([name.clone()]).await.unwrap();
    let second = manager.subscribe([name.clone()]).await.unwrap();
    let third = manager.subscribe([name.clone()]).await.unwrap();
    assert_eq!(pubsub.subscribe_count(), 1);
    assert_eq!(manager.ref_count(&name), 3);

    first.unsubscribe();
    second.unsubscribe();
    second.unsubscribe();
    assert_eq!(manager.ref_count(&name), 1);
    tokio::time::sleep(DELAY * 2).await;
    assert!(manager.is_attached(&name));

    third.unsubscribe();
    assert!(manager.is_detach_pending(&name));
    tokio::time::sleep(DELAY / 2).await;
    let fourth = manager.subscribe([name.clone()]).await.unwrap();
    assert!(!manager.is_detach_pending(&name));

    tokio::time::sleep(DELAY * 2).await;
    assert!(manager.is_attached(&name));
    assert_eq!(pubsub.subscribe_count(), 1);
    assert_eq!(pubsub.unsubscribe_count(), 0);

    drop(fourth);
    tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
    tokio::task::yield_now().await;
    assert!(!manager.is_attached(&name));
    assert!(manager.channels().is_empty());
    assert_eq!(pubsub.unsubscribe_count(), 1);
    assert!(!pubsub.is_active("posts:id:p1"));
}

#[tokio::test(start_paused = true)]
async fn failed_attaches_release_their_references() {
    let pubsub = MemoryPubSub::new();
    let (manager, _rx) = manager(&pubsub);
    pubsub.set_unavailable(true);

    let err = manager
        .subscribe([ChannelName::entity("posts", "p1")])
        .await
        .unwrap_err();
    assert!(matches!(err, RealtimeError::Transport(_)));
    assert_eq!(manager.ref_count(&ChannelName::entity("posts", "p1")), 0);

    tokio::time::sleep(DELAY * 2).await;
    assert!(manager.channels().is_empty());
}

#[tokio::test]
async fn messages_reach_the_handler_once_per_attached_channel() {
    let pubsub = MemoryPubSub::new();
    let (manager, mut rx) = manager(&pubsub);
    let names = [
        ChannelName::entity("posts", "p1"),
        ChannelName::new("comments", "post_id", "p1"),
        ChannelName::entity("posts", "p1"),
    ];
    let subscription = manager.subscribe(names).await.unwrap();
    assert_eq!(subscription.channels().len(), 2);
    assert_eq!(pubsub.active_channels(), ["comments:post_id:p1", "posts:id:p1"]);

    pubsub
        .publish("comments:post_id:p1", ChannelMessage::new(ChannelEvent::Insert, "c9"))
        .await
        .unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        ("comments:post_id:p1".to_string(), Some("c9".to_string()))
    );

    manager.close().await;
    assert!(pubsub.active_channels().is_empty());
    subscription.unsubscribe();
    assert!(manager.channels().is_empty());
}

#[tokio::test]
async fn server_writes_flow_into_the_local_replica() -> anyhow::Result<()> {
    let schema = blog_schema();
    let pubsub = MemoryPubSub::new();
    let remote = Arc::new(MemoryRemoteStore::new(Arc::clone(&schema)).with_pubsub(pubsub.clone()));
    remote.seed(
        "posts",
        row(json!({"id": "p1", "author_id": "u1", "title": "v1", "updated_at": "2024-01-01T00:00:00Z", "version": 1})),
    );
    let store = Arc::new(MemoryLocalStore::new());
    let posts = schema.table("posts")?;
    store.create_collection("posts", &posts.collection_shape(0)).await?;
    store
        .upsert(
            "posts",
            LocalDocument::new(
                "p1",
                row(json!({"authorId": "u1", "title": "v1", "updatedAt": "2024-01-01T00:00:00Z", "version": 1})),
            ),
        )
        .await?;

    let pulls = Arc::new(PullHub::new());
    let local: Arc<dyn LocalStore> = store.clone();
    tokio::spawn(pulls.open("posts").run(Arc::clone(&local), Arc::new(MasterStates::new())));
    let handler = ReplicaHandler::new(Arc::clone(&schema), local, remote.clone(), Arc::clone(&pulls));
    let manager = ChannelManager::new(Arc::new(pubsub.clone()), Arc::new(handler), DELAY);
    let _subscription = manager.subscribe([ChannelName::entity("posts", "p1")]).await?;

    remote
        .server_update(
            "posts",
            "p1",
            row(json!({"title": "v2", "updated_at": "2024-01-02T00:00:00Z"})),
        )
        .await;
    let updated = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            pulls.flush("posts").await.unwrap();
            let doc = store.document("posts", "p1").unwrap();
            if doc.get("title") == Some(&json!("v2")) {
                return doc;
            }
            tokio::task::yield_now().await;
        }
    })
    .await?;
    assert_eq!(updated.get("version"), Some(&json!(2)));

    remote.server_delete("posts", "p1").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !store.document("posts", "p1").unwrap().deleted {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    Ok(())
}
