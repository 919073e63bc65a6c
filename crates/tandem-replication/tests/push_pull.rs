// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! End-to-end push/pull behaviour against the in-memory stores.
#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tandem_dry_tests::{blog_schema, leader_pair, row, MemoryLocalStore, MemoryRemoteStore};
use tandem_replication::{
    LeaderRelay, MasterStates, PullEvent, PullHub, PullOrigin, PushErrorReport, PushOperation, PushOutcome, ReplicationEngine,
    StaleReconciler, Submission, SyncError,
};
use tandem_store_port::{ChangeRow, LeaderChannel, LocalDocument, LocalStore, RemoteStore};

struct Replica {
    store: Arc<MemoryLocalStore>,
    pulls: Arc<PullHub>,
    masters: Arc<MasterStates>,
    engine: Arc<ReplicationEngine>,
}

async fn replica(remote: &Arc<MemoryRemoteStore>) -> Replica {
    let schema = blog_schema();
    let store = Arc::new(MemoryLocalStore::new());
    let pulls = Arc::new(PullHub::new());
    let masters = Arc::new(MasterStates::new());
    for table in schema.tables() {
        store
            .create_collection(&table.name, &table.collection_shape(0))
            .await
            .unwrap();
        let stream = pulls.open(&table.name);
        let local: Arc<dyn LocalStore> = store.clone();
        tokio::spawn(stream.run(local, Arc::clone(&masters)));
    }
    let remote: Arc<dyn RemoteStore> = remote.clone();
    let engine = Arc::new(ReplicationEngine::new(schema, remote, Arc::clone(&pulls)));
    Replica {
        store,
        pulls,
        masters,
        engine,
    }
}

fn post(id: &str, title: &str, updated_at: &str) -> LocalDocument {
    LocalDocument::new(
        id,
        row(json!({"authorId": "u1", "title": title, "updatedAt": updated_at})),
    )
}

fn insert(document: LocalDocument) -> ChangeRow {
    ChangeRow {
        new_document: document,
        assumed_master_state: None,
    }
}

#[tokio::test]
async fn insert_is_confirmed_by_the_pull_stream() -> anyhow::Result<()> {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    let replica = replica(&remote).await;
    let local = post("p1", "hello", "2024-01-01T00:00:00Z").pending();
    replica.store.upsert("posts", local.clone()).await?;

    let outcomes = replica.engine.push("posts", vec![insert(local)]).await?;
    assert!(matches!(outcomes.as_slice(), [PushOutcome::Confirmed(_)]));

    let stored = remote.row("posts", "p1").unwrap();
    assert_eq!(stored["title"], json!("hello"));
    assert_eq!(stored["version"], json!(1));

    let confirmed = replica.store.document("posts", "p1").unwrap();
    assert!(!confirmed.is_pending);
    assert_eq!(confirmed.get("version"), Some(&json!(1)));
    assert!(replica.masters.get("posts", "p1").is_some());
    Ok(())
}

#[tokio::test]
async fn concurrent_server_write_wins_and_is_pulled_back() -> anyhow::Result<()> {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    remote.seed(
        "posts",
        row(json!({"id": "p1", "author_id": "u1", "title": "base", "updated_at": "2024-01-01T00:00:00Z", "version": 1})),
    );
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let replica = replica(&remote).await;
    let engine = ReplicationEngine::new(blog_schema(), remote.clone(), Arc::clone(&replica.pulls))
        .with_error_callback(Arc::new(move |report: &PushErrorReport| {
            sink.lock().unwrap().push((report.operation, report.error.code.clone()));
        }));

    let master = LocalDocument::new(
        "p1",
        row(json!({"authorId": "u1", "title": "base", "updatedAt": "2024-01-01T00:00:00Z", "version": 1})),
    );
    remote
        .server_update(
            "posts",
            "p1",
            row(json!({"title": "theirs", "updated_at": "2024-01-02T00:00:00Z"})),
        )
        .await
        .unwrap();

    let mut mine = master.clone();
    mine.fields.insert("title".into(), json!("mine"));
    mine.fields.insert("updatedAt".into(), json!("2024-01-03T00:00:00Z"));
    let mine = mine.pending();
    replica.store.upsert("posts", mine.clone()).await?;

    let outcomes = engine
        .push(
            "posts",
            vec![ChangeRow {
                new_document: mine,
                assumed_master_state: Some(master),
            }],
        )
        .await?;
    let [PushOutcome::Conflicted { master }] = outcomes.as_slice() else {
        panic!("expected a conflict, got {outcomes:?}");
    };
    assert_eq!(master.get("title"), Some(&json!("theirs")));

    let local = replica.store.document("posts", "p1").unwrap();
    assert_eq!(local.get("title"), Some(&json!("theirs")));
    assert!(!local.is_pending);
    assert_eq!(remote.row("posts", "p1").unwrap()["version"], json!(2));
    assert_eq!(
        reports.lock().unwrap().as_slice(),
        &[(PushOperation::Update, Some("409".to_string()))]
    );
    Ok(())
}

#[tokio::test]
async fn transport_failure_is_reported_and_leaves_the_write_pending() {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    remote.set_offline(true);
    let reports = Arc::new(Mutex::new(0_usize));
    let sink = Arc::clone(&reports);
    let replica = replica(&remote).await;
    let engine = ReplicationEngine::new(blog_schema(), remote.clone(), Arc::clone(&replica.pulls))
        .with_error_callback(Arc::new(move |_: &PushErrorReport| {
            *sink.lock().unwrap() += 1;
        }));

    let local = post("p1", "hello", "2024-01-01T00:00:00Z").pending();
    replica.store.upsert("posts", local.clone()).await.unwrap();
    let err = engine.push("posts", vec![insert(local)]).await.unwrap_err();

    assert!(matches!(err, SyncError::Transport(_)));
    assert_eq!(*reports.lock().unwrap(), 1);
    assert!(replica.store.document("posts", "p1").unwrap().is_pending);
    assert!(remote.is_empty("posts"));
}

#[tokio::test]
async fn later_writes_diff_against_the_confirmed_state() -> anyhow::Result<()> {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    let replica = replica(&remote).await;
    let first = post("p1", "draft", "2024-01-01T00:00:00Z").pending();
    let mut second = first.clone();
    second.fields.insert("title".into(), json!("final"));
    second.fields.insert("updatedAt".into(), json!("2024-01-02T00:00:00Z"));

    // Both rows were produced before the insert landed; the second still
    // claims no master state.
    let outcomes = replica
        .engine
        .push("posts", vec![insert(first), insert(second)])
        .await?;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(remote.insert_count(), 1);
    assert_eq!(remote.update_count(), 1);
    assert_eq!(remote.row("posts", "p1").unwrap()["title"], json!("final"));
    assert!(matches!(outcomes[1], PushOutcome::Confirmed(_)));
    Ok(())
}

#[tokio::test]
async fn a_dropped_fetch_does_not_hide_a_concurrent_server_edit() -> anyhow::Result<()> {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    remote.seed(
        "posts",
        row(json!({"id": "p1", "author_id": "u1", "title": "base", "updated_at": "2024-01-01T00:00:00Z", "version": 1})),
    );
    let replica = replica(&remote).await;
    let base = LocalDocument::new(
        "p1",
        row(json!({"authorId": "u1", "title": "base", "updatedAt": "2024-01-01T00:00:00Z", "version": 1})),
    );
    let mut mine = base.clone();
    mine.fields.insert("authorId".into(), json!("u2"));
    mine.fields.insert("updatedAt".into(), json!("2024-01-03T00:00:00Z"));
    let mine = mine.pending();
    replica.store.upsert("posts", mine.clone()).await?;

    let theirs = remote
        .server_update(
            "posts",
            "p1",
            row(json!({"title": "theirs", "updated_at": "2024-01-02T00:00:00Z"})),
        )
        .await
        .unwrap();
    let fetched = LocalDocument::from_row(blog_schema().table("posts")?.to_local(&theirs)).unwrap();
    replica
        .pulls
        .emit(PullEvent::new("posts", PullOrigin::Fetch, fetched))?;
    replica.pulls.flush("posts").await?;
    assert!(replica.store.document("posts", "p1").unwrap().is_pending);
    assert!(replica.masters.get("posts", "p1").is_none());

    let outcomes = replica
        .engine
        .push(
            "posts",
            vec![ChangeRow {
                new_document: mine,
                assumed_master_state: Some(base),
            }],
        )
        .await?;
    let [PushOutcome::Conflicted { master }] = outcomes.as_slice() else {
        panic!("expected a conflict, got {outcomes:?}");
    };
    assert_eq!(master.get("title"), Some(&json!("theirs")));
    let stored = remote.row("posts", "p1").unwrap();
    assert_eq!(stored["title"], json!("theirs"));
    assert_eq!(stored["author_id"], json!("u1"));
    assert_eq!(stored["version"], json!(2));
    assert_eq!(
        replica.masters.get("posts", "p1").unwrap().get("version"),
        Some(&json!(2))
    );
    Ok(())
}

#[tokio::test]
async fn rows_based_on_our_own_earlier_writes_rebase_instead_of_conflicting() -> anyhow::Result<()> {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    let replica = replica(&remote).await;
    let draft = post("p1", "draft", "2024-01-01T00:00:00Z").pending();
    let first = replica.engine.push("posts", vec![insert(draft.clone())]).await?;
    let [PushOutcome::Confirmed(inserted)] = first.as_slice() else {
        panic!("expected a confirmation, got {first:?}");
    };

    let mut second = draft.clone();
    second.fields.insert("title".into(), json!("second"));
    second.fields.insert("updatedAt".into(), json!("2024-01-02T00:00:00Z"));
    let mut third = second.clone();
    third.fields.insert("score".into(), json!(5));
    third.fields.insert("updatedAt".into(), json!("2024-01-03T00:00:00Z"));
    // Both were produced against the inserted state; the third reaches the
    // engine after the second already moved the server to version 2.
    let based_on_insert = |doc: LocalDocument| ChangeRow {
        new_document: doc,
        assumed_master_state: Some(inserted.clone()),
    };
    let outcomes = replica
        .engine
        .push("posts", vec![based_on_insert(second), based_on_insert(third)])
        .await?;

    assert!(outcomes.iter().all(|o| matches!(o, PushOutcome::Confirmed(_))), "{outcomes:?}");
    let stored = remote.row("posts", "p1").unwrap();
    assert_eq!(stored["title"], json!("second"));
    assert_eq!(stored["score"], json!(5));
    assert_eq!(stored["version"], json!(3));
    Ok(())
}

#[tokio::test]
async fn reconciliation_restores_window_misses_and_tombstones_deletions() -> anyhow::Result<()> {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    remote.seed(
        "posts",
        row(json!({"id": "p1", "author_id": "u1", "title": "kept", "updated_at": "2024-01-02T00:00:00Z", "version": 3})),
    );
    let replica = replica(&remote).await;
    replica
        .store
        .seed("posts", 0, vec![post("p1", "old", "2024-01-01T00:00:00Z"), post("p2", "gone", "2024-01-01T00:00:00Z")]);

    let reconciler = StaleReconciler::new(blog_schema(), remote.clone(), Arc::clone(&replica.pulls));
    let mut report = reconciler
        .reconcile(vec![("posts".into(), "p1".into()), ("posts".into(), "p2".into())])
        .await?;
    replica.pulls.flush("posts").await?;
    report.restored.sort();
    report.deleted.sort();

    assert_eq!(report.restored, vec![("posts".to_string(), "p1".to_string())]);
    assert_eq!(report.deleted, vec![("posts".to_string(), "p2".to_string())]);
    assert_eq!(remote.lookup_count(), 2);
    assert_eq!(reconciler.in_flight_count(), 0);

    assert_eq!(
        replica.store.document("posts", "p1").unwrap().get("title"),
        Some(&json!("kept"))
    );
    assert!(replica.store.document("posts", "p2").unwrap().deleted);
    Ok(())
}

#[tokio::test]
async fn followers_forward_pushes_and_receive_confirmations() {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    let (leader_channel, follower_channel) = leader_pair();
    let leader = replica(&remote).await;
    let follower = replica(&remote).await;

    let leader_relay = Arc::new(LeaderRelay::new(
        Arc::clone(&leader.engine),
        Arc::clone(&leader.pulls),
        Some(leader_channel as Arc<dyn LeaderChannel>),
    ));
    let follower_relay = Arc::new(LeaderRelay::new(
        Arc::clone(&follower.engine),
        Arc::clone(&follower.pulls),
        Some(follower_channel as Arc<dyn LeaderChannel>),
    ));
    assert!(leader_relay.is_leader());
    assert!(!follower_relay.is_leader());
    let _leader_task = leader_relay.spawn().unwrap();
    let _follower_task = follower_relay.spawn().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let local = post("p1", "from follower", "2024-01-01T00:00:00Z").pending();
    follower.store.upsert("posts", local.clone()).await.unwrap();
    let submitted = follower_relay.submit("posts", vec![insert(local)]).await.unwrap();
    assert_eq!(submitted, Submission::Forwarded);

    let confirmed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(doc) = follower.store.document("posts", "p1").filter(|d| !d.is_pending) {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(confirmed.get("version"), Some(&json!(1)));
    assert_eq!(remote.insert_count(), 1);
    assert!(!leader.store.document("posts", "p1").unwrap().is_pending);
}

#[tokio::test]
async fn standalone_replicas_push_directly() {
    let remote = Arc::new(MemoryRemoteStore::new(blog_schema()));
    let standalone = replica(&remote).await;
    let relay = Arc::new(LeaderRelay::new(standalone.engine, standalone.pulls, None));
    assert!(relay.is_leader());
    assert!(relay.spawn().is_none());

    let local = post("p1", "solo", "2024-01-01T00:00:00Z").pending();
    standalone.store.upsert("posts", local.clone()).await.unwrap();
    let submitted = relay.submit("posts", vec![insert(local)]).await.unwrap();
    assert!(matches!(submitted, Submission::Pushed(ref outcomes) if outcomes.len() == 1));
    assert_eq!(remote.len("posts"), 1);
}
