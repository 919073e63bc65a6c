// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The sync-session context object.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tandem_app_core::prefs::SyncPrefs;
use tandem_query::{collect_entities, materialize, QueryCompiler, QueryDescriptor};
use tandem_realtime::ChannelManager;
use tandem_replication::{
    LeaderRelay, MasterStates, PullEvent, PullHub, PullOrigin, PushOutcome, ReconcileReport, StaleReconciler,
    Submission, SyncError,
};
use tandem_schema::{Row, Schema, TableDescriptor, CREATED_AT};
use tandem_store_port::{ChangeRow, LocalDocument, LocalStore, RemoteStore, UPDATED_AT_PROPERTY, VERSION_PROPERTY};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::live::{LiveQuery, Watcher};
use crate::SessionError;

/// What one [`SyncSession::refresh`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Root rows in the logical result window.
    pub fetched: usize,
    /// Entities (roots and nested) pulled into the replica.
    pub pulled: usize,
    /// Stale-entity reconciliation of the same query.
    pub reconciled: ReconcileReport,
}

pub(crate) struct Parts {
    pub(crate) schema: Arc<Schema>,
    pub(crate) prefs: SyncPrefs,
    pub(crate) compiler: QueryCompiler,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) pulls: Arc<PullHub>,
    pub(crate) masters: Arc<MasterStates>,
    pub(crate) relay: Arc<LeaderRelay>,
    pub(crate) reconciler: Arc<StaleReconciler>,
    pub(crate) channels: Option<ChannelManager>,
}

/// Pushes the replica's pending documents.
///
/// Holds the write side of the session's write gate for the whole scan, so a
/// concurrent mutation is pushed either before the scan or after it, never
/// alongside a stale copy of itself.
#[derive(Clone)]
struct Outbox {
    schema: Arc<Schema>,
    store: Arc<dyn LocalStore>,
    masters: Arc<MasterStates>,
    relay: Arc<LeaderRelay>,
    gate: Arc<RwLock<()>>,
}

impl Outbox {
    async fn drain(&self) -> Result<Vec<PushOutcome>, SessionError> {
        let _gate = self.gate.write().await;
        let mut outcomes = Vec::new();
        for table in self.schema.tables() {
            let rows: Vec<ChangeRow> = self
                .store
                .all(&table.name)
                .await?
                .into_iter()
                .filter(|doc| doc.is_pending)
                .map(|doc| ChangeRow {
                    assumed_master_state: self.masters.get(&table.name, &doc.id).or_else(|| version_base(&doc)),
                    new_document: doc,
                })
                .collect();
            if rows.is_empty() {
                continue;
            }
            info!(table = %table.name, rows = rows.len(), "pushing pending writes");
            if let Submission::Pushed(pushed) = self.relay.submit(&table.name, rows).await? {
                outcomes.extend(pushed);
            }
        }
        Ok(outcomes)
    }
}

/// One replica's sync state and the operations on it.
pub struct SyncSession {
    parts: Parts,
    outbox: Outbox,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("prefs", &self.parts.prefs)
            .field("started", &self.is_started())
            .field("leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

impl SyncSession {
    pub(crate) fn from_parts(parts: Parts) -> Self {
        let outbox = Outbox {
            schema: Arc::clone(&parts.schema),
            store: Arc::clone(&parts.store),
            masters: Arc::clone(&parts.masters),
            relay: Arc::clone(&parts.relay),
            gate: Arc::new(RwLock::new(())),
        };
        Self {
            parts,
            outbox,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Schema the session was opened with.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.parts.schema
    }

    /// Effective preferences.
    pub fn prefs(&self) -> &SyncPrefs {
        &self.parts.prefs
    }

    /// The local replica.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.parts.store
    }

    /// Last confirmed server state per document.
    pub fn masters(&self) -> &Arc<MasterStates> {
        &self.parts.masters
    }

    /// Realtime channels, when the session has a pub/sub transport.
    pub fn channels(&self) -> Option<&ChannelManager> {
        self.parts.channels.as_ref()
    }

    /// Whether this replica owns the remote connection.
    pub fn is_leader(&self) -> bool {
        self.parts.relay.is_leader()
    }

    /// Whether replication is running.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Open one pull stream per table, start the leader relay and push every
    /// write left pending while replication was stopped. Calling it again
    /// does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for table in self.parts.schema.table_names() {
            let stream = self.parts.pulls.open(table);
            tasks.push(tokio::spawn(
                stream.run(Arc::clone(&self.parts.store), Arc::clone(&self.parts.masters)),
            ));
        }
        tasks.extend(self.parts.relay.spawn());
        let outbox = self.outbox.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = outbox.drain().await {
                warn!(?err, "pushing pending writes failed");
            }
        }));
        info!(streams = self.parts.pulls_open(), "replication started");
    }

    /// Push every pending document of every table, e.g. after a transport
    /// failure left writes behind.
    ///
    /// Returns the outcomes of rows pushed here; forwarded rows and a stopped
    /// session yield none.
    pub async fn push_pending(&self) -> Result<Vec<PushOutcome>, SessionError> {
        if !self.is_started() {
            debug!("replication stopped; writes stay pending");
            return Ok(Vec::new());
        }
        self.outbox.drain().await
    }

    /// Run `descriptor` against the local replica.
    pub async fn query(&self, descriptor: &QueryDescriptor) -> Result<Vec<Row>, SessionError> {
        let plan = self.parts.compiler.compile_local(descriptor)?;
        let rows = self.parts.store.query(&plan).await?;
        Ok(materialize(&rows, &plan))
    }

    /// Fetch `descriptor` from the remote store, pull every returned entity
    /// into the replica and reconcile local rows the fetch no longer returns.
    ///
    /// Fails with [`SyncError::PullClosed`] while replication is stopped.
    #[instrument(skip_all, fields(table = %descriptor.table))]
    pub async fn refresh(&self, descriptor: &QueryDescriptor) -> Result<RefreshReport, SessionError> {
        if !self.is_started() {
            return Err(SyncError::PullClosed(descriptor.table.clone()).into());
        }
        let plan = self.parts.compiler.compile_local(descriptor)?;
        let request = self.parts.compiler.compile_remote(descriptor)?;
        let before = materialize(&self.parts.store.query(&plan).await?, &plan);

        let rows = self.parts.remote.fetch_request(&request).await?;

        let schema = &self.parts.schema;
        let mut entities = Vec::new();
        let mut fresh = Vec::with_capacity(rows.len());
        for row in &rows {
            request.root.split_entities(schema, row, &mut entities)?;
            fresh.push(request.root.to_local(schema, row)?);
        }
        let pulled = entities.len();
        for (table, doc) in entities {
            if let Some(document) = LocalDocument::from_row(doc) {
                self.parts
                    .pulls
                    .emit(PullEvent::new(&table, PullOrigin::Fetch, document.confirmed()))?;
            }
        }
        let tables = request.root.tables();
        self.flush(&tables).await?;

        let reconciled = self
            .parts
            .reconciler
            .reconcile_results(&collect_entities(&before, &plan), &collect_entities(&fresh, &plan))
            .await?;
        self.flush(&tables).await?;
        debug!(fetched = rows.len(), pulled, "refresh complete");
        Ok(RefreshReport {
            fetched: rows.len(),
            pulled,
            reconciled,
        })
    }

    /// Keep `descriptor`'s local result current.
    ///
    /// The returned handle re-materializes on every local change to a table
    /// the query reads and, on the leader, keeps the derived realtime channel
    /// set attached.
    pub async fn live(&self, descriptor: &QueryDescriptor) -> Result<LiveQuery, SessionError> {
        let watcher = Watcher {
            schema: Arc::clone(&self.parts.schema),
            store: Arc::clone(&self.parts.store),
            plan: self.parts.compiler.compile_local(descriptor)?,
            root: self.parts.compiler.normalize(descriptor)?,
            channels: self.parts.channels.clone(),
            relay: Arc::clone(&self.parts.relay),
        };
        LiveQuery::start(watcher).await
    }

    /// Insert `document` optimistically and push it.
    ///
    /// Returns the push outcome, or `None` when replication is stopped or the
    /// write was forwarded to the leader.
    pub async fn insert(&self, table: &str, document: LocalDocument) -> Result<Option<PushOutcome>, SessionError> {
        let descriptor = self.parts.schema.table(table)?;
        if let Some(existing) = self.parts.store.get(table, &document.id).await? {
            if !existing.deleted {
                return Err(SessionError::Exists {
                    table: table.to_string(),
                    id: document.id,
                });
            }
        }
        let mut document = document;
        let now = now();
        if descriptor.has_created_at() {
            let created = descriptor.property_of(CREATED_AT);
            document.fields.entry(created).or_insert_with(|| Value::String(now.clone()));
        }
        stamp(descriptor, &mut document, now);
        let document = LocalDocument {
            deleted: false,
            ..document.pending()
        };
        self.write(table, document, None).await
    }

    /// Apply `patch` (local property names) to a document and push the change.
    pub async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Option<PushOutcome>, SessionError> {
        let descriptor = self.parts.schema.table(table)?;
        let current = self.live_document(table, id).await?;
        let mut next = current.clone();
        next.fields.extend(patch);
        stamp(descriptor, &mut next, now());
        let master = (!current.is_pending).then_some(current);
        self.write(table, next.pending(), master).await
    }

    /// Tombstone a document and push the delete.
    pub async fn delete(&self, table: &str, id: &str) -> Result<Option<PushOutcome>, SessionError> {
        self.parts.schema.table(table)?;
        let current = self.live_document(table, id).await?;
        let master = (!current.is_pending).then(|| current.clone());
        let tombstone = LocalDocument {
            deleted: true,
            ..current.pending()
        };
        self.write(table, tombstone, master).await
    }

    /// Detach every channel and stop replication. Calling it again does nothing.
    pub async fn close(&self) {
        if let Some(channels) = &self.parts.channels {
            channels.close().await;
        }
        self.stop();
        info!("sync session closed");
    }

    fn stop(&self) {
        self.parts.pulls.close_all();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.started.store(false, Ordering::SeqCst);
    }

    async fn live_document(&self, table: &str, id: &str) -> Result<LocalDocument, SessionError> {
        self.parts
            .store
            .get(table, id)
            .await?
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| SessionError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })
    }

    async fn write(
        &self,
        table: &str,
        document: LocalDocument,
        fallback_master: Option<LocalDocument>,
    ) -> Result<Option<PushOutcome>, SessionError> {
        let _gate = self.outbox.gate.read().await;
        self.parts.store.upsert(table, document.clone()).await?;
        if !self.is_started() {
            debug!(%table, id = %document.id, "replication stopped; write stays pending");
            return Ok(None);
        }
        let row = ChangeRow {
            assumed_master_state: self.parts.masters.get(table, &document.id).or(fallback_master),
            new_document: document,
        };
        match self.parts.relay.submit(table, vec![row]).await? {
            Submission::Pushed(mut outcomes) => Ok(outcomes.pop()),
            Submission::Forwarded => Ok(None),
        }
    }

    async fn flush(&self, tables: &[&str]) -> Result<(), SessionError> {
        for table in tables {
            self.parts.pulls.flush(table).await?;
        }
        Ok(())
    }
}

impl Parts {
    fn pulls_open(&self) -> usize {
        self.schema.table_names().filter(|t| self.pulls.is_open(t)).count()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Master stand-in for a pending document nobody recorded a master for: its
/// version token alone, so the push is an update guarded on that version.
fn version_base(document: &LocalDocument) -> Option<LocalDocument> {
    let version = document.get(VERSION_PROPERTY).filter(|v| !v.is_null())?;
    let mut fields = Row::new();
    fields.insert(VERSION_PROPERTY.to_string(), version.clone());
    Some(LocalDocument::new(document.id.clone(), fields))
}

fn stamp(table: &TableDescriptor, document: &mut LocalDocument, now: String) {
    if table.has_updated_at() {
        document.fields.insert(UPDATED_AT_PROPERTY.to_string(), Value::String(now));
    }
}
