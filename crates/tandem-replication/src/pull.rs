// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pull streams: ordered, per-table injection of authoritative documents.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tandem_query::{compare_values, Collation};
use tandem_store_port::{LocalDocument, LocalStore, StoreError, UPDATED_AT_PROPERTY};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::SyncError;

const TAP_CAPACITY: usize = 1024;

/// Where a pulled document came from; drives the staleness gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOrigin {
    /// Remote response to one of our pushes. `pushed_at` is the update
    /// timestamp of the state that was pushed.
    Confirmed {
        /// Update timestamp of the pushed state, when the table tracks one.
        pushed_at: Option<String>,
    },
    /// Server state fetched after a rejected write. Always applied.
    Conflict,
    /// Query refresh or stale-entity reconciliation.
    Fetch,
    /// Realtime channel message.
    Realtime,
    /// Forwarded by the leader replica.
    Relay,
}

/// One document to inject into the local replica.
#[derive(Debug, Clone, PartialEq)]
pub struct PullEvent {
    /// Target table.
    pub table: String,
    /// Origin.
    pub origin: PullOrigin,
    /// Authoritative state (a tombstone for remote deletes).
    pub document: LocalDocument,
}

impl PullEvent {
    /// Build an event.
    pub fn new(table: &str, origin: PullOrigin, document: LocalDocument) -> Self {
        Self {
            table: table.to_string(),
            origin,
            document,
        }
    }
}

/// What the staleness gate did with a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// Written to the replica.
    Applied,
    /// Dropped: the local copy is fresher.
    Stale,
}

enum PullCommand {
    Apply(PullEvent),
    Barrier(oneshot::Sender<()>),
}

/// Server state each local document is based on.
///
/// Pulls the replica adopted update it (tombstones clear it), as do
/// confirmations and conflict resolutions of this replica's own pushes. A
/// fetched or realtime state the staleness gate drops does not: the pending
/// local edit is still based on the older state, and a push guarded on it
/// must surface the concurrent server write as a conflict.
#[derive(Debug, Default)]
pub struct MasterStates {
    states: Mutex<HashMap<(String, String), LocalDocument>>,
}

impl MasterStates {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last confirmed state of `table`/`id`.
    pub fn get(&self, table: &str, id: &str) -> Option<LocalDocument> {
        self.lock().get(&(table.to_string(), id.to_string())).cloned()
    }

    /// Record a pulled document.
    pub fn record(&self, table: &str, document: &LocalDocument) {
        let key = (table.to_string(), document.id.clone());
        let mut states = self.lock();
        if document.deleted {
            states.remove(&key);
        } else {
            states.insert(key, document.clone().confirmed());
        }
    }

    /// Forget every state (replica reset).
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), LocalDocument>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of per-table pull streams owned by one session.
#[derive(Debug)]
pub struct PullHub {
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<PullCommand>>>,
    tap: broadcast::Sender<PullEvent>,
}

impl std::fmt::Debug for PullCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply(event) => f.debug_tuple("Apply").field(event).finish(),
            Self::Barrier(_) => f.write_str("Barrier"),
        }
    }
}

impl Default for PullHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PullHub {
    /// Create a hub with no open streams.
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            channels: Mutex::new(HashMap::new()),
            tap,
        }
    }

    /// Open (or reopen) the stream for `table`. A reopened stream replaces
    /// the previous one, whose consumer then drains and stops.
    pub fn open(&self, table: &str) -> PullStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_string(), tx);
        PullStream {
            table: table.to_string(),
            rx,
        }
    }

    /// Whether a stream for `table` is open.
    pub fn is_open(&self, table: &str) -> bool {
        self.sender(table).is_some_and(|tx| !tx.is_closed())
    }

    /// Close every stream; consumers drain what was queued and stop.
    pub fn close_all(&self) {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Queue one document on its table's stream.
    pub fn emit(&self, event: PullEvent) -> Result<(), SyncError> {
        let table = event.table.clone();
        let tx = self.sender(&table).ok_or_else(|| SyncError::PullClosed(table.clone()))?;
        if self.tap.receiver_count() > 0 {
            let _ = self.tap.send(event.clone());
        }
        tx.send(PullCommand::Apply(event))
            .map_err(|_| SyncError::PullClosed(table))
    }

    /// Wait until everything queued on `table` so far has been applied.
    pub async fn flush(&self, table: &str) -> Result<(), SyncError> {
        let tx = self
            .sender(table)
            .ok_or_else(|| SyncError::PullClosed(table.to_string()))?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(PullCommand::Barrier(done_tx))
            .map_err(|_| SyncError::PullClosed(table.to_string()))?;
        done_rx
            .await
            .map_err(|_| SyncError::PullClosed(table.to_string()))
    }

    /// Observe every emitted event (the leader relay fans these out).
    pub fn tap(&self) -> broadcast::Receiver<PullEvent> {
        self.tap.subscribe()
    }

    fn sender(&self, table: &str) -> Option<mpsc::UnboundedSender<PullCommand>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .cloned()
    }
}

/// Receiving end of one table's pull stream.
#[derive(Debug)]
pub struct PullStream {
    table: String,
    rx: mpsc::UnboundedReceiver<PullCommand>,
}

impl PullStream {
    /// Table this stream feeds.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Apply queued documents in order until the stream is closed.
    ///
    /// Store failures are logged and skipped so one bad document does not
    /// stall the stream.
    pub async fn run(mut self, store: Arc<dyn LocalStore>, masters: Arc<MasterStates>) {
        while let Some(command) = self.rx.recv().await {
            match command {
                PullCommand::Apply(event) => match apply_pull(store.as_ref(), &event).await {
                    Ok(decision) => {
                        let own_push = matches!(event.origin, PullOrigin::Confirmed { .. } | PullOrigin::Conflict);
                        if decision.applied() || own_push {
                            masters.record(&event.table, &event.document);
                        }
                    }
                    Err(err) => warn!(?err, table = %event.table, id = %event.document.id, "pull apply failed"),
                },
                PullCommand::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(table = %self.table, "pull stream closed");
    }
}

fn local_is_newer(local: &LocalDocument, incoming: &LocalDocument) -> Option<bool> {
    let (Some(local_ts), Some(incoming_ts)) = (
        local.get(UPDATED_AT_PROPERTY).filter(|v| !v.is_null()),
        incoming.get(UPDATED_AT_PROPERTY).filter(|v| !v.is_null()),
    ) else {
        return None;
    };
    Some(compare_values(local_ts, incoming_ts, Collation::Timestamp) == Some(Ordering::Greater))
}

fn is_stale(origin: &PullOrigin, local: &LocalDocument, incoming: &LocalDocument) -> bool {
    match origin {
        PullOrigin::Conflict => false,
        PullOrigin::Confirmed { pushed_at } => {
            // A later local write superseded the pushed state.
            local.is_pending
                && pushed_at.is_some()
                && local.updated_at() != pushed_at.as_deref()
                && local_is_newer(local, incoming).unwrap_or(true)
        }
        // The leader only relays what passed its own gate.
        PullOrigin::Relay => local_is_newer(local, incoming).unwrap_or(false),
        PullOrigin::Fetch | PullOrigin::Realtime => local_is_newer(local, incoming).unwrap_or(local.is_pending),
    }
}

/// Apply one pulled document through the staleness gate.
///
/// Tombstones keep the local fields and only flip the deleted flag. Applied
/// documents are never pending.
pub async fn apply_pull(store: &dyn LocalStore, event: &PullEvent) -> Result<PullDecision, StoreError> {
    let incoming = &event.document;
    let local = store.get(&event.table, &incoming.id).await?;
    if let Some(local) = &local {
        if is_stale(&event.origin, local, incoming) {
            debug!(table = %event.table, id = %incoming.id, origin = ?event.origin, "dropping stale pull");
            return Ok(PullDecision::Stale);
        }
    }
    let document = match (incoming.deleted, local) {
        (true, Some(local)) => LocalDocument {
            deleted: true,
            is_pending: false,
            ..local
        },
        _ => incoming.clone().confirmed(),
    };
    store.upsert(&event.table, document).await?;
    Ok(PullDecision::Applied)
}

impl PullDecision {
    /// Whether the document reached the replica.
    pub fn applied(self) -> bool {
        self == Self::Applied
    }
}
