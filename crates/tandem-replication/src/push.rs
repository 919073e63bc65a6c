// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Push pipeline: change rows → guarded remote writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tandem_schema::{Schema, TableDescriptor};
use tandem_store_port::{
    ChangeRow, LocalDocument, RemoteError, RemoteStore, VersionGuard, UPDATED_AT_PROPERTY, VERSION_PROPERTY,
};
use tracing::{debug, instrument, warn};

use crate::locks::DocumentLocks;
use crate::pull::{PullEvent, PullHub, PullOrigin};
use crate::{PushErrorCallback, PushErrorReport, PushOperation, SyncError};

/// Result of pushing one change row.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The remote accepted the write; this is the confirmed state.
    Confirmed(LocalDocument),
    /// The remote rejected the write; the server state (a tombstone if the
    /// row is gone) replaced the optimistic one.
    Conflicted {
        /// Authoritative server state.
        master: LocalDocument,
    },
    /// Nothing differed from the master state; the pending flag was cleared.
    Unchanged,
}

/// Identity of the master state a change row was based on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Base {
    /// No master state: the row is an insert.
    Absent,
    /// The guard the master state yields (`None` for untracked tables).
    Guarded(Option<VersionGuard>),
}

impl Base {
    fn of(table: &TableDescriptor, master: Option<&LocalDocument>) -> Self {
        master.map_or(Self::Absent, |master| Self::Guarded(version_guard(table, master)))
    }
}

/// The latest write this engine got confirmed for one document, with every
/// base along the chain of its own confirmed writes that led to it.
#[derive(Debug)]
struct Settled {
    bases: Vec<Base>,
    confirmed: LocalDocument,
}

type SettledMap = HashMap<(String, String), Settled>;

/// Pushes change rows for every table of one schema.
pub struct ReplicationEngine {
    schema: Arc<Schema>,
    remote: Arc<dyn RemoteStore>,
    pulls: Arc<PullHub>,
    settled: Mutex<SettledMap>,
    locks: DocumentLocks,
    on_error: Option<PushErrorCallback>,
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("locks", &self.locks)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

impl ReplicationEngine {
    /// Create an engine writing confirmations into `pulls`.
    pub fn new(schema: Arc<Schema>, remote: Arc<dyn RemoteStore>, pulls: Arc<PullHub>) -> Self {
        Self {
            schema,
            remote,
            pulls,
            settled: Mutex::new(HashMap::new()),
            locks: DocumentLocks::new(),
            on_error: None,
        }
    }

    /// Install the push-error callback.
    pub fn with_error_callback(mut self, callback: PushErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Push `rows` of `table` in order.
    ///
    /// Updates are guarded on the row's own assumed master state and never
    /// carry the version token. The one exception is a row based on a state
    /// this engine itself wrote (it was produced while that write was in
    /// flight): it is rebased onto the latest state this engine got
    /// confirmed for the document. Each row holds its
    /// document's lock until the resulting pull has been applied. A transport
    /// failure stops the batch.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn push(&self, table: &str, rows: Vec<ChangeRow>) -> Result<Vec<PushOutcome>, SyncError> {
        let descriptor = self.schema.table(table)?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let _guard = self.locks.lock(table, &row.new_document.id).await;
            let outcome = self.push_one(descriptor, row).await?;
            self.pulls.flush(table).await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn push_one(&self, table: &TableDescriptor, row: ChangeRow) -> Result<PushOutcome, SyncError> {
        let id = row.new_document.id.clone();
        let base = Base::of(table, row.assumed_master_state.as_ref());
        let row = match self.rebase_target(&table.name, &id, &base) {
            Some(confirmed) => {
                debug!(table = %table.name, %id, "rebasing onto our own confirmed write");
                ChangeRow {
                    assumed_master_state: Some(confirmed),
                    new_document: row.new_document,
                }
            }
            None => row,
        };
        let pushed_base = Base::of(table, row.assumed_master_state.as_ref());
        let pushed_at = row.new_document.updated_at().map(str::to_string);

        let (operation, result) = if row.is_delete() {
            let result = self.remote.delete(&table.name, &id).await;
            (PushOperation::Delete, result.map(|()| None))
        } else if let Some(master) = &row.assumed_master_state {
            let mut diff = row.diff();
            diff.remove(VERSION_PROPERTY);
            let patch = table.to_remote(&diff);
            if patch.is_empty() {
                debug!(table = %table.name, %id, "no changes to push");
                // Only the version token may differ; the master carries the current one.
                let settled = master.clone().confirmed();
                self.pulls
                    .emit(PullEvent::new(&table.name, PullOrigin::Confirmed { pushed_at }, settled))?;
                return Ok(PushOutcome::Unchanged);
            }
            let guard = version_guard(table, master);
            let result = self.remote.update(&table.name, &id, patch, guard).await;
            (PushOperation::Update, result.map(Some))
        } else {
            let mut body = row.new_document.body();
            body.remove(VERSION_PROPERTY);
            let full = table.to_remote(&body);
            let result = self.remote.insert(&table.name, full).await;
            (PushOperation::Insert, result.map(Some))
        };

        match result {
            Ok(stored) => {
                let confirmed = match stored {
                    None => LocalDocument::tombstone(&id),
                    Some(stored) => LocalDocument::from_row(table.to_local(&stored))
                        .unwrap_or_else(|| row.new_document.clone())
                        .confirmed(),
                };
                self.settle(table, &id, base, pushed_base, &confirmed);
                debug!(table = %table.name, %id, operation = operation.as_str(), "push confirmed");
                self.pulls.emit(PullEvent::new(
                    &table.name,
                    PullOrigin::Confirmed { pushed_at },
                    confirmed.clone(),
                ))?;
                Ok(PushOutcome::Confirmed(confirmed))
            }
            Err(err) if err.is_conflict() => {
                warn!(?err, table = %table.name, %id, operation = operation.as_str(), "push conflict");
                self.report(&table.name, operation, &row.new_document, err);
                let master = match self.remote.fetch_by_id(&table.name, &id).await {
                    Ok(Some(stored)) => LocalDocument::from_row(table.to_local(&stored))
                        .unwrap_or_else(|| LocalDocument::tombstone(&id)),
                    Ok(None) => LocalDocument::tombstone(&id),
                    Err(err) => return Err(self.transport_failure(&table.name, operation, &row.new_document, err)),
                };
                self.pulls
                    .emit(PullEvent::new(&table.name, PullOrigin::Conflict, master.clone()))?;
                Ok(PushOutcome::Conflicted { master })
            }
            Err(err) => Err(self.transport_failure(&table.name, operation, &row.new_document, err)),
        }
    }

    fn settled(&self) -> MutexGuard<'_, SettledMap> {
        self.settled.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn rebase_target(&self, table: &str, id: &str, base: &Base) -> Option<LocalDocument> {
        self.settled()
            .get(&(table.to_string(), id.to_string()))
            .filter(|settled| settled.bases.contains(base))
            .map(|settled| settled.confirmed.clone())
    }

    /// Extend the chain when the write was pushed on a base the chain already
    /// knows, else start a new one. Every server state on a chain was written
    /// by this engine, so rows based on any of them rebase onto the latest.
    fn settle(&self, table: &TableDescriptor, id: &str, arrived: Base, pushed: Base, confirmed: &LocalDocument) {
        let key = (table.name.clone(), id.to_string());
        let mut settled = self.settled();
        if confirmed.deleted {
            settled.remove(&key);
            return;
        }
        let mut bases = match settled.remove(&key) {
            Some(previous) if previous.bases.contains(&pushed) => previous.bases,
            _ => Vec::new(),
        };
        for base in [arrived, pushed, Base::of(table, Some(confirmed))] {
            if !bases.contains(&base) {
                bases.push(base);
            }
        }
        settled.insert(
            key,
            Settled {
                bases,
                confirmed: confirmed.clone(),
            },
        );
    }

    fn transport_failure(
        &self,
        table: &str,
        operation: PushOperation,
        document: &LocalDocument,
        err: RemoteError,
    ) -> SyncError {
        warn!(?err, %table, id = %document.id, operation = operation.as_str(), "push transport failure");
        self.report(table, operation, document, err.clone());
        SyncError::Transport(err)
    }

    fn report(&self, table: &str, operation: PushOperation, document: &LocalDocument, error: RemoteError) {
        if let Some(callback) = &self.on_error {
            callback(&PushErrorReport {
                table: table.to_string(),
                operation,
                document: document.clone(),
                error,
            });
        }
    }
}

/// Guard on the version token when the table has one, else on the update time.
fn version_guard(table: &TableDescriptor, master: &LocalDocument) -> Option<VersionGuard> {
    let (column, property) = if table.has_version() {
        (tandem_schema::VERSION, VERSION_PROPERTY)
    } else if table.has_updated_at() {
        (tandem_schema::UPDATED_AT, UPDATED_AT_PROPERTY)
    } else {
        return None;
    };
    master
        .get(property)
        .filter(|value| !value.is_null())
        .map(|expected| VersionGuard {
            column: column.to_string(),
            expected: expected.clone(),
        })
}
