// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Stale-entity reconciliation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use tandem_query::EntityIndex;
use tandem_schema::Schema;
use tandem_store_port::{LocalDocument, RemoteStore};
use tracing::{debug, info, instrument, warn};

use crate::pull::{PullEvent, PullHub, PullOrigin};
use crate::SyncError;

const DEFAULT_CONCURRENCY: usize = 8;

type Key = (String, String);

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows the point lookup still returned (window misses), re-pulled.
    pub restored: Vec<Key>,
    /// Rows the point lookup no longer found, tombstoned.
    pub deleted: Vec<Key>,
    /// Rows another pass was already looking up.
    pub skipped: Vec<Key>,
}

/// Confirms, by point lookup, rows a fresh fetch no longer returns.
pub struct StaleReconciler {
    schema: Arc<Schema>,
    remote: Arc<dyn RemoteStore>,
    pulls: Arc<PullHub>,
    in_flight: Mutex<HashSet<Key>>,
    concurrency: usize,
}

impl std::fmt::Debug for StaleReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleReconciler")
            .field("concurrency", &self.concurrency)
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

/// Releases claimed keys when a pass ends, even on early return.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<Key>>,
    keys: Vec<Key>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            in_flight.remove(key);
        }
    }
}

impl StaleReconciler {
    /// Create a reconciler emitting restored and deleted rows into `pulls`.
    pub fn new(schema: Arc<Schema>, remote: Arc<dyn RemoteStore>, pulls: Arc<PullHub>) -> Self {
        Self {
            schema,
            remote,
            pulls,
            in_flight: Mutex::new(HashSet::new()),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Override how many point lookups run at once (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Keys currently being looked up.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Reconcile a local result against a fresh remote result of the same
    /// query. Pending local rows are never candidates.
    pub async fn reconcile_results(&self, local: &EntityIndex, fresh: &EntityIndex) -> Result<ReconcileReport, SyncError> {
        self.reconcile(local.missing_from(fresh)).await
    }

    /// Point-look-up every `(table, id)` and converge the replica.
    ///
    /// Keys already claimed by a concurrent pass are skipped. The first
    /// lookup failure is returned after every other lookup has landed.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub async fn reconcile(&self, candidates: Vec<Key>) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport::default();
        let claim = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            let mut keys = Vec::new();
            for key in candidates {
                if in_flight.insert(key.clone()) {
                    keys.push(key);
                } else {
                    report.skipped.push(key);
                }
            }
            Claim {
                in_flight: &self.in_flight,
                keys,
            }
        };
        if claim.keys.is_empty() {
            return Ok(report);
        }

        let lookups: Vec<_> = stream::iter(claim.keys.iter().cloned())
            .map(|(table, id)| async move {
                let found = self.remote.fetch_by_id(&table, &id).await;
                (table, id, found)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut first_error = None;
        for (table, id, found) in lookups {
            let document = match found {
                Ok(Some(row)) => {
                    let descriptor = self.schema.table(&table)?;
                    match LocalDocument::from_row(descriptor.to_local(&row)) {
                        Some(document) => {
                            report.restored.push((table.clone(), id));
                            document
                        }
                        None => continue,
                    }
                }
                Ok(None) => {
                    report.deleted.push((table.clone(), id.clone()));
                    LocalDocument::tombstone(id)
                }
                Err(err) => {
                    warn!(?err, %table, %id, "stale lookup failed");
                    first_error.get_or_insert(SyncError::Transport(err));
                    continue;
                }
            };
            self.pulls.emit(PullEvent::new(&table, PullOrigin::Fetch, document))?;
        }
        drop(claim);

        if let Some(err) = first_error {
            return Err(err);
        }
        if report.deleted.is_empty() {
            debug!(restored = report.restored.len(), "reconciled");
        } else {
            info!(restored = report.restored.len(), deleted = report.deleted.len(), "reconciled");
        }
        Ok(report)
    }
}
