// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Live queries.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tandem_query::{materialize, LocalPlan, QueryNode};
use tandem_realtime::{derive_channels, ChannelManager, ChannelName, Subscription};
use tandem_replication::LeaderRelay;
use tandem_schema::{Row, Schema};
use tandem_store_port::{LocalStore, StoreChange};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::SessionError;

pub(crate) struct Watcher {
    pub(crate) schema: Arc<Schema>,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) plan: LocalPlan,
    pub(crate) root: QueryNode,
    pub(crate) channels: Option<ChannelManager>,
    pub(crate) relay: Arc<LeaderRelay>,
}

impl Watcher {
    /// Materialize the result and swap in its channel set, subscribing the
    /// new set before the old one is released.
    async fn evaluate(&self, subscription: &mut Option<Subscription>) -> Result<Vec<Row>, SessionError> {
        let rows = materialize(&self.store.query(&self.plan).await?, &self.plan);
        match &self.channels {
            Some(channels) if self.relay.is_leader() => {
                let wanted = derive_channels(&self.schema, &self.root, &rows)?;
                let unchanged = subscription.as_ref().is_some_and(|current| {
                    current.channels().iter().cloned().collect::<BTreeSet<ChannelName>>() == wanted
                });
                if !unchanged {
                    let next = channels.subscribe(wanted).await?;
                    if let Some(previous) = subscription.replace(next) {
                        previous.unsubscribe();
                    }
                }
            }
            _ => {
                if let Some(previous) = subscription.take() {
                    previous.unsubscribe();
                }
            }
        }
        Ok(rows)
    }

    fn reads(&self, change: &StoreChange) -> bool {
        self.root.tables().contains(&change.table.as_str())
    }

    async fn run(
        self,
        mut changes: broadcast::Receiver<StoreChange>,
        results: watch::Sender<Vec<Row>>,
        mut subscription: Option<Subscription>,
    ) {
        loop {
            match changes.recv().await {
                Ok(change) if !self.reads(&change) => continue,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "live query lagged; re-running"),
                Err(RecvError::Closed) => break,
            }
            // Coalesce a burst of changes into one evaluation.
            loop {
                match changes.try_recv() {
                    Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
            match self.evaluate(&mut subscription).await {
                Ok(rows) => {
                    if results.send(rows).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(table = %self.plan.table, ?err, "live query evaluation failed"),
            }
        }
        debug!(table = %self.plan.table, "live query stopped");
    }
}

/// Handle on a running live query. Closing (or dropping) it stops
/// re-evaluation and releases its realtime channels.
#[derive(Debug)]
pub struct LiveQuery {
    results: watch::Receiver<Vec<Row>>,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl LiveQuery {
    pub(crate) async fn start(watcher: Watcher) -> Result<Self, SessionError> {
        // Subscribe before the first evaluation so no change is missed.
        let changes = watcher.store.changes();
        let mut subscription = None;
        let first = watcher.evaluate(&mut subscription).await?;
        let (tx, results) = watch::channel(first);
        let task = tokio::spawn(watcher.run(changes, tx, subscription));
        Ok(Self {
            results,
            task,
            closed: AtomicBool::new(false),
        })
    }

    /// Latest result.
    pub fn current(&self) -> Vec<Row> {
        self.results.borrow().clone()
    }

    /// Wait for the next result.
    pub async fn changed(&mut self) -> Result<Vec<Row>, SessionError> {
        self.results.changed().await.map_err(|_| SessionError::Closed)?;
        Ok(self.results.borrow_and_update().clone())
    }

    /// Whether the query stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.task.is_finished()
    }

    /// Stop the query. Calling it again does nothing.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.task.abort();
        }
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.close();
    }
}
