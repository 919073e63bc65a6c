// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Leader relay: one replica talks to the remote store for everyone.

use std::sync::Arc;

use tandem_store_port::{ChangeRow, LeaderChannel, LeaderMessage};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pull::{PullEvent, PullHub, PullOrigin};
use crate::push::{PushOutcome, ReplicationEngine};
use crate::SyncError;

/// What happened to submitted change rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Pushed by this replica.
    Pushed(Vec<PushOutcome>),
    /// Forwarded to the leader; confirmations arrive through the pull stream.
    Forwarded,
}

/// Routes pushes and pulls between cooperating replicas.
///
/// Without a leader channel every replica is its own leader.
pub struct LeaderRelay {
    engine: Arc<ReplicationEngine>,
    pulls: Arc<PullHub>,
    leader: Option<Arc<dyn LeaderChannel>>,
}

impl std::fmt::Debug for LeaderRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderRelay")
            .field("engine", &self.engine)
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

impl LeaderRelay {
    /// Create a relay. `leader` is `None` for a standalone replica.
    pub fn new(engine: Arc<ReplicationEngine>, pulls: Arc<PullHub>, leader: Option<Arc<dyn LeaderChannel>>) -> Self {
        Self { engine, pulls, leader }
    }

    /// Whether this replica owns the remote connection.
    pub fn is_leader(&self) -> bool {
        self.leader.as_ref().is_none_or(|leader| leader.is_leader())
    }

    /// Push `rows` here when leader, else forward them to the leader.
    pub async fn submit(&self, table: &str, rows: Vec<ChangeRow>) -> Result<Submission, SyncError> {
        match &self.leader {
            Some(leader) if !leader.is_leader() => {
                debug!(%table, rows = rows.len(), "forwarding push to leader");
                leader
                    .broadcast(LeaderMessage::Push {
                        table: table.to_string(),
                        rows,
                    })
                    .await?;
                Ok(Submission::Forwarded)
            }
            _ => Ok(Submission::Pushed(self.engine.push(table, rows).await?)),
        }
    }

    /// Start the relay loop. Standalone replicas have nothing to relay and
    /// get `None`.
    ///
    /// The leader pushes forwarded rows and broadcasts every pull it emits;
    /// followers inject broadcast pulls into their own streams.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let leader = self.leader.clone()?;
        let relay = Arc::clone(self);
        Some(tokio::spawn(async move { relay.run(leader).await }))
    }

    async fn run(&self, leader: Arc<dyn LeaderChannel>) {
        let mut inbox = leader.on_message();
        let mut tap = self.pulls.tap();
        info!(is_leader = leader.is_leader(), "leader relay started");
        loop {
            tokio::select! {
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    self.on_message(leader.as_ref(), message).await;
                }
                event = tap.recv() => match event {
                    Ok(event) => self.fan_out(leader.as_ref(), event).await,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "relay lagged behind pull stream"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("leader relay stopped");
    }

    async fn on_message(&self, leader: &dyn LeaderChannel, message: LeaderMessage) {
        match message {
            LeaderMessage::Push { table, rows } if leader.is_leader() => {
                if let Err(err) = self.engine.push(&table, rows).await {
                    warn!(?err, %table, "relayed push failed");
                }
            }
            LeaderMessage::Pull {
                table,
                authoritative,
                documents,
            } if !leader.is_leader() => {
                let origin = if authoritative {
                    PullOrigin::Conflict
                } else {
                    PullOrigin::Relay
                };
                for document in documents {
                    if let Err(err) = self.pulls.emit(PullEvent::new(&table, origin.clone(), document)) {
                        warn!(?err, %table, "relayed pull dropped");
                    }
                }
            }
            other => debug!(?other, "ignoring relay message for the other role"),
        }
    }

    async fn fan_out(&self, leader: &dyn LeaderChannel, event: PullEvent) {
        if !leader.is_leader() || matches!(event.origin, PullOrigin::Relay) {
            return;
        }
        let message = LeaderMessage::Pull {
            authoritative: event.origin == PullOrigin::Conflict,
            table: event.table,
            documents: vec![event.document],
        };
        if let Err(err) = leader.broadcast(message).await {
            warn!(?err, "pull broadcast failed");
        }
    }
}
