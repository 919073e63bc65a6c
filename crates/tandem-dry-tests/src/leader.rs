// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory leader channel shared by cooperating replicas.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tandem_store_port::{LeaderChannel, LeaderMessage, TransportError};
use tokio::sync::mpsc;

type Bus = Arc<Mutex<Vec<(usize, mpsc::UnboundedSender<LeaderMessage>)>>>;

/// One replica's end of an in-memory broadcast bus.
///
/// Broadcasts reach every other member's `on_message` receivers, never the
/// sender's own.
#[derive(Debug)]
pub struct MemoryLeaderChannel {
    member: usize,
    leader: AtomicBool,
    bus: Bus,
}

impl MemoryLeaderChannel {
    /// Hand leadership to or away from this member.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

/// Two members of one bus; the first starts as leader.
pub fn leader_pair() -> (Arc<MemoryLeaderChannel>, Arc<MemoryLeaderChannel>) {
    let bus = Bus::default();
    let member = |member, leader| {
        Arc::new(MemoryLeaderChannel {
            member,
            leader: AtomicBool::new(leader),
            bus: Arc::clone(&bus),
        })
    };
    (member(0, true), member(1, false))
}

#[async_trait]
impl LeaderChannel for MemoryLeaderChannel {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn broadcast(&self, message: LeaderMessage) -> Result<(), TransportError> {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        bus.retain(|(_, tx)| !tx.is_closed());
        for (member, tx) in bus.iter() {
            if *member != self.member {
                let _ = tx.send(message.clone());
            }
        }
        Ok(())
    }

    fn on_message(&self) -> mpsc::UnboundedReceiver<LeaderMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((self.member, tx));
        rx
    }
}
