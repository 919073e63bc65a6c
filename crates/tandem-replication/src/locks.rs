// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-document async locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

/// Serializes work on one `(table, id)` at a time.
///
/// Idle slots are pruned whenever a new lock is requested.
#[derive(Debug, Default)]
pub struct DocumentLocks {
    slots: Mutex<HashMap<(String, String), Slot>>,
}

impl DocumentLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `table`/`id`.
    pub async fn lock(&self, table: &str, id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots
                .entry((table.to_string(), id.to_string()))
                .or_default()
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of slots currently tracked (held, awaited or not yet pruned).
    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_lock_waits_for_the_first() {
        let locks = Arc::new(DocumentLocks::new());
        let guard = locks.lock("posts", "p1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("posts", "p1").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // other documents are independent
        let other = tokio::time::timeout(Duration::from_secs(1), locks.lock("posts", "p2")).await;
        assert!(other.is_ok());

        drop(guard);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.is_ok());
    }

    #[tokio::test]
    async fn idle_slots_are_pruned() {
        let locks = DocumentLocks::new();
        drop(locks.lock("posts", "a").await);
        drop(locks.lock("posts", "b").await);
        let _held = locks.lock("posts", "c").await;
        assert_eq!(locks.tracked(), 1);
    }
}
