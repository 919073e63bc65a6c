// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reference-counted channel attachment with debounced detach.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tandem_store_port::{ChannelMessage, PubSub};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::{ChannelName, MessageHandler, RealtimeError};

/// Delay between the last unsubscribe and the transport detach.
pub const DEFAULT_DETACH_DELAY: Duration = Duration::from_millis(3000);

struct Entry {
    refs: usize,
    generation: u64,
    listener: Option<JoinHandle<()>>,
    pending_detach: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn PubSub>,
    handler: Arc<dyn MessageHandler>,
    detach_delay: Duration,
    entries: Mutex<HashMap<ChannelName, Entry>>,
    generations: AtomicU64,
}

/// Shares transport channels between every live query of one replica.
///
/// Cloning is cheap; clones manage the same channels.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("detach_delay", &self.inner.detach_delay)
            .field("channels", &self.channels().len())
            .finish_non_exhaustive()
    }
}

impl ChannelManager {
    /// Create a manager delivering messages from `transport` to `handler`,
    /// detaching idle channels after `detach_delay`.
    pub fn new(transport: Arc<dyn PubSub>, handler: Arc<dyn MessageHandler>, detach_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                handler,
                detach_delay,
                entries: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Configured detach delay.
    pub fn detach_delay(&self) -> Duration {
        self.inner.detach_delay
    }

    /// Take a reference on every name in `names`, attaching the ones nobody
    /// held yet.
    ///
    /// On failure every reference taken by this call is released again.
    #[instrument(skip_all, fields(channels = tracing::field::Empty))]
    pub async fn subscribe(&self, names: impl IntoIterator<Item = ChannelName> + Send) -> Result<Subscription, RealtimeError> {
        let names: Vec<ChannelName> = names.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        tracing::Span::current().record("channels", names.len());
        let fresh = self.inner.acquire(&names);
        // Dropping the subscription on an early return releases every name.
        let subscription = Subscription {
            inner: Arc::clone(&self.inner),
            names,
            released: AtomicBool::new(false),
        };
        for (name, generation) in fresh {
            self.inner.attach(&name, generation).await?;
        }
        Ok(subscription)
    }

    /// Whether the transport channel for `name` is open.
    pub fn is_attached(&self, name: &ChannelName) -> bool {
        self.inner.lock().get(name).is_some_and(|entry| entry.listener.is_some())
    }

    /// Live references on `name`.
    pub fn ref_count(&self, name: &ChannelName) -> usize {
        self.inner.lock().get(name).map_or(0, |entry| entry.refs)
    }

    /// Whether a detach of `name` is scheduled.
    pub fn is_detach_pending(&self, name: &ChannelName) -> bool {
        self.inner
            .lock()
            .get(name)
            .is_some_and(|entry| entry.pending_detach.is_some())
    }

    /// Every tracked channel, attached or waiting to detach, ordered.
    pub fn channels(&self) -> Vec<ChannelName> {
        let mut names: Vec<ChannelName> = self.inner.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Detach every channel now, ignoring references and pending delays.
    pub async fn close(&self) {
        let drained: Vec<(ChannelName, Entry)> = self.inner.lock().drain().collect();
        for (name, entry) in drained {
            self.inner.teardown(&name, entry).await;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelName, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Count one reference per name; returns the names that need attaching.
    fn acquire(&self, names: &[ChannelName]) -> Vec<(ChannelName, u64)> {
        let mut fresh = Vec::new();
        let mut entries = self.lock();
        for name in names {
            match entries.get_mut(name) {
                Some(entry) => {
                    entry.refs += 1;
                    if let Some(pending) = entry.pending_detach.take() {
                        pending.abort();
                        debug!(channel = %name, "scheduled detach cancelled");
                    }
                }
                None => {
                    let generation = self.next_generation();
                    entries.insert(
                        name.clone(),
                        Entry {
                            refs: 1,
                            generation,
                            listener: None,
                            pending_detach: None,
                        },
                    );
                    fresh.push((name.clone(), generation));
                }
            }
        }
        fresh
    }

    fn release(self: &Arc<Self>, names: &[ChannelName]) {
        let mut entries = self.lock();
        for name in names {
            let Some(entry) = entries.get_mut(name) else {
                continue;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 || entry.pending_detach.is_some() {
                continue;
            }
            if let Ok(runtime) = Handle::try_current() {
                let inner = Arc::clone(self);
                let name = name.clone();
                entry.pending_detach = Some(runtime.spawn(async move {
                    tokio::time::sleep(inner.detach_delay).await;
                    inner.detach(name).await;
                }));
            } else if let Some(entry) = entries.remove(name) {
                warn!(channel = %name, "released outside a runtime; transport channel left open");
                if let Some(listener) = entry.listener {
                    listener.abort();
                }
            }
        }
    }

    #[instrument(skip(self, name), fields(channel = %name))]
    async fn attach(self: &Arc<Self>, name: &ChannelName, generation: u64) -> Result<(), RealtimeError> {
        let receiver = self.transport.subscribe(&name.to_string()).await?;
        let listener = self.listen(name.clone(), receiver);
        let outcome = {
            let mut entries = self.lock();
            match entries.get_mut(name) {
                Some(entry) if entry.generation == generation => {
                    entry.listener = Some(listener);
                    Ok(())
                }
                // Re-created by a later subscriber; its own attach owns the transport channel.
                Some(_) => Err((listener, false)),
                None => Err((listener, true)),
            }
        };
        match outcome {
            Ok(()) => debug!("channel attached"),
            Err((listener, orphaned)) => {
                listener.abort();
                if orphaned {
                    debug!("channel released while attaching");
                    if let Err(err) = self.transport.unsubscribe(&name.to_string()).await {
                        warn!(?err, "channel detach failed");
                    }
                }
            }
        }
        Ok(())
    }

    fn listen(&self, name: ChannelName, mut receiver: mpsc::Receiver<ChannelMessage>) -> JoinHandle<()> {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if let Err(err) = handler.handle(&name, message).await {
                    warn!(channel = %name, ?err, "channel message dropped");
                }
            }
        })
    }

    async fn detach(&self, name: ChannelName) {
        let entry = {
            let mut entries = self.lock();
            if entries.get(&name).is_none_or(|entry| entry.refs > 0) {
                return;
            }
            entries.remove(&name)
        };
        if let Some(mut entry) = entry {
            // This task is the pending detach; dropping its handle is enough.
            entry.pending_detach = None;
            self.teardown(&name, entry).await;
        }
    }

    async fn teardown(&self, name: &ChannelName, entry: Entry) {
        if let Some(pending) = entry.pending_detach {
            pending.abort();
        }
        if let Some(listener) = entry.listener {
            listener.abort();
        }
        match self.transport.unsubscribe(&name.to_string()).await {
            Ok(()) => debug!(channel = %name, "channel detached"),
            Err(err) => warn!(channel = %name, ?err, "channel detach failed"),
        }
    }
}

/// References taken by one [`ChannelManager::subscribe`] call.
///
/// Released by [`unsubscribe`](Self::unsubscribe) or on drop, exactly once.
pub struct Subscription {
    inner: Arc<Inner>,
    names: Vec<ChannelName>,
    released: AtomicBool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("names", &self.names)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Subscription {
    /// Channels this subscription holds, ordered and deduplicated.
    pub fn channels(&self) -> &[ChannelName] {
        &self.names
    }

    /// Whether the references were already released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the references. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.inner.release(&self.names);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
