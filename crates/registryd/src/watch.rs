//! Change subscriptions
//!
//! Every subscriber owns a bounded broadcast channel. Publishing never
//! blocks: a subscriber that falls behind loses its oldest pending events.

use parking_lot::RwLock;
use registry_core::RegistryEvent;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

/// Pending events held per subscriber. The channel rounds its capacity up
/// to a power of two, so this is kept at one.
pub const WATCH_QUEUE_CAPACITY: usize = 16;

/// Watch errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WatchError {
    #[error("watcher stopped")]
    Stopped,
}

/// Subscriber table
#[derive(Default)]
pub struct Watchers {
    subscribers: RwLock<BTreeMap<u64, broadcast::Sender<RegistryEvent>>>,
    next_id: AtomicU64,
}

impl Watchers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new subscriber
    pub fn subscribe(self: &Arc<Self>) -> Watcher {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(WATCH_QUEUE_CAPACITY);
        self.subscribers.write().insert(id, tx);
        debug!(watcher = id, "Watcher subscribed");

        Watcher {
            rx,
            dropped: 0,
            handle: StopHandle {
                id,
                stopped: Arc::new(AtomicBool::new(false)),
                watchers: Arc::downgrade(self),
            },
        }
    }

    /// Deliver events, in order, to every subscriber
    pub fn publish(&self, events: &[RegistryEvent]) {
        if events.is_empty() {
            return;
        }
        let subscribers = self.subscribers.read();
        for event in events {
            for tx in subscribers.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Number of active subscribers
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unsubscribe(&self, id: u64) {
        // Dropping the sender wakes a pending receive
        if self.subscribers.write().remove(&id).is_some() {
            debug!(watcher = id, "Watcher unsubscribed");
        }
    }
}

/// Stops a [`Watcher`] from another task or thread
#[derive(Clone)]
pub struct StopHandle {
    id: u64,
    stopped: Arc<AtomicBool>,
    watchers: Weak<Watchers>,
}

impl StopHandle {
    /// Unsubscribe and wake a pending receive. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(watchers) = self.watchers.upgrade() {
            watchers.unsubscribe(self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A subscription to registry changes. Dropping it unsubscribes.
pub struct Watcher {
    rx: broadcast::Receiver<RegistryEvent>,
    handle: StopHandle,
    dropped: u64,
}

impl Watcher {
    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.handle.clone()
    }

    /// Wait for the next event. Fails once the watcher is stopped, even if
    /// events were still pending.
    pub async fn next(&mut self) -> Result<RegistryEvent, WatchError> {
        loop {
            if self.handle.is_stopped() {
                return Err(WatchError::Stopped);
            }
            let received = self.rx.recv().await;
            if let Some(result) = self.deliver(received) {
                return result;
            }
        }
    }

    /// Blocking [`Watcher::next`] for callers outside the async runtime.
    /// Panics if called from within an async context.
    pub fn blocking_next(&mut self) -> Result<RegistryEvent, WatchError> {
        loop {
            if self.handle.is_stopped() {
                return Err(WatchError::Stopped);
            }
            let received = self.rx.blocking_recv();
            if let Some(result) = self.deliver(received) {
                return result;
            }
        }
    }

    /// Non-blocking poll
    pub fn try_next(&mut self) -> Result<Option<RegistryEvent>, WatchError> {
        loop {
            if self.handle.is_stopped() {
                return Err(WatchError::Stopped);
            }
            match self.rx.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Closed) => return Err(WatchError::Stopped),
            }
        }
    }

    /// Events discarded because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Unsubscribe. Idempotent.
    pub fn stop(&self) {
        self.handle.stop();
    }

    fn deliver(
        &mut self,
        received: Result<RegistryEvent, RecvError>,
    ) -> Option<Result<RegistryEvent, WatchError>> {
        match received {
            _ if self.handle.is_stopped() => Some(Err(WatchError::Stopped)),
            Ok(event) => Some(Ok(event)),
            Err(RecvError::Lagged(n)) => {
                self.lagged(n);
                None
            }
            Err(RecvError::Closed) => Some(Err(WatchError::Stopped)),
        }
    }

    fn lagged(&mut self, n: u64) {
        self.dropped += n;
        debug!(
            watcher = self.handle.id,
            dropped = n,
            "Watcher fell behind, oldest events dropped"
        );
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}
