//! Change notification for committed store writes.
//!
//! The store owns one [`ChangeNotifier`]. After every committed write it
//! broadcasts a [`StoreEvent`] to all registered observers, and one final
//! [`StoreEvent::Closed`] when the store closes:
//! - callback observers run synchronously on the writing thread
//! - channel observers ([`ChangeFeed`]) receive a copy through a bounded
//!   buffer and are dropped when they fall behind
//!
//! Broadcasting never holds the registry lock while running callbacks, so
//! an observer may register or unregister observers (including itself) from
//! inside its callback.

use crate::types::ChangeSet;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Events delivered to store observers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A write was committed.
    Committed(ChangeSet),
    /// The store closed; no further events follow.
    Closed,
}

/// Unique identifier for a registered observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Callback invoked with every store event.
pub type ChangeObserver = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

enum Observer {
    Callback(ChangeObserver),
    Channel(Sender<StoreEvent>),
}

/// Registry of store observers.
pub struct ChangeNotifier {
    observers: RwLock<HashMap<ObserverId, Observer>>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ObserverId {
        ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a callback observer.
    pub fn observe(&self, callback: ChangeObserver) -> ObserverId {
        let id = self.next_id();
        self.observers.write().insert(id, Observer::Callback(callback));
        id
    }

    /// Register a buffered channel observer.
    pub fn feed(&self, buffer_size: usize) -> ChangeFeed {
        let id = self.next_id();
        let (sender, receiver) = bounded(buffer_size.max(1));
        self.observers.write().insert(id, Observer::Channel(sender));
        ChangeFeed { id, receiver }
    }

    /// Unregister an observer. Returns whether it was registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        self.observers.write().remove(&id).is_some()
    }

    /// Drop every observer.
    pub fn clear(&self) {
        self.observers.write().clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver an event to every observer.
    pub fn broadcast(&self, event: &StoreEvent) {
        let mut callbacks = Vec::new();
        let mut to_remove = Vec::new();

        {
            let observers = self.observers.read();
            for (id, observer) in observers.iter() {
                match observer {
                    Observer::Callback(callback) => callbacks.push(Arc::clone(callback)),
                    Observer::Channel(sender) => match sender.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!(observer = id.0, "change feed overflowed, dropping");
                            to_remove.push(*id);
                        }
                        Err(TrySendError::Disconnected(_)) => to_remove.push(*id),
                    },
                }
            }
        }

        if !to_remove.is_empty() {
            let mut observers = self.observers.write();
            for id in to_remove {
                observers.remove(&id);
            }
        }

        for callback in callbacks {
            callback(event);
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffered stream of store events.
pub struct ChangeFeed {
    pub id: ObserverId,
    receiver: Receiver<StoreEvent>,
}

impl ChangeFeed {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StoreEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StoreEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<StoreEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
