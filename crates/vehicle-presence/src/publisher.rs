use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::models::{ConnectionStatus, VehicleReport};

/// A mutation applied to the presence cache.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Added(VehicleReport),
    Updated(VehicleReport),
    /// One sweep's worth of evicted vehicle ids, sorted.
    Removed(Vec<String>),
    /// Number of entries dropped by an explicit clear.
    Cleared(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Presence(PresenceChange),
    Connection(ConnectionStatus),
}

pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Handle returned by [`Publisher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of change notifications to registered listeners.
#[derive(Default)]
pub struct Publisher {
    listeners: DashMap<u64, Listener>,
    next_id: AtomicU64,
}

impl Publisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::new(listener));
        SubscriptionId(id)
    }

    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id.0).is_some()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn publish(&self, notification: &Notification) {
        // listeners may (un)subscribe from inside the callback, so no shard
        // lock is held while they run
        let listeners: Vec<Listener> =
            self.listeners.iter().map(|entry| Arc::clone(entry.value())).collect();
        for listener in listeners {
            listener(notification);
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("listeners", &self.listeners.len()).finish()
    }
}
