use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use realtime::{Clock, Result, SystemClock, Transport};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::PresenceCache;
use crate::config::{Config, Topics};
use crate::connection::{ConnectionManager, StatusBoard};
use crate::ingest::Ingest;
use crate::models::{ConnectionStatus, VehicleReport};
use crate::publisher::{Notification, Publisher, SubscriptionId};
use crate::sweeper;

/// Connection status and vehicles read together, so "connected with no
/// vehicles" is never confused with "disconnected".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    pub status: ConnectionStatus,
    /// Sorted by vehicle id.
    pub vehicles: Vec<VehicleReport>,
}

#[derive(Default)]
struct Lifecycle {
    scope: Option<String>,
    sweeper: Option<JoinHandle<()>>,
    stopped: bool,
}

/// Live vehicle presence: a bus connection feeding an in-memory cache of the
/// latest report per vehicle, with stale entries swept out periodically.
pub struct LivePresence<T: Transport> {
    config: Config,
    clock: Arc<dyn Clock>,
    publisher: Arc<Publisher>,
    cache: Arc<PresenceCache>,
    board: Arc<StatusBoard>,
    connection: ConnectionManager<T>,
    lifecycle: Mutex<Lifecycle>,
}

impl<T: Transport> LivePresence<T> {
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` when the configuration does not
    /// validate.
    pub fn new(config: Config, transport: T) -> Result<Self> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// As [`LivePresence::new`], with an explicit time source for receipt
    /// stamps and staleness checks.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` when the configuration does not
    /// validate.
    pub fn with_clock(config: Config, transport: T, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let publisher = Arc::new(Publisher::new());
        let cache = Arc::new(PresenceCache::new(Arc::clone(&publisher), Arc::clone(&clock)));
        let board = Arc::new(StatusBoard::new(Arc::clone(&publisher), Arc::clone(&clock)));
        let ingest = Ingest::new(Arc::clone(&cache), Arc::clone(&clock));
        let connection =
            ConnectionManager::new(transport, ingest, Arc::clone(&board), config.reconnect_delay);
        let lifecycle =
            Lifecycle { scope: config.topics.scope.clone(), ..Lifecycle::default() };

        Ok(Self {
            config,
            clock,
            publisher,
            cache,
            board,
            connection,
            lifecycle: Mutex::new(lifecycle),
        })
    }

    /// Connect to the bus and start sweeping. Returns `false` when already
    /// running. Starting again after a stop begins from an empty cache.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(&self) -> bool {
        let restarted = {
            let mut lifecycle = self.lifecycle();
            if self.connection.is_running() {
                return false;
            }
            mem::take(&mut lifecycle.stopped)
        };

        // listeners run inside `clear` and may call back in
        if restarted {
            self.cache.clear();
        }

        let scope = self.lifecycle().scope.clone();
        let topics = Topics { scope, ..self.config.topics.clone() };
        if !self.connection.start(&self.config.endpoint, topics) {
            return false;
        }

        let sweeper = sweeper::spawn(
            Arc::clone(&self.cache),
            Arc::clone(&self.clock),
            self.config.sweep_interval,
            self.config.stale_after,
        );
        if let Some(previous) = self.lifecycle().sweeper.replace(sweeper) {
            previous.abort();
        }
        true
    }

    /// Disconnect and stop sweeping. Cached vehicles stay readable until the
    /// next start.
    pub async fn stop(&self) {
        let sweeper = {
            let mut lifecycle = self.lifecycle();
            let sweeper = lifecycle.sweeper.take();
            lifecycle.stopped |= sweeper.is_some();
            sweeper
        };
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        self.connection.stop().await;
    }

    /// Latest report per vehicle. Empty before the first report arrives.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, VehicleReport> {
        self.cache.snapshot()
    }

    #[must_use]
    pub fn snapshot_for_route(&self, route_id: &str) -> HashMap<String, VehicleReport> {
        self.cache.snapshot_for_route(route_id)
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.publisher.subscribe(listener)
    }

    /// Returns `false` when the subscription was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.board.current()
    }

    #[must_use]
    pub fn status_stream(&self) -> watch::Receiver<ConnectionStatus> {
        self.board.watch()
    }

    #[must_use]
    pub fn view(&self) -> PresenceView {
        let status = self.board.current();
        let mut vehicles: Vec<VehicleReport> = self.cache.snapshot().into_values().collect();
        vehicles.sort_by(|a, b| a.vehicle_id().cmp(b.vehicle_id()));
        PresenceView { status, vehicles }
    }

    /// Switch the scoped subscription to another route or trip, or drop it
    /// with `None`. Takes effect on the live session, or on the next start.
    pub fn focus_route(&self, scope: Option<String>) {
        let scope = scope.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        self.lifecycle().scope.clone_from(&scope);
        self.connection.focus(scope);
    }

    /// Drop every cached vehicle.
    pub fn clear(&self) -> usize {
        self.cache.clear()
    }

    /// Run a staleness sweep now instead of waiting for the next tick.
    pub fn sweep_now(&self) -> Vec<String> {
        self.cache.sweep(self.clock.now_utc(), self.config.stale_after)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Drop for LivePresence<T> {
    fn drop(&mut self) {
        // the connection worker exits once its command channel drops
        if let Some(sweeper) = self.lifecycle().sweeper.take() {
            sweeper.abort();
        }
    }
}

impl<T: Transport> fmt::Debug for LivePresence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivePresence")
            .field("endpoint", &self.config.endpoint)
            .field("cache", &self.cache)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
