use std::sync::Arc;
use std::time::Duration;

use realtime::Clock;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::cache::PresenceCache;

/// Spawn the periodic staleness sweep. The task runs until its handle is
/// aborted.
///
/// # Panics
///
/// Panics when called outside a Tokio runtime.
pub fn spawn(
    cache: Arc<PresenceCache>, clock: Arc<dyn Clock>, every: Duration, stale_after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let evicted = cache.sweep(clock.now_utc(), stale_after);
            if !evicted.is_empty() {
                tracing::info!(
                    monotonic_counter.presence_evictions = evicted.len(),
                    remaining = cache.len(),
                    "swept stale vehicles"
                );
            }
        }
    })
}
