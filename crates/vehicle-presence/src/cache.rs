use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use realtime::Clock;

use crate::models::VehicleReport;
use crate::publisher::{Notification, PresenceChange, Publisher};

/// Latest report per vehicle, stamped with its receipt time.
///
/// One lock guards every read and mutation, so a snapshot always reflects a
/// state between two mutations.
///
/// Changes are queued while the lock is held and delivered after it is
/// released, in mutation order. Only one thread delivers at a time: a change
/// made while another thread is delivering (or from inside a listener) is
/// handed to that delivery loop, so the mutating call may return before its
/// notification has gone out.
pub struct PresenceCache {
    entries: RwLock<HashMap<String, Entry>>,
    outbox: Outbox,
    publisher: Arc<Publisher>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
struct Entry {
    report: VehicleReport,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Added,
    Updated,
}

impl PresenceCache {
    #[must_use]
    pub fn new(publisher: Arc<Publisher>, clock: Arc<dyn Clock>) -> Self {
        Self { entries: RwLock::new(HashMap::new()), outbox: Outbox::default(), publisher, clock }
    }

    /// Insert or replace the entry for the report's vehicle, stamped now.
    pub fn upsert(&self, report: VehicleReport) -> Upserted {
        let received_at = self.clock.now_utc();
        self.upsert_at(report, received_at)
    }

    /// Insert or replace the entry for the report's vehicle. Last write wins
    /// regardless of the embedded timestamp.
    pub fn upsert_at(&self, report: VehicleReport, received_at: DateTime<Utc>) -> Upserted {
        let key = report.vehicle_id().to_string();
        let entry = Entry { report: report.clone(), received_at };

        let outcome = {
            let mut entries = self.write();
            let (outcome, change) = match entries.insert(key, entry) {
                None => (Upserted::Added, PresenceChange::Added(report)),
                Some(_) => (Upserted::Updated, PresenceChange::Updated(report)),
            };
            self.outbox.push(change);
            outcome
        };

        self.flush();
        outcome
    }

    /// Owned copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, VehicleReport> {
        self.read().iter().map(|(id, entry)| (id.clone(), entry.report.clone())).collect()
    }

    /// Owned copy of the vehicles currently reporting against `route_id`.
    #[must_use]
    pub fn snapshot_for_route(&self, route_id: &str) -> HashMap<String, VehicleReport> {
        self.read()
            .iter()
            .filter(|(_, entry)| entry.report.route_id() == Some(route_id))
            .map(|(id, entry)| (id.clone(), entry.report.clone()))
            .collect()
    }

    #[must_use]
    pub fn get(&self, vehicle_id: &str) -> Option<VehicleReport> {
        self.read().get(vehicle_id).map(|entry| entry.report.clone())
    }

    #[must_use]
    pub fn received_at(&self, vehicle_id: &str) -> Option<DateTime<Utc>> {
        self.read().get(vehicle_id).map(|entry| entry.received_at)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Evict every entry received more than `max_age` before `now`.
    ///
    /// Returns the evicted ids, sorted. Publishes a single `Removed`
    /// notification for the batch, or nothing when no entry was stale.
    pub fn sweep(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);

        let mut removed = Vec::new();
        {
            let mut entries = self.write();
            entries.retain(|id, entry| {
                let keep = now.signed_duration_since(entry.received_at) <= max_age;
                if !keep {
                    removed.push(id.clone());
                }
                keep
            });
            if removed.is_empty() {
                return removed;
            }
            removed.sort();
            self.outbox.push(PresenceChange::Removed(removed.clone()));
        }

        tracing::debug!(count = removed.len(), vehicles = ?removed, "evicted stale vehicles");
        self.flush();
        removed
    }

    /// Drop every entry. Always publishes exactly one `Cleared` notification.
    pub fn clear(&self) -> usize {
        let count = {
            let mut entries = self.write();
            let count = entries.len();
            entries.clear();
            self.outbox.push(PresenceChange::Cleared(count));
            count
        };

        self.flush();
        count
    }

    /// Deliver queued changes unless another call is already doing so.
    fn flush(&self) {
        loop {
            let Some(draining) = self.outbox.claim() else {
                return;
            };
            loop {
                let next = self.outbox.queue().pop_front();
                let Some(change) = next else { break };
                self.publisher.publish(&Notification::Presence(change));
            }
            drop(draining);

            // a change queued after the last pop but before the release
            if self.outbox.queue().is_empty() {
                return;
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Changes waiting for delivery, plus the flag held by the delivering thread.
#[derive(Default)]
struct Outbox {
    queue: Mutex<VecDeque<PresenceChange>>,
    draining: AtomicBool,
}

impl Outbox {
    fn push(&self, change: PresenceChange) {
        self.queue().push_back(change);
    }

    fn claim(&self) -> Option<Draining<'_>> {
        (!self.draining.swap(true, Ordering::SeqCst)).then_some(Draining(&self.draining))
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<PresenceChange>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the delivery flag, also when a listener panics.
struct Draining<'a>(&'a AtomicBool);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for PresenceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceCache").field("entries", &self.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use chrono::TimeZone;
    use realtime::SystemClock;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).single().expect("valid date")
    }

    fn report(id: &str) -> VehicleReport {
        VehicleReport::new(id, -36.85, 174.76, t0()).expect("valid report")
    }

    fn recording_cache() -> (PresenceCache, Arc<Mutex<Vec<PresenceChange>>>) {
        let publisher = Arc::new(Publisher::new());
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        publisher.subscribe(move |n| {
            if let Notification::Presence(change) = n {
                sink.lock().expect("should lock").push(change.clone());
            }
        });
        (PresenceCache::new(publisher, Arc::new(SystemClock)), changes)
    }

    #[test]
    fn same_report_twice() {
        let (cache, changes) = recording_cache();

        assert_eq!(cache.upsert_at(report("V1"), t0()), Upserted::Added);
        let first = cache.snapshot();
        assert_eq!(cache.upsert_at(report("V1"), t0()), Upserted::Updated);

        assert_eq!(cache.snapshot(), first);
        assert_eq!(
            *changes.lock().expect("should lock"),
            vec![PresenceChange::Added(report("V1")), PresenceChange::Updated(report("V1"))]
        );
    }

    #[test]
    fn last_write_wins_by_arrival() {
        let (cache, _) = recording_cache();
        let newer = VehicleReport::new("V1", 1.0, 1.0, t0()).expect("valid report");
        let older_embedded = VehicleReport::new("V1", 2.0, 2.0, t0() - TimeDelta::hours(1))
            .expect("valid report");

        cache.upsert_at(newer, t0());
        cache.upsert_at(older_embedded.clone(), t0() + TimeDelta::seconds(1));

        assert_eq!(cache.get("V1"), Some(older_embedded));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_removes_only_stale() {
        let (cache, changes) = recording_cache();
        cache.upsert_at(report("V1"), t0());
        cache.upsert_at(report("V2"), t0() + TimeDelta::minutes(3));
        cache.upsert_at(report("V3"), t0() - TimeDelta::minutes(1));

        let now = t0() + TimeDelta::minutes(5) + TimeDelta::seconds(1);
        let removed = cache.sweep(now, Duration::from_secs(300));

        assert_eq!(removed, vec!["V1".to_string(), "V3".to_string()]);
        assert_eq!(cache.snapshot().keys().collect::<Vec<_>>(), vec!["V2"]);
        for id in cache.snapshot().keys() {
            let age = now - cache.received_at(id).expect("present");
            assert!(age <= TimeDelta::minutes(5));
        }

        let changes = changes.lock().expect("should lock");
        assert_eq!(
            changes.last(),
            Some(&PresenceChange::Removed(vec!["V1".to_string(), "V3".to_string()]))
        );
    }

    #[test]
    fn sweep_keeps_entry_exactly_at_threshold() {
        let (cache, _) = recording_cache();
        cache.upsert_at(report("V1"), t0());

        let removed = cache.sweep(t0() + TimeDelta::minutes(5), Duration::from_secs(300));
        assert!(removed.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn empty_sweep_is_silent() {
        let (cache, changes) = recording_cache();
        cache.upsert_at(report("V1"), t0());
        changes.lock().expect("should lock").clear();

        cache.sweep(t0(), Duration::from_secs(300));
        assert!(changes.lock().expect("should lock").is_empty());
    }

    #[test]
    fn clear_notifies_once() {
        let (cache, changes) = recording_cache();
        cache.upsert_at(report("V1"), t0());
        cache.upsert_at(report("V2"), t0());

        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
        assert_eq!(changes.lock().expect("should lock").last(), Some(&PresenceChange::Cleared(2)));
    }

    #[test]
    fn route_snapshot() {
        let (cache, _) = recording_cache();
        cache.upsert_at(report("V1").with_route(Some("NX1".to_string())), t0());
        cache.upsert_at(report("V2").with_route(Some("70".to_string())), t0());
        cache.upsert_at(report("V3"), t0());

        let on_route = cache.snapshot_for_route("NX1");
        assert_eq!(on_route.keys().collect::<Vec<_>>(), vec!["V1"]);
    }

    #[test]
    fn listener_may_read_the_cache() {
        let publisher = Arc::new(Publisher::new());
        let cache = Arc::new(PresenceCache::new(Arc::clone(&publisher), Arc::new(SystemClock)));
        let sizes = Arc::new(Mutex::new(Vec::new()));

        let reader = Arc::clone(&cache);
        let sink = Arc::clone(&sizes);
        publisher.subscribe(move |_| sink.lock().expect("should lock").push(reader.len()));

        cache.upsert(report("V1"));
        cache.upsert(report("V2"));
        assert_eq!(*sizes.lock().expect("should lock"), vec![1, 2]);
    }

    #[test]
    fn change_made_by_a_listener_follows_its_cause() {
        let publisher = Arc::new(Publisher::new());
        let cache = Arc::new(PresenceCache::new(Arc::clone(&publisher), Arc::new(SystemClock)));

        let writer = Arc::downgrade(&cache);
        publisher.subscribe(move |n| match n {
            Notification::Presence(PresenceChange::Added(r)) if r.vehicle_id() == "V1" => {
                if let Some(cache) = writer.upgrade() {
                    cache.upsert_at(report("V2"), t0());
                }
            }
            _ => {}
        });
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        publisher.subscribe(move |n| {
            if let Notification::Presence(change) = n {
                sink.lock().expect("should lock").push(change.clone());
            }
        });

        cache.upsert_at(report("V1"), t0());

        assert_eq!(
            *changes.lock().expect("should lock"),
            vec![PresenceChange::Added(report("V1")), PresenceChange::Added(report("V2"))]
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn listeners_see_changes_in_mutation_order() {
        let publisher = Arc::new(Publisher::new());
        let cache = Arc::new(PresenceCache::new(Arc::clone(&publisher), Arc::new(SystemClock)));

        // a consumer rebuilding the vehicle set from notifications alone
        let mirror = Arc::new(Mutex::new(HashSet::new()));
        let sink = Arc::clone(&mirror);
        publisher.subscribe(move |n| {
            let mut mirror = sink.lock().expect("should lock");
            match n {
                Notification::Presence(
                    PresenceChange::Added(r) | PresenceChange::Updated(r),
                ) => {
                    mirror.insert(r.vehicle_id().to_string());
                }
                Notification::Presence(PresenceChange::Removed(ids)) => {
                    for id in ids {
                        mirror.remove(id);
                    }
                }
                Notification::Presence(PresenceChange::Cleared(_)) => mirror.clear(),
                Notification::Connection(_) => {}
            }
        });

        let done = Arc::new(AtomicBool::new(false));
        let sweeper = {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    cache.sweep(t0() + TimeDelta::hours(1), Duration::from_secs(300));
                }
            })
        };
        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..500 {
                    cache.upsert_at(report(&format!("V{:02}", i % 20)), t0());
                }
            })
        };

        writer.join().expect("writer should finish");
        done.store(true, Ordering::SeqCst);
        sweeper.join().expect("sweeper should finish");

        let expected: HashSet<String> = cache.snapshot().into_keys().collect();
        assert_eq!(*mirror.lock().expect("should lock"), expected);
    }

    #[test]
    fn snapshots_never_see_partial_state() {
        let publisher = Arc::new(Publisher::new());
        let cache = Arc::new(PresenceCache::new(publisher, Arc::new(SystemClock)));
        let total = 500;

        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..total {
                    cache.upsert_at(report(&format!("V{i:04}")), t0());
                }
            })
        };

        let reader = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let mut last = 0;
                while last < total {
                    let snapshot = cache.snapshot();
                    // sequential inserts: any snapshot is a prefix V0000..V{n-1}
                    for i in 0..snapshot.len() {
                        assert!(snapshot.contains_key(&format!("V{i:04}")));
                    }
                    assert!(snapshot.len() >= last);
                    last = snapshot.len();
                }
            })
        };

        writer.join().expect("writer should finish");
        reader.join().expect("reader should finish");
        assert_eq!(cache.len(), total);
    }
}
