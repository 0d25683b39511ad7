use std::sync::Arc;

use realtime::{Clock, Delivery};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{PresenceCache, Upserted};
use crate::normalizer::{self, Rejection};

/// Result of pushing one bus delivery through decode, normalize and upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied(Upserted),
    Rejected(Rejection),
    Undecodable(String),
}

/// The receive-side pipeline shared by every subscription.
#[derive(Clone)]
pub struct Ingest {
    cache: Arc<PresenceCache>,
    clock: Arc<dyn Clock>,
}

impl Ingest {
    #[must_use]
    pub fn new(cache: Arc<PresenceCache>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// Apply one delivery to the cache. Bad payloads are logged and dropped;
    /// nothing here can fail the connection.
    pub fn handle(&self, delivery: &Delivery) -> IngestOutcome {
        let received_at = self.clock.now_utc();

        let body: Value = match serde_json::from_slice(&delivery.payload) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    monotonic_counter.presence_undecodable = 1,
                    topic = %delivery.topic,
                    error = %err,
                    "dropping undecodable message"
                );
                return IngestOutcome::Undecodable(err.to_string());
            }
        };

        match normalizer::normalize(&body, received_at) {
            Ok(report) => {
                let vehicle = report.vehicle_id().to_string();
                let upserted = self.cache.upsert_at(report, received_at);
                debug!(
                    monotonic_counter.presence_reports = 1,
                    topic = %delivery.topic,
                    vehicle = %vehicle,
                    outcome = ?upserted,
                    "vehicle report applied"
                );
                IngestOutcome::Applied(upserted)
            }
            Err(rejection) => {
                warn!(
                    monotonic_counter.presence_rejected = 1,
                    topic = %delivery.topic,
                    reason = %rejection.reason(),
                    fields = ?rejection.fields(),
                    "rejected vehicle report: {rejection}"
                );
                IngestOutcome::Rejected(rejection)
            }
        }
    }
}

impl std::fmt::Debug for Ingest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingest").field("cache", &self.cache).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use realtime::SystemClock;

    use super::*;
    use crate::normalizer::RejectReason;
    use crate::publisher::Publisher;

    fn ingest() -> (Ingest, Arc<PresenceCache>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(PresenceCache::new(Arc::new(Publisher::new()), Arc::clone(&clock)));
        (Ingest::new(Arc::clone(&cache), clock), cache)
    }

    #[test]
    fn mobile_payload_lands_in_cache() {
        let (ingest, cache) = ingest();
        let delivery =
            Delivery::new("vehicles/V1/position", r#"{"vehicleId":"V1","lat":4.61,"lon":-74.08}"#);

        assert_eq!(ingest.handle(&delivery), IngestOutcome::Applied(Upserted::Added));

        let report = cache.get("V1").expect("cached");
        assert!((report.latitude() - 4.61).abs() < 1e-9);
        assert!((report.longitude() + 74.08).abs() < 1e-9);
    }

    #[test]
    fn transport_metadata_leaves_cache_untouched() {
        let (ingest, cache) = ingest();
        let delivery = Delivery::new("vehicles/V1/position", r#"{"topic":"x","qos":0}"#);

        let IngestOutcome::Rejected(rejection) = ingest.handle(&delivery) else {
            panic!("expected a rejection");
        };
        assert_eq!(rejection.reason(), RejectReason::NotAPayload);
        assert!(cache.is_empty());
    }

    #[test]
    fn garbage_bytes_are_dropped() {
        let (ingest, cache) = ingest();
        let delivery = Delivery::new("vehicles/V1/position", &b"\x00\x9f not json"[..]);

        assert!(matches!(ingest.handle(&delivery), IngestOutcome::Undecodable(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn receipt_time_stamps_the_entry() {
        let (ingest, cache) = ingest();
        let before = chrono::Utc::now();
        let delivery = Delivery::new(
            "vehicles/V1/position",
            r#"{"vehicleId":"V1","lat":1,"lon":1,"timestamp":"2001-01-01T00:00:00Z"}"#,
        );
        ingest.handle(&delivery);

        let received_at = cache.received_at("V1").expect("cached");
        assert!(received_at >= before);
    }
}
