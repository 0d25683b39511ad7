//! # Provider
//!
//! Provider defines external data interfaces for the crate.

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A single message handed over by the telemetry bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

impl Delivery {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { topic: topic.into(), payload: payload.into() }
    }
}

/// The `Transport` trait opens sessions against a publish/subscribe bus.
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    /// Perform the transport handshake with the bus at `endpoint`.
    fn connect(&self, endpoint: &str) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// An established bus session.
///
/// Errors returned by any method are connection-level: the caller abandons
/// the session and reconnects. Per-message problems are not errors here;
/// transports skip frames they cannot read and the consumer drops payloads it
/// cannot decode.
pub trait Session: Send + 'static {
    /// Subscribe to a topic pattern.
    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result<()>> + Send;

    /// Drop a previously issued subscription.
    fn unsubscribe(&mut self, topic: &str) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next delivery. `Ok(None)` means the bus closed the
    /// session cleanly.
    ///
    /// Must be cancel safe: the caller drops the future to handle commands
    /// and calls again, and no delivery may be lost in between.
    fn next(&mut self) -> impl Future<Output = Result<Option<Delivery>>> + Send;

    /// Close the session.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Source of wall-clock time for receipt stamps and staleness checks.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
