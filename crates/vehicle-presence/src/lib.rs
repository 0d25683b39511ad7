//! # Vehicle Presence
//!
//! Live vehicle presence for fleet screens. Position reports arrive over a
//! publish/subscribe telemetry bus in several payload shapes; they are
//! normalized into [`VehicleReport`]s, kept in an in-memory cache holding the
//! latest report per vehicle, and evicted once they go stale. Consumers read
//! snapshots and subscribe to change notifications through [`LivePresence`].

mod cache;
mod config;
mod connection;
mod ingest;
mod models;
pub mod normalizer;
mod presence;
mod publisher;
mod sweeper;

pub use self::cache::{PresenceCache, Upserted};
pub use self::config::*;
pub use self::connection::{ConnectionManager, StatusBoard};
pub use self::ingest::{Ingest, IngestOutcome};
pub use self::models::*;
pub use self::normalizer::{Field, RejectReason, Rejection};
pub use self::presence::{LivePresence, PresenceView};
pub use self::publisher::*;
