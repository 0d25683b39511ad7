//! # Realtime Core
//!
//! Core modules shared by the vehicle presence crates: the error type and the
//! traits describing the telemetry bus and the clock.

mod error;
mod provider;

pub use crate::error::*;
pub use crate::provider::*;
