//! # Fleet Presence
//!
//! Live vehicle presence over a line-JSON telemetry bus, configured from the
//! environment.
//!
//! ```rust,ignore
//! let presence = fleet_presence::connect_from_env()?;
//! presence.subscribe(|notification| tracing::info!(?notification));
//! presence.start();
//! ```

pub mod config;
mod transport;

pub use realtime::{Error, Result};
pub use vehicle_presence::*;

pub use self::transport::{TcpBus, TcpSession};

/// Presence subsystem wired to the TCP bus, configured from `PRESENCE_*`
/// environment variables. Call [`LivePresence::start`] to connect.
///
/// # Errors
///
/// Returns `Error::InvalidConfig` when the environment yields an unusable
/// configuration.
pub fn connect_from_env() -> Result<LivePresence<TcpBus>> {
    let config = config::from_env();
    let bus = TcpBus::new(config::get_client_name(), config.handshake_timeout);
    LivePresence::new(config, bus)
}
