//! Environment configuration for the presence subsystem.
//!
//! Every variable is optional; unset or unreadable values fall back to the
//! documented defaults.

use std::time::Duration;

use vehicle_presence::{
    Config, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_RECONNECT_DELAY, DEFAULT_STALE_AFTER,
    DEFAULT_SWEEP_INTERVAL, Topics,
};

/// Build the presence configuration from `PRESENCE_*` environment variables.
#[must_use]
pub fn from_env() -> Config {
    let defaults = Topics::default();

    Config {
        endpoint: get_bus_endpoint(),
        topics: Topics {
            global: get_global_topics().unwrap_or(defaults.global),
            scoped_template: get_scoped_topic().unwrap_or(defaults.scoped_template),
            scope: get_scope(),
        },
        stale_after: get_secs("PRESENCE_STALE_AFTER_SECS", DEFAULT_STALE_AFTER),
        sweep_interval: get_secs("PRESENCE_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL),
        reconnect_delay: get_secs("PRESENCE_RECONNECT_DELAY_SECS", DEFAULT_RECONNECT_DELAY),
        handshake_timeout: get_secs("PRESENCE_HANDSHAKE_TIMEOUT_SECS", DEFAULT_HANDSHAKE_TIMEOUT),
    }
}

pub fn get_bus_endpoint() -> String {
    std::env::var("PRESENCE_BUS_ENDPOINT").unwrap_or_else(|_| {
        let default = Config::default().endpoint;
        tracing::trace!("PRESENCE_BUS_ENDPOINT not set, using default: {default}");
        default
    })
}

/// Comma separated topic patterns.
pub fn get_global_topics() -> Option<Vec<String>> {
    let Ok(value) = std::env::var("PRESENCE_GLOBAL_TOPICS") else {
        tracing::trace!("PRESENCE_GLOBAL_TOPICS not set, using default");
        return None;
    };
    Some(parse_list(&value))
}

pub fn get_scoped_topic() -> Option<String> {
    std::env::var("PRESENCE_SCOPED_TOPIC").ok().or_else(|| {
        tracing::trace!("PRESENCE_SCOPED_TOPIC not set, using default");
        None
    })
}

pub fn get_scope() -> Option<String> {
    std::env::var("PRESENCE_SCOPE")
        .ok()
        .map(|scope| scope.trim().to_string())
        .filter(|scope| !scope.is_empty())
}

/// Client name sent in the bus handshake.
pub fn get_client_name() -> String {
    std::env::var("PRESENCE_CLIENT_NAME").unwrap_or_else(|_| {
        let default = env!("CARGO_PKG_NAME").to_string();
        tracing::trace!("PRESENCE_CLIENT_NAME not set, using default: {default}");
        default
    })
}

fn get_secs(key: &str, default: Duration) -> Duration {
    let Ok(value) = std::env::var(key) else {
        tracing::trace!("{key} not set, using default: {}s", default.as_secs());
        return default;
    };
    parse_secs(&value).unwrap_or_else(|| {
        tracing::warn!("{key} is not a whole number of seconds: {value:?}, using default");
        default
    })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_secs(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
