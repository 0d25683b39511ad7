use std::time::Duration;

use realtime::{Result, invalid_config};

/// Placeholder substituted with the route or trip id in the scoped topic.
pub const SCOPE_PLACEHOLDER: &str = "{scope}";

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Presence subsystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoint: String,
    pub topics: Topics,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:7420".to_string(),
            topics: Topics::default(),
            stale_after: DEFAULT_STALE_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl Config {
    /// Check the settings can drive a connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(invalid_config!("bus endpoint is empty"));
        }
        if self.topics.global.is_empty() && self.topics.scoped().is_none() {
            return Err(invalid_config!("no global topics and no scope to subscribe to"));
        }
        if self.topics.global.iter().any(|topic| topic.trim().is_empty()) {
            return Err(invalid_config!("global topic list contains an empty entry"));
        }
        if !self.topics.scoped_template.contains(SCOPE_PLACEHOLDER) {
            return Err(invalid_config!(
                "scoped topic `{}` has no {} placeholder",
                self.topics.scoped_template,
                SCOPE_PLACEHOLDER
            ));
        }
        for (name, value) in [
            ("stale_after", self.stale_after),
            ("sweep_interval", self.sweep_interval),
            ("reconnect_delay", self.reconnect_delay),
            ("handshake_timeout", self.handshake_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid_config!("{} must be greater than zero", name));
            }
        }
        Ok(())
    }
}

/// Topic patterns: wildcard topics carrying every vehicle, and an optional
/// scoped topic for the route or trip a consumer is focused on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub global: Vec<String>,
    pub scoped_template: String,
    pub scope: Option<String>,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            global: vec!["vehicles/+/position".to_string()],
            scoped_template: format!("routes/{SCOPE_PLACEHOLDER}/vehicles/+/position"),
            scope: None,
        }
    }
}

impl Topics {
    /// The concrete scoped topic, when a scope is set.
    #[must_use]
    pub fn scoped(&self) -> Option<String> {
        self.scope
            .as_deref()
            .map(str::trim)
            .filter(|scope| !scope.is_empty())
            .map(|scope| self.scoped_template.replace(SCOPE_PLACEHOLDER, scope))
    }

    /// Every topic a fresh session subscribes to, global first.
    #[must_use]
    pub fn all(&self) -> Vec<String> {
        let mut topics = self.global.clone();
        if let Some(scoped) = self.scoped() {
            topics.push(scoped);
        }
        topics
    }
}
