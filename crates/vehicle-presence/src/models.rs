use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::normalizer::{Field, Rejection};

/// Validated position record for one vehicle at one point in time.
///
/// Only constructed through [`VehicleReport::new`] (or the normalizer, which
/// calls it), so every instance carries a non-empty id and in-range
/// coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleReport {
    vehicle_id: String,
    timestamp: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
}

impl VehicleReport {
    /// Build a report, validating the id and both coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InvalidFields`] listing every field that failed.
    pub fn new(
        vehicle_id: impl Into<String>, latitude: f64, longitude: f64, timestamp: DateTime<Utc>,
    ) -> Result<Self, Rejection> {
        let vehicle_id = vehicle_id.into().trim().to_string();

        let mut failed = Vec::new();
        if vehicle_id.is_empty() {
            failed.push(Field::VehicleId);
        }
        if !valid_latitude(latitude) {
            failed.push(Field::Latitude);
        }
        if !valid_longitude(longitude) {
            failed.push(Field::Longitude);
        }
        if !failed.is_empty() {
            return Err(Rejection::InvalidFields(failed));
        }

        Ok(Self {
            vehicle_id,
            timestamp,
            latitude,
            longitude,
            source: Source::Unknown,
            route_id: None,
            heading: None,
            speed: None,
        })
    }

    #[must_use]
    pub const fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_route(mut self, route_id: Option<String>) -> Self {
        self.route_id = route_id.filter(|id| !id.trim().is_empty());
        self
    }

    /// Attach heading and speed; non-finite values are dropped.
    #[must_use]
    pub fn with_motion(mut self, heading: Option<f64>, speed: Option<f64>) -> Self {
        self.heading = heading.filter(|value| value.is_finite());
        self.speed = speed.filter(|value| value.is_finite());
        self
    }

    #[must_use]
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub const fn latitude(&self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub const fn longitude(&self) -> f64 {
        self.longitude
    }

    #[must_use]
    pub const fn source(&self) -> Source {
        self.source
    }

    #[must_use]
    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    #[must_use]
    pub const fn heading(&self) -> Option<f64> {
        self.heading
    }

    #[must_use]
    pub const fn speed(&self) -> Option<f64> {
        self.speed
    }
}

fn valid_latitude(value: f64) -> bool {
    value.is_finite() && (-90.0..=90.0).contains(&value)
}

fn valid_longitude(value: f64) -> bool {
    value.is_finite() && (-180.0..=180.0).contains(&value)
}

/// Provenance of a report. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Device,
    Mobile,
    #[default]
    Unknown,
}

impl Source {
    /// Case-insensitive parse; anything unrecognised is `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "device" => Self::Device,
            "mobile" => Self::Mobile,
            _ => Self::Unknown,
        }
    }
}

/// Lifecycle of the bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Disconnected -> Reconnecting` is the failure path; explicit stops go
    /// straight to `Disconnected` and stay there.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting | Self::Reconnecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected | Self::Reconnecting, Self::Disconnected)
                | (Self::Reconnecting, Self::Connecting)
        )
    }

    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Connection state plus the diagnostics a UI needs for a degraded-state
/// indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn new(state: ConnectionState, since: DateTime<Utc>) -> Self {
        Self { state, last_error: None, since }
    }
}
