//! Turns decoded bus payloads of varying shape into [`VehicleReport`]s.
//!
//! Senders disagree on payload layout. Each known layout is a [`Shape`]: a
//! predicate and an extractor. Shapes are tried in order and the first match
//! wins; a payload no shape recognises is rejected.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::{Source, VehicleReport};

/// Keys that mark a transport framing envelope rather than a report.
const TRANSPORT_MARKERS: [&str; 4] = ["topic", "qos", "retain", "dup"];

const LATITUDE_KEYS: [&str; 2] = ["latitude", "lat"];
const LONGITUDE_KEYS: [&str; 2] = ["longitude", "lon"];

/// Epoch values at or above this are taken as milliseconds.
const MILLIS_THRESHOLD: f64 = 1e11;

/// Why a payload did not become a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Not a position report at all (framing envelope, empty batch, scalar).
    NotAPayload(String),
    /// A report whose listed fields are missing or out of range.
    InvalidFields(Vec<Field>),
}

impl Rejection {
    #[must_use]
    pub const fn reason(&self) -> RejectReason {
        match self {
            Self::NotAPayload(_) => RejectReason::NotAPayload,
            Self::InvalidFields(_) => RejectReason::InvalidFields,
        }
    }

    /// Fields that failed validation; empty for `NotAPayload`.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        match self {
            Self::NotAPayload(_) => &[],
            Self::InvalidFields(fields) => fields,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAPayload(detail) => write!(f, "{}: {detail}", self.reason()),
            Self::InvalidFields(fields) => {
                let names = fields.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "{}: {}", self.reason(), names.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    NotAPayload,
    InvalidFields,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAPayload => f.write_str("NOT_A_PAYLOAD"),
            Self::InvalidFields => f.write_str("INVALID_FIELDS"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    VehicleId,
    Latitude,
    Longitude,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VehicleId => f.write_str("vehicleId"),
            Self::Latitude => f.write_str("latitude"),
            Self::Longitude => f.write_str("longitude"),
        }
    }
}

type Object = Map<String, Value>;

/// A recognised payload layout.
struct Shape {
    name: &'static str,
    matches: fn(&Object) -> bool,
    extract: fn(&Object, DateTime<Utc>) -> Result<VehicleReport, Rejection>,
}

const SHAPES: [Shape; 3] = [
    Shape { name: "transport_envelope", matches: is_transport_envelope, extract: reject_envelope },
    Shape { name: "canonical", matches: has_canonical_coordinates, extract: extract_report },
    Shape { name: "mobile", matches: has_mobile_coordinates, extract: extract_report },
];

/// Normalize a decoded message body received at `received_at`.
///
/// # Errors
///
/// Returns a [`Rejection`] for anything that is not a valid position report.
/// Malformed input is an expected outcome, never a panic.
pub fn normalize(body: &Value, received_at: DateTime<Utc>) -> Result<VehicleReport, Rejection> {
    // some senders wrap a single report in an array
    let body = match body {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| Rejection::NotAPayload("empty array".to_string()))?,
        other => other,
    };

    let Value::Object(object) = body else {
        return Err(Rejection::NotAPayload(format!("expected an object, got {}", kind(body))));
    };

    for shape in &SHAPES {
        if (shape.matches)(object) {
            tracing::trace!(shape = shape.name, "payload shape matched");
            return (shape.extract)(object, received_at);
        }
    }

    Err(reject_unmatched(object))
}

fn is_transport_envelope(object: &Object) -> bool {
    TRANSPORT_MARKERS.iter().any(|key| object.contains_key(*key))
}

fn has_canonical_coordinates(object: &Object) -> bool {
    object.contains_key("latitude") || object.contains_key("longitude")
}

fn has_mobile_coordinates(object: &Object) -> bool {
    object.contains_key("lat") || object.contains_key("lon")
}

fn reject_envelope(object: &Object, _: DateTime<Utc>) -> Result<VehicleReport, Rejection> {
    let markers = TRANSPORT_MARKERS
        .iter()
        .filter(|key| object.contains_key(**key))
        .copied()
        .collect::<Vec<_>>();
    Err(Rejection::NotAPayload(format!("transport metadata ({})", markers.join(", "))))
}

fn reject_unmatched(object: &Object) -> Rejection {
    let mut fields = Vec::with_capacity(3);
    if vehicle_id(object).is_none() {
        fields.push(Field::VehicleId);
    }
    fields.push(Field::Latitude);
    fields.push(Field::Longitude);
    Rejection::InvalidFields(fields)
}

fn extract_report(
    object: &Object, received_at: DateTime<Utc>,
) -> Result<VehicleReport, Rejection> {
    let id = vehicle_id(object).unwrap_or_default();
    let latitude = first_present(object, &LATITUDE_KEYS).and_then(number).unwrap_or(f64::NAN);
    let longitude = first_present(object, &LONGITUDE_KEYS).and_then(number).unwrap_or(f64::NAN);
    let timestamp = object.get("timestamp").and_then(parse_timestamp).unwrap_or(received_at);

    let source =
        object.get("source").and_then(Value::as_str).map_or(Source::Unknown, Source::parse);
    let route_id = object.get("routeId").and_then(identifier);
    let heading = first_present(object, &["heading", "bearing"]).and_then(number);
    let speed = object.get("speed").and_then(number);

    let report = VehicleReport::new(id, latitude, longitude, timestamp)?
        .with_source(source)
        .with_route(route_id)
        .with_motion(heading, speed);
    Ok(report)
}

fn vehicle_id(object: &Object) -> Option<String> {
    object.get("vehicleId").and_then(identifier).filter(|id| !id.trim().is_empty())
}

/// Strings as-is, integers rendered in decimal.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

fn first_present<'a>(object: &'a Object, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|key| object.get(*key)).find(|value| !value.is_null())
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// RFC 3339 strings, or unix seconds/milliseconds as numbers or numeric
/// strings.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Value::String(s) = value
        && let Ok(dt) = DateTime::parse_from_rfc3339(s.trim())
    {
        return Some(dt.with_timezone(&Utc));
    }
    from_epoch(number(value)?)
}

#[allow(clippy::cast_possible_truncation)]
fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    if value.abs() >= MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value as i64)
    } else {
        DateTime::from_timestamp(value as i64, 0)
    }
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
