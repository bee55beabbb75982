//! Viewport geometry, the dedupe/cache key derived from it, and the hazard
//! dataset fetched for it.

use std::fmt;

use chrono::{DateTime, Utc};
use geojson::{feature::Id, Feature, FeatureCollection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::event::{Coordinate, ValidationError, Zoom};
use crate::UnixTimeMs;

/// Epoch numbers below this are read as seconds rather than milliseconds.
const EPOCH_SECONDS_CUTOFF: i64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ViewportError {
    #[error("invalid viewport bounds: {reason}")]
    InvalidBounds { reason: String },

    #[error("invalid hazard feature: {reason}")]
    InvalidFeature { reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Visible rectangle in degrees. `west > east` means the view crosses the
/// antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportBounds {
    south: f64,
    west: f64,
    north: f64,
    east: f64,
}

impl ViewportBounds {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Result<Self, ViewportError> {
        if ![south, west, north, east].iter().all(|v| v.is_finite()) {
            return Err(ViewportError::InvalidBounds {
                reason: format!("non-finite edge in ({south}, {west}, {north}, {east})"),
            });
        }
        let south = south.clamp(-90.0, 90.0);
        let north = north.clamp(-90.0, 90.0);
        if south > north {
            return Err(ViewportError::InvalidBounds {
                reason: format!("south {south} is above north {north}"),
            });
        }
        Ok(Self {
            south,
            west: west.clamp(-180.0, 180.0),
            north,
            east: east.clamp(-180.0, 180.0),
        })
    }

    pub fn south(&self) -> f64 {
        self.south
    }
    pub fn west(&self) -> f64 {
        self.west
    }
    pub fn north(&self) -> f64 {
        self.north
    }
    pub fn east(&self) -> f64 {
        self.east
    }
}

/// Quantized `(south, west, north, east, zoom)`. Float jitter below the
/// configured precision maps to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewportKey {
    pub south: i64,
    pub west: i64,
    pub north: i64,
    pub east: i64,
    pub zoom: i32,
    precision: u32,
}

impl ViewportKey {
    #[must_use]
    pub fn from_viewport(bounds: &ViewportBounds, zoom: Zoom, precision: u32) -> Self {
        let scale = 10f64.powi(i32::try_from(precision).unwrap_or(i32::MAX));
        Self {
            south: quantize(bounds.south, scale),
            west: quantize(bounds.west, scale),
            north: quantize(bounds.north, scale),
            east: quantize(bounds.east, scale),
            zoom: round_zoom(zoom),
            precision,
        }
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }
}

#[allow(clippy::cast_possible_truncation)]
fn quantize(value: f64, scale: f64) -> i64 {
    (value * scale).round() as i64
}

#[allow(clippy::cast_possible_truncation)]
fn round_zoom(zoom: Zoom) -> i32 {
    // Zoom is validated to 0..=24.
    zoom.value().round() as i32
}

impl fmt::Display for ViewportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{},{}]@z{}/p{}",
            self.south, self.west, self.north, self.east, self.zoom, self.precision
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Unknown,
    Normal,
    Advisory,
    Warning,
    Critical,
}

impl Severity {
    /// Any case; unrecognised levels are [`Severity::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Self::Normal,
            "advisory" => Self::Advisory,
            "warning" => Self::Warning,
            "critical" => Self::Critical,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Normal => "normal",
            Self::Advisory => "advisory",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// One monitoring station or sensor in the overlay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HazardPoint {
    pub id: Option<String>,
    pub name: Option<String>,
    pub coordinate: Coordinate,
    pub severity: Severity,
    pub last_measured: Option<DateTime<Utc>>,
}

impl HazardPoint {
    pub fn from_feature(feature: &Feature) -> Result<Self, ViewportError> {
        let geometry = feature
            .geometry
            .as_ref()
            .ok_or_else(|| ViewportError::InvalidFeature {
                reason: "feature has no geometry".into(),
            })?;

        let coordinate = match &geometry.value {
            geojson::Value::Point(position) if position.len() >= 2 => {
                // GeoJSON positions are [lng, lat].
                Coordinate::new(position[1], position[0])?
            }
            other => {
                return Err(ViewportError::InvalidFeature {
                    reason: format!("unsupported geometry {}", geometry_name(other)),
                })
            }
        };

        let empty = Map::new();
        let props = feature.properties.as_ref().unwrap_or(&empty);

        let id = match &feature.id {
            Some(Id::String(s)) => Some(s.clone()),
            Some(Id::Number(n)) => Some(n.to_string()),
            None => first_of(props, &["id", "stationId"]).and_then(json_to_string),
        };
        let name = props.get("name").and_then(Value::as_str).map(str::to_string);
        let severity = props
            .get("severity")
            .and_then(Value::as_str)
            .map_or(Severity::Unknown, Severity::parse);
        let last_measured = first_of(props, &["lastMeasured", "timestamp"]).and_then(parse_timestamp);

        Ok(Self {
            id,
            name,
            coordinate,
            severity,
            last_measured,
        })
    }
}

fn geometry_name(value: &geojson::Value) -> &'static str {
    match value {
        geojson::Value::Point(_) => "Point",
        geojson::Value::MultiPoint(_) => "MultiPoint",
        geojson::Value::LineString(_) => "LineString",
        geojson::Value::MultiLineString(_) => "MultiLineString",
        geojson::Value::Polygon(_) => "Polygon",
        geojson::Value::MultiPolygon(_) => "MultiPolygon",
        geojson::Value::GeometryCollection(_) => "GeometryCollection",
    }
}

fn first_of<'a>(props: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| props.get(*k))
        .filter(|v| !v.is_null())
}

fn json_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw.unsigned_abs() < EPOCH_SECONDS_CUTOFF.unsigned_abs() {
                DateTime::from_timestamp(raw, 0)
            } else {
                DateTime::from_timestamp_millis(raw)
            }
        }
        _ => None,
    }
}

/// Rendered hazard dataset for one viewport key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HazardOverlay {
    pub key: ViewportKey,
    pub points: Vec<HazardPoint>,
    /// Features dropped because they were not usable points.
    pub skipped: usize,
    pub fetched_at: UnixTimeMs,
}

impl HazardOverlay {
    pub fn from_feature_collection(key: ViewportKey, collection: &FeatureCollection) -> Self {
        let mut points = Vec::with_capacity(collection.features.len());
        let mut skipped = 0;
        for feature in &collection.features {
            match HazardPoint::from_feature(feature) {
                Ok(point) => points.push(point),
                Err(e) => {
                    skipped += 1;
                    debug!(error = %e, "skipping hazard feature");
                }
            }
        }

        Self {
            key,
            points,
            skipped,
            fetched_at: UnixTimeMs::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn highest_severity(&self) -> Severity {
        self.points
            .iter()
            .map(|p| p.severity)
            .max()
            .unwrap_or_default()
    }
}
