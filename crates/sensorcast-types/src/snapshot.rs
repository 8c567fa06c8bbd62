//! The published telemetry record.
//!
//! A [`Snapshot`] is an immutable copy of the latest value of every channel.
//! Field names and nesting are part of the wire contract: consumers of the
//! publish subject decode exactly this JSON shape.

use serde::{Deserialize, Serialize};

/// Device label used when none is configured.
pub const DEFAULT_DEVICE_NAME: &str = "laptop";

/// Errors produced while encoding or decoding the wire format.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The snapshot could not be serialized.
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    /// The payload is not a valid snapshot document.
    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] serde_json::Error),
}

/// One 3-axis sensor reading in raw sensor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Axis3 {
    /// X axis component.
    pub x: f32,
    /// Y axis component.
    pub y: f32,
    /// Z axis component.
    pub z: f32,
}

impl Axis3 {
    /// Create a reading from its three components.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Build a reading from a platform value slice.
    ///
    /// Returns `None` when fewer than three components are present. Extra
    /// components (some platforms append accuracy or bias terms) are ignored.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        match values {
            [x, y, z, ..] => Some(Self::new(*x, *y, *z)),
            _ => None,
        }
    }
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsCoords {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

impl GpsCoords {
    /// Create a coordinate pair.
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// One published telemetry record.
///
/// Serializes to:
///
/// ```json
/// {
///   "accelerometer": {"x": 0.0, "y": 0.0, "z": 0.0},
///   "gyroscope":     {"x": 0.0, "y": 0.0, "z": 0.0},
///   "magnetometer":  {"x": 0.0, "y": 0.0, "z": 0.0},
///   "gps":           {"lat": 0.0, "lon": 0.0},
///   "deviceName":    "laptop",
///   "geohash":       ""
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Latest accelerometer reading.
    pub accelerometer: Axis3,
    /// Latest gyroscope reading.
    pub gyroscope: Axis3,
    /// Latest magnetometer reading.
    pub magnetometer: Axis3,
    /// Latest location fix.
    pub gps: GpsCoords,
    /// Static device label.
    pub device_name: String,
    /// Geohash of `gps`, empty unless computed.
    #[serde(default)]
    pub geohash: String,
}

impl Snapshot {
    /// An all-zero record for the given device.
    pub fn empty(device_name: impl Into<String>) -> Self {
        Self {
            accelerometer: Axis3::default(),
            gyroscope: Axis3::default(),
            magnetometer: Axis3::default(),
            gps: GpsCoords::default(),
            device_name: device_name.into(),
            geohash: String::new(),
        }
    }

    /// Encode the record as the JSON wire document.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails.
    pub fn to_wire(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    /// Decode a JSON wire document.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Decode`] if the payload is not a snapshot.
    pub fn from_wire(payload: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(payload).map_err(WireError::Decode)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty(DEFAULT_DEVICE_NAME)
    }
}
