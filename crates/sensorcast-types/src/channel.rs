//! Telemetry channels and the updates that target them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::{Axis3, GpsCoords};

/// One named stream of readings held by the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Linear acceleration.
    Accelerometer,
    /// Angular rate.
    Gyroscope,
    /// Magnetic field strength.
    Magnetometer,
    /// Geographic position.
    Location,
}

impl Channel {
    /// Every channel, in wire order.
    pub const ALL: [Self; 4] = [
        Self::Accelerometer,
        Self::Gyroscope,
        Self::Magnetometer,
        Self::Location,
    ];

    /// Stable lowercase name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accelerometer => "accelerometer",
            Self::Gyroscope => "gyroscope",
            Self::Magnetometer => "magnetometer",
            Self::Location => "location",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write to exactly one field of the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelUpdate {
    /// New accelerometer reading.
    Accelerometer(Axis3),
    /// New gyroscope reading.
    Gyroscope(Axis3),
    /// New magnetometer reading.
    Magnetometer(Axis3),
    /// New location fix.
    Location(GpsCoords),
}

impl ChannelUpdate {
    /// The channel this update overwrites.
    pub const fn channel(&self) -> Channel {
        match self {
            Self::Accelerometer(_) => Channel::Accelerometer,
            Self::Gyroscope(_) => Channel::Gyroscope,
            Self::Magnetometer(_) => Channel::Magnetometer,
            Self::Location(_) => Channel::Location,
        }
    }
}

/// Sensor type as reported by the host platform.
///
/// Platforms expose many more sensors than the three motion channels this
/// workspace publishes; anything else arrives as [`SensorKind::Other`] and
/// is ignored by the ingestor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Accelerometer.
    Accelerometer,
    /// Gyroscope.
    Gyroscope,
    /// Magnetic field sensor.
    MagneticField,
    /// Any sensor this workspace does not publish.
    Other(String),
}

impl SensorKind {
    /// The motion sensors the publisher expects a host to provide.
    pub const MOTION: [Self; 3] = [Self::Accelerometer, Self::Gyroscope, Self::MagneticField];

    /// Parse a platform sensor name (case-insensitive).
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "accelerometer" | "acc" => Self::Accelerometer,
            "gyroscope" | "gyro" => Self::Gyroscope,
            "magnetometer" | "magnetic_field" | "magneto" => Self::MagneticField,
            _ => Self::Other(name.to_owned()),
        }
    }

    /// The snapshot channel fed by this sensor, if any.
    pub const fn channel(&self) -> Option<Channel> {
        match self {
            Self::Accelerometer => Some(Channel::Accelerometer),
            Self::Gyroscope => Some(Channel::Gyroscope),
            Self::MagneticField => Some(Channel::Magnetometer),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerometer => f.write_str("accelerometer"),
            Self::Gyroscope => f.write_str("gyroscope"),
            Self::MagneticField => f.write_str("magnetic_field"),
            Self::Other(name) => write!(f, "other({name})"),
        }
    }
}
