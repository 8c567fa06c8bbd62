//! Shared type definitions for the sensorcast workspace.
//!
//! This crate is the single source of truth for the telemetry record that
//! flows from the ingestion side to the publish side, and for the JSON wire
//! format consumers of the published subject rely on.
//!
//! # Modules
//!
//! - [`channel`] -- Telemetry channels, platform sensor kinds, and the
//!   single-field [`ChannelUpdate`] applied to the snapshot store
//! - [`snapshot`] -- The [`Snapshot`] record and its wire encoding
//! - [`geohash`] -- Base-32 geohash encoding for the optional `geohash` field

pub mod channel;
pub mod geohash;
pub mod snapshot;

pub use channel::{Channel, ChannelUpdate, SensorKind};
pub use snapshot::{Axis3, DEFAULT_DEVICE_NAME, GpsCoords, Snapshot, WireError};
