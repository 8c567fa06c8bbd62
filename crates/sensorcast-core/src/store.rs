//! Latest-value store for all telemetry channels.
//!
//! The store is the only mutable state shared between event sources and the
//! publish scheduler. One [`Mutex`] guards the whole record; it is held for a
//! single field assignment or a snapshot copy and never across I/O or an
//! `.await`, so a reader always sees each `(x, y, z)` triple exactly as one
//! update wrote it.
//!
//! A poisoned lock is recovered rather than propagated: the record is plain
//! `Copy` data, so a panic in another holder cannot leave it half-written.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use sensorcast_types::{Axis3, Channel, ChannelUpdate, GpsCoords, Snapshot, geohash};

/// Staleness information for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFreshness {
    /// When the channel was last written, if ever.
    pub updated_at: Option<DateTime<Utc>>,
    /// Number of updates applied since the store was created.
    pub updates: u64,
}

impl ChannelFreshness {
    /// Milliseconds elapsed between the last update and `now`.
    ///
    /// `None` for a channel that never reported.
    pub fn age_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.updated_at
            .map(|at| now.signed_duration_since(at).num_milliseconds())
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
        self.updates = self.updates.saturating_add(1);
    }
}

/// Per-channel staleness for the whole record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Freshness {
    /// Accelerometer staleness.
    pub accelerometer: ChannelFreshness,
    /// Gyroscope staleness.
    pub gyroscope: ChannelFreshness,
    /// Magnetometer staleness.
    pub magnetometer: ChannelFreshness,
    /// Location staleness.
    pub location: ChannelFreshness,
}

impl Freshness {
    /// Staleness of a single channel.
    pub const fn channel(&self, channel: Channel) -> ChannelFreshness {
        match channel {
            Channel::Accelerometer => self.accelerometer,
            Channel::Gyroscope => self.gyroscope,
            Channel::Magnetometer => self.magnetometer,
            Channel::Location => self.location,
        }
    }

    /// Channels that have not reported a single value yet.
    pub fn silent_channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|&channel| self.channel(channel).updates == 0)
            .collect()
    }

    const fn channel_mut(&mut self, channel: Channel) -> &mut ChannelFreshness {
        match channel {
            Channel::Accelerometer => &mut self.accelerometer,
            Channel::Gyroscope => &mut self.gyroscope,
            Channel::Magnetometer => &mut self.magnetometer,
            Channel::Location => &mut self.location,
        }
    }
}

/// The guarded record.
#[derive(Debug, Clone, Copy, Default)]
struct Record {
    accelerometer: Axis3,
    gyroscope: Axis3,
    magnetometer: Axis3,
    gps: GpsCoords,
    freshness: Freshness,
}

impl Record {
    const fn is_ready(&self) -> bool {
        self.freshness.location.updates > 0
    }
}

/// Concurrently-updatable container for the latest value of every channel.
///
/// Created once at startup with all-zero defaults. Sensor channels are
/// always publishable (a sensor that never reports stays at zero); the
/// record only becomes *ready* once a location update has been applied.
#[derive(Debug)]
pub struct SnapshotStore {
    record: Mutex<Record>,
    device_name: String,
    geohash_precision: usize,
}

impl SnapshotStore {
    /// Create an empty store for the given device.
    ///
    /// `geohash_precision` is the number of geohash characters to derive on
    /// read; `0` leaves the `geohash` field empty.
    pub fn new(device_name: impl Into<String>, geohash_precision: usize) -> Self {
        Self {
            record: Mutex::new(Record::default()),
            device_name: device_name.into(),
            geohash_precision: geohash_precision.min(geohash::MAX_PRECISION),
        }
    }

    /// The device label stamped on every snapshot.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Overwrite exactly one field (last write wins).
    pub fn update(&self, update: ChannelUpdate) {
        let now = Utc::now();
        let mut record = self.lock();
        match update {
            ChannelUpdate::Accelerometer(axes) => record.accelerometer = axes,
            ChannelUpdate::Gyroscope(axes) => record.gyroscope = axes,
            ChannelUpdate::Magnetometer(axes) => record.magnetometer = axes,
            ChannelUpdate::Location(coords) => record.gps = coords,
        }
        record.freshness.channel_mut(update.channel()).touch(now);
    }

    /// A consistent copy of every channel, ready or not.
    pub fn read(&self) -> Snapshot {
        let record = *self.lock();
        self.to_snapshot(&record)
    }

    /// A consistent copy, or `None` if no location has been applied yet.
    ///
    /// The readiness check and the copy happen under one lock acquisition.
    pub fn read_ready(&self) -> Option<Snapshot> {
        let record = *self.lock();
        record.is_ready().then(|| self.to_snapshot(&record))
    }

    /// Whether at least one location update has been applied.
    pub fn is_ready(&self) -> bool {
        self.lock().is_ready()
    }

    /// Per-channel staleness.
    pub fn freshness(&self) -> Freshness {
        self.lock().freshness
    }

    fn to_snapshot(&self, record: &Record) -> Snapshot {
        let geohash = if record.is_ready() {
            geohash::encode(record.gps, self.geohash_precision)
        } else {
            String::new()
        };
        Snapshot {
            accelerometer: record.accelerometer,
            gyroscope: record.gyroscope,
            magnetometer: record.magnetometer,
            gps: record.gps,
            device_name: self.device_name.clone(),
            geohash,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
