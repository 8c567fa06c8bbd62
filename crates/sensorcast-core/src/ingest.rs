//! Event ingestion: platform events in, store updates out.
//!
//! The host platform reports sensor readings and location fixes
//! asynchronously, from any thread, in any interleaving. The
//! [`EventIngestor`] maps each event to exactly one
//! [`SnapshotStore::update`] with no buffering, filtering, or smoothing.
//!
//! Two delivery styles are supported:
//!
//! - **Callbacks** -- [`IngestHandle::on_reading`] and
//!   [`IngestHandle::on_location_fix`], callable from any thread.
//! - **Async sources** -- anything implementing [`EventSource`], driven by
//!   one task per source after [`EventIngestor::attach`].
//!
//! Per-event problems (an unknown sensor, a short value array) are absorbed
//! and counted; they never affect another channel or stop the ingestor.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::{Stream, StreamExt as _};
use sensorcast_types::{Axis3, Channel, ChannelUpdate, GpsCoords, SensorKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::store::SnapshotStore;

/// One event delivered by the host platform.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// A sensor reading with the platform's raw value array.
    Reading {
        /// Which sensor produced the values.
        sensor: SensorKind,
        /// Raw values; motion sensors report at least `[x, y, z]`.
        values: Vec<f32>,
    },
    /// A location fix.
    LocationFix {
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lon: f64,
        /// Altitude in meters. Not part of the published record.
        alt: f64,
    },
}

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event overwrote the given channel.
    Applied(Channel),
    /// The event came from a sensor type that is not published.
    Unrecognized,
    /// The reading carried fewer than three values.
    Malformed,
    /// The ingestor has been stopped; the event was discarded.
    Stopped,
}

/// Counters describing ingestion so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Events that updated the store.
    pub applied: u64,
    /// Events from unknown sensor types.
    pub unrecognized: u64,
    /// Readings with too few values.
    pub malformed: u64,
    /// Events discarded after stop.
    pub discarded: u64,
}

/// An asynchronous producer of platform events.
///
/// Implementations wrap whatever the host offers (a sensor HAL, a serial
/// link, a replay file). Returning `None` from [`next_event`] ends the
/// source.
///
/// [`next_event`]: EventSource::next_event
pub trait EventSource: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Sensor types this source can deliver.
    ///
    /// Used only to warn about motion sensors the host lacks.
    fn sensors(&self) -> Vec<SensorKind>;

    /// Wait for the next event.
    fn next_event(&mut self) -> impl Future<Output = Option<PlatformEvent>> + Send;
}

/// Adapts any [`Stream`] of platform events into an [`EventSource`].
pub struct StreamSource<S> {
    name: String,
    sensors: Vec<SensorKind>,
    stream: S,
}

impl<S> StreamSource<S>
where
    S: Stream<Item = PlatformEvent> + Send + Unpin + 'static,
{
    /// Wrap `stream`, advertising `sensors`.
    pub fn new(name: impl Into<String>, sensors: Vec<SensorKind>, stream: S) -> Self {
        Self {
            name: name.into(),
            sensors,
            stream,
        }
    }
}

impl<S> EventSource for StreamSource<S>
where
    S: Stream<Item = PlatformEvent> + Send + Unpin + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn sensors(&self) -> Vec<SensorKind> {
        self.sensors.clone()
    }

    async fn next_event(&mut self) -> Option<PlatformEvent> {
        self.stream.next().await
    }
}

impl<S> std::fmt::Debug for StreamSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("name", &self.name)
            .field("sensors", &self.sensors)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Shared {
    store: Arc<SnapshotStore>,
    stopped: AtomicBool,
    applied: AtomicU64,
    unrecognized: AtomicU64,
    malformed: AtomicU64,
    discarded: AtomicU64,
}

impl Shared {
    fn on_reading(&self, sensor: &SensorKind, values: &[f32]) -> IngestOutcome {
        if self.stopped.load(Ordering::Acquire) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Stopped;
        }

        let Some(channel) = sensor.channel() else {
            trace!(sensor = %sensor, "ignoring unrecognized sensor event");
            self.unrecognized.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Unrecognized;
        };

        let Some(axes) = Axis3::from_slice(values) else {
            debug!(
                sensor = %sensor,
                value_count = values.len(),
                "ignoring reading with fewer than three values"
            );
            self.malformed.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Malformed;
        };

        let update = match channel {
            Channel::Accelerometer => ChannelUpdate::Accelerometer(axes),
            Channel::Gyroscope => ChannelUpdate::Gyroscope(axes),
            Channel::Magnetometer => ChannelUpdate::Magnetometer(axes),
            Channel::Location => {
                // No sensor kind maps to the location channel.
                self.unrecognized.fetch_add(1, Ordering::Relaxed);
                return IngestOutcome::Unrecognized;
            }
        };
        self.apply(update)
    }

    fn on_location_fix(&self, lat: f64, lon: f64) -> IngestOutcome {
        if self.stopped.load(Ordering::Acquire) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Stopped;
        }
        self.apply(ChannelUpdate::Location(GpsCoords::new(lat, lon)))
    }

    fn on_event(&self, event: &PlatformEvent) -> IngestOutcome {
        match event {
            PlatformEvent::Reading { sensor, values } => self.on_reading(sensor, values),
            PlatformEvent::LocationFix { lat, lon, .. } => self.on_location_fix(*lat, *lon),
        }
    }

    fn apply(&self, update: ChannelUpdate) -> IngestOutcome {
        self.store.update(update);
        self.applied.fetch_add(1, Ordering::Relaxed);
        IngestOutcome::Applied(update.channel())
    }
}

/// Cloneable callback entry point into an [`EventIngestor`].
///
/// Hand one to each platform listener; every clone feeds the same store
/// and honours the same stop flag.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    shared: Arc<Shared>,
}

impl IngestHandle {
    /// Platform callback for a sensor reading.
    pub fn on_reading(&self, sensor: &SensorKind, values: &[f32]) -> IngestOutcome {
        self.shared.on_reading(sensor, values)
    }

    /// Platform callback for a location fix. Altitude is accepted for
    /// interface parity but not stored.
    pub fn on_location_fix(&self, lat: f64, lon: f64, _alt: f64) -> IngestOutcome {
        self.shared.on_location_fix(lat, lon)
    }

    /// Apply any platform event.
    pub fn on_event(&self, event: &PlatformEvent) -> IngestOutcome {
        self.shared.on_event(event)
    }
}

/// Maps platform events onto [`SnapshotStore`] updates.
#[derive(Debug)]
pub struct EventIngestor {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    advertised: HashSet<SensorKind>,
}

impl EventIngestor {
    /// Create an ingestor feeding `store`. No source is attached yet.
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                store,
                stopped: AtomicBool::new(false),
                applied: AtomicU64::new(0),
                unrecognized: AtomicU64::new(0),
                malformed: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
            shutdown,
            tasks: Vec::new(),
            advertised: HashSet::new(),
        }
    }

    /// A callback handle for platform listeners.
    pub fn handle(&self) -> IngestHandle {
        IngestHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Subscribe to an async source. Spawns one task that applies every
    /// event until the source ends or the ingestor stops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S: EventSource>(&mut self, mut source: S) {
        self.advertised.extend(source.sensors());
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        let name = source.name().to_owned();
        info!(source = name, "event source attached");

        let task = tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    event = source.next_event() => {
                        let Some(event) = event else {
                            info!(source = name, "event source ended");
                            break;
                        };
                        shared.on_event(&event);
                    }
                }
            }
            debug!(source = name, "event source detached");
        });
        self.tasks.push(task);
    }

    /// Warn about every motion sensor no attached source advertises.
    ///
    /// The matching channel keeps its zero default for the whole run.
    /// Returns the missing sensors.
    pub fn check_sensors(&self) -> Vec<SensorKind> {
        let missing: Vec<SensorKind> = SensorKind::MOTION
            .into_iter()
            .filter(|kind| !self.advertised.contains(kind))
            .collect();
        for kind in &missing {
            warn!(sensor = %kind, "sensor not available on this host, channel will stay at zero");
        }
        missing
    }

    /// Apply one event directly, as the callback handle would.
    pub fn ingest(&self, event: &PlatformEvent) -> IngestOutcome {
        self.shared.on_event(event)
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Counters for the events seen so far.
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            applied: self.shared.applied.load(Ordering::Relaxed),
            unrecognized: self.shared.unrecognized.load(Ordering::Relaxed),
            malformed: self.shared.malformed.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    /// De-register every source and callback.
    ///
    /// After this returns no source task is running and every callback is a
    /// no-op. An event already being applied when stop begins may still land.
    pub async fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "event source task ended abnormally");
            }
        }
        info!(
            applied = self.shared.applied.load(Ordering::Relaxed),
            "event ingestor stopped"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt as _;
    use futures::stream;
    use tokio::sync::mpsc;

    use super::*;

    fn ingestor() -> (Arc<SnapshotStore>, EventIngestor) {
        let store = Arc::new(SnapshotStore::new("laptop", 0));
        let ingestor = EventIngestor::new(Arc::clone(&store));
        (store, ingestor)
    }

    #[test]
    fn readings_map_to_their_channels() {
        let (store, ingestor) = ingestor();
        let handle = ingestor.handle();

        assert_eq!(
            handle.on_reading(&SensorKind::Accelerometer, &[1.0, 2.0, 3.0]),
            IngestOutcome::Applied(Channel::Accelerometer)
        );
        assert_eq!(
            handle.on_reading(&SensorKind::Gyroscope, &[4.0, 5.0, 6.0]),
            IngestOutcome::Applied(Channel::Gyroscope)
        );
        assert_eq!(
            handle.on_reading(&SensorKind::MagneticField, &[7.0, 8.0, 9.0]),
            IngestOutcome::Applied(Channel::Magnetometer)
        );
        assert_eq!(
            handle.on_location_fix(59.33, 18.06, 30.0),
            IngestOutcome::Applied(Channel::Location)
        );

        let snapshot = store.read_ready().unwrap();
        assert_eq!(snapshot.accelerometer, Axis3::new(1.0, 2.0, 3.0));
        assert_eq!(snapshot.gyroscope, Axis3::new(4.0, 5.0, 6.0));
        assert_eq!(snapshot.magnetometer, Axis3::new(7.0, 8.0, 9.0));
        assert_eq!(snapshot.gps, GpsCoords::new(59.33, 18.06));
        assert_eq!(ingestor.stats().applied, 4);
    }

    #[test]
    fn unknown_sensor_is_ignored() {
        let (store, ingestor) = ingestor();
        let outcome = ingestor.ingest(&PlatformEvent::Reading {
            sensor: SensorKind::Other("light".to_owned()),
            values: vec![300.0, 0.0, 0.0],
        });
        assert_eq!(outcome, IngestOutcome::Unrecognized);
        assert_eq!(ingestor.stats().unrecognized, 1);
        assert_eq!(store.freshness().silent_channels().len(), 4);
    }

    #[test]
    fn short_reading_does_not_touch_other_channels() {
        let (store, ingestor) = ingestor();
        let handle = ingestor.handle();
        handle.on_reading(&SensorKind::Gyroscope, &[1.0, 1.0, 1.0]);
        assert_eq!(
            handle.on_reading(&SensorKind::Accelerometer, &[1.0]),
            IngestOutcome::Malformed
        );

        let snapshot = store.read();
        assert_eq!(snapshot.accelerometer, Axis3::default());
        assert_eq!(snapshot.gyroscope, Axis3::new(1.0, 1.0, 1.0));
        assert_eq!(ingestor.stats().malformed, 1);
    }

    #[tokio::test]
    async fn attached_stream_feeds_the_store() {
        let (store, mut ingestor) = ingestor();
        let events = vec![
            PlatformEvent::Reading {
                sensor: SensorKind::Accelerometer,
                values: vec![0.5, 0.5, 9.8],
            },
            PlatformEvent::LocationFix {
                lat: 10.0,
                lon: 20.0,
                alt: 0.0,
            },
        ];
        ingestor.attach(StreamSource::new(
            "replay",
            vec![SensorKind::Accelerometer],
            stream::iter(events),
        ));

        for _ in 0..50 {
            if store.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let snapshot = store.read_ready().unwrap();
        assert_eq!(snapshot.accelerometer, Axis3::new(0.5, 0.5, 9.8));
        assert_eq!(snapshot.gps, GpsCoords::new(10.0, 20.0));
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn missing_motion_sensors_are_reported() {
        let (_store, mut ingestor) = ingestor();
        ingestor.attach(StreamSource::new(
            "partial",
            vec![SensorKind::Accelerometer, SensorKind::Gyroscope],
            stream::pending(),
        ));
        assert_eq!(ingestor.check_sensors(), vec![SensorKind::MagneticField]);
        ingestor.stop().await;
    }

    #[tokio::test]
    async fn stop_detaches_sources_and_silences_callbacks() {
        let (store, mut ingestor) = ingestor();
        let (tx, rx) = mpsc::unbounded_channel::<PlatformEvent>();
        let source = StreamSource::new(
            "channel",
            SensorKind::MOTION.to_vec(),
            futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
        );
        ingestor.attach(source);
        let handle = ingestor.handle();

        ingestor.stop().await;
        assert!(ingestor.is_stopped());

        // The source task is gone; nothing drains the channel any more.
        let sent = tx.send(PlatformEvent::LocationFix {
            lat: 1.0,
            lon: 1.0,
            alt: 0.0,
        });
        assert!(sent.is_err());

        assert_eq!(handle.on_location_fix(1.0, 1.0, 0.0), IngestOutcome::Stopped);
        assert!(!store.is_ready());
        assert_eq!(ingestor.stats().discarded, 1);
    }
}
