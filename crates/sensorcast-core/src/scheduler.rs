//! Fixed-interval publish scheduling.
//!
//! The [`PublishScheduler`] fires a tick every `interval`, independent of how
//! often individual sensors report. On each tick it reads the store and, if
//! the record is ready, hands a copy to the [`SnapshotSink`].
//!
//! # Overlap policy
//!
//! Delivery runs on its own task so a slow sink never delays the ticker. At
//! most one delivery is in flight at any time: a tick that arrives while the
//! previous delivery is outstanding is dropped and counted. Missed ticks are
//! skipped rather than bursted, so there is never a tick backlog.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start--> Running --stop--> Stopped
//!   \___________________stop______/
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use sensorcast_types::Snapshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::store::SnapshotStore;

/// Default tick interval for high-rate telemetry.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Errors returned by scheduler lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The tick interval must be non-zero.
    #[error("publish interval must be greater than zero")]
    ZeroInterval,

    /// `start` was called on a running scheduler.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// `start` was called after `stop`.
    #[error("scheduler has been stopped and cannot be restarted")]
    Stopped,
}

/// Receiver of ready snapshots.
///
/// Implemented by the publisher. Delivery outcomes are the sink's concern:
/// the scheduler neither inspects nor retries them.
pub trait SnapshotSink: Send + Sync + 'static {
    /// Hand one snapshot to the sink.
    fn deliver(&self, snapshot: Snapshot) -> impl Future<Output = ()> + Send;
}

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Created, not yet started.
    Idle,
    /// Ticking.
    Running,
    /// Stopped for good.
    Stopped,
}

/// Counters describing the ticks fired so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Ticks fired.
    pub ticks: u64,
    /// Ticks that handed a snapshot to the sink.
    pub attempted: u64,
    /// Ticks skipped because no location had been applied yet.
    pub skipped_not_ready: u64,
    /// Ticks dropped because a delivery was still in flight.
    pub dropped_busy: u64,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicBool,
    ticks: AtomicU64,
    attempted: AtomicU64,
    skipped_not_ready: AtomicU64,
    dropped_busy: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            attempted: self.attempted.load(Ordering::Relaxed),
            skipped_not_ready: self.skipped_not_ready.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
        }
    }
}

/// Clears the in-flight flag when the delivery task finishes or is dropped.
struct InFlightGuard(Arc<Counters>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Cancellable fixed-interval ticker with a skip-if-busy overlap policy.
#[derive(Debug)]
pub struct PublishScheduler {
    state: SchedulerState,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PublishScheduler {
    /// Create an idle scheduler.
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: SchedulerState::Idle,
            counters: Arc::new(Counters::default()),
            shutdown,
            task: None,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SchedulerState {
        self.state
    }

    /// Counters for the ticks fired so far.
    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    /// Whether a delivery is currently outstanding.
    pub fn in_flight(&self) -> bool {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    /// Start ticking every `interval`. The first tick fires one interval
    /// from now.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ZeroInterval`] for a zero interval,
    /// [`SchedulerError::AlreadyRunning`] if running, and
    /// [`SchedulerError::Stopped`] after [`stop`](Self::stop).
    pub fn start<S: SnapshotSink>(
        &mut self,
        interval: Duration,
        store: Arc<SnapshotStore>,
        sink: Arc<S>,
    ) -> Result<(), SchedulerError> {
        match self.state {
            SchedulerState::Running => return Err(SchedulerError::AlreadyRunning),
            SchedulerState::Stopped => return Err(SchedulerError::Stopped),
            SchedulerState::Idle => {}
        }
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        let counters = Arc::clone(&self.counters);
        let mut shutdown = self.shutdown.subscribe();
        let first_tick = Instant::now()
            .checked_add(interval)
            .unwrap_or_else(Instant::now);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => on_tick(&counters, &store, &sink),
                }
            }
            debug!("publish ticker exited");
        });

        self.task = Some(task);
        self.state = SchedulerState::Running;
        info!(
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "publish scheduler started"
        );
        Ok(())
    }

    /// Cancel future ticks.
    ///
    /// Returns once the ticker task has exited, which happens within one
    /// tick. A delivery already in flight is left to complete on its own.
    /// Calling `stop` again is a no-op.
    pub async fn stop(&mut self) {
        if self.state == SchedulerState::Stopped {
            return;
        }
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "publish ticker ended abnormally");
            }
        }
        self.state = SchedulerState::Stopped;

        let stats = self.stats();
        info!(
            ticks = stats.ticks,
            attempted = stats.attempted,
            skipped_not_ready = stats.skipped_not_ready,
            dropped_busy = stats.dropped_busy,
            "publish scheduler stopped"
        );
    }
}

impl Default for PublishScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// One tick: read, check readiness, check overlap, dispatch.
fn on_tick<S: SnapshotSink>(counters: &Arc<Counters>, store: &SnapshotStore, sink: &Arc<S>) {
    let tick = counters.ticks.fetch_add(1, Ordering::Relaxed).saturating_add(1);

    let Some(snapshot) = store.read_ready() else {
        counters.skipped_not_ready.fetch_add(1, Ordering::Relaxed);
        trace!(tick, "no location fix yet, skipping tick");
        return;
    };

    if counters
        .in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        counters.dropped_busy.fetch_add(1, Ordering::Relaxed);
        debug!(tick, "previous publish still in flight, dropping tick");
        return;
    }

    counters.attempted.fetch_add(1, Ordering::Relaxed);
    let guard = InFlightGuard(Arc::clone(counters));
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        let _guard = guard;
        sink.deliver(snapshot).await;
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use sensorcast_types::{ChannelUpdate, GpsCoords};
    use tokio::time::sleep;

    use super::*;

    #[derive(Default)]
    struct CountingSink {
        delivered: AtomicU64,
    }

    impl SnapshotSink for CountingSink {
        async fn deliver(&self, _snapshot: Snapshot) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SlowSink {
        latency: Duration,
        current: AtomicUsize,
        max_seen: AtomicUsize,
        delivered: AtomicU64,
    }

    impl SlowSink {
        fn new(latency: Duration) -> Self {
            Self {
                latency,
                current: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                delivered: AtomicU64::new(0),
            }
        }
    }

    impl SnapshotSink for SlowSink {
        async fn deliver(&self, _snapshot: Snapshot) {
            let now = self.current.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            sleep(self.latency).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ready_store() -> Arc<SnapshotStore> {
        let store = Arc::new(SnapshotStore::new("laptop", 0));
        store.update(ChannelUpdate::Location(GpsCoords::new(59.33, 18.06)));
        store
    }

    #[tokio::test(start_paused = true)]
    async fn ready_store_publishes_once_per_interval() {
        let sink = Arc::new(CountingSink::default());
        let mut scheduler = PublishScheduler::new();
        scheduler
            .start(Duration::from_millis(50), ready_store(), Arc::clone(&sink))
            .unwrap();

        sleep(Duration::from_millis(525)).await;
        scheduler.stop().await;

        let stats = scheduler.stats();
        assert_eq!(stats.ticks, 10);
        assert_eq!(stats.attempted, 10);
        assert_eq!(stats.dropped_busy, 0);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn unready_store_never_publishes() {
        let sink = Arc::new(CountingSink::default());
        let store = Arc::new(SnapshotStore::new("laptop", 0));
        let mut scheduler = PublishScheduler::new();
        scheduler
            .start(Duration::from_millis(50), store, Arc::clone(&sink))
            .unwrap();

        sleep(Duration::from_millis(1_025)).await;
        scheduler.stop().await;

        let stats = scheduler.stats();
        assert_eq!(stats.ticks, 20);
        assert_eq!(stats.skipped_not_ready, 20);
        assert_eq!(stats.attempted, 0);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_never_sees_overlapping_publishes() {
        let sink = Arc::new(SlowSink::new(Duration::from_millis(120)));
        let mut scheduler = PublishScheduler::new();
        scheduler
            .start(Duration::from_millis(50), ready_store(), Arc::clone(&sink))
            .unwrap();

        sleep(Duration::from_millis(1_010)).await;
        scheduler.stop().await;

        let stats = scheduler.stats();
        assert_eq!(sink.max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(stats.ticks, 20);
        // Deliveries start at 50, 200, 350, ... and each blocks two ticks.
        assert_eq!(stats.attempted, 7);
        assert_eq!(stats.dropped_busy, 13);
        assert_eq!(stats.attempted.saturating_add(stats.dropped_busy), stats.ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_future_ticks() {
        let sink = Arc::new(CountingSink::default());
        let mut scheduler = PublishScheduler::new();
        scheduler
            .start(Duration::from_millis(50), ready_store(), Arc::clone(&sink))
            .unwrap();

        sleep(Duration::from_millis(120)).await;
        scheduler.stop().await;
        let before = scheduler.stats();

        sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.stats(), before);
        assert_eq!(before.ticks, 2);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_publish_may_finish_after_stop() {
        let sink = Arc::new(SlowSink::new(Duration::from_millis(200)));
        let mut scheduler = PublishScheduler::new();
        scheduler
            .start(Duration::from_millis(50), ready_store(), Arc::clone(&sink))
            .unwrap();

        sleep(Duration::from_millis(60)).await;
        scheduler.stop().await;
        assert!(scheduler.in_flight());

        sleep(Duration::from_millis(300)).await;
        assert!(!scheduler.in_flight());
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lifecycle_rejects_invalid_transitions() {
        let sink = Arc::new(CountingSink::default());
        let mut scheduler = PublishScheduler::new();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        assert_eq!(
            scheduler.start(Duration::ZERO, ready_store(), Arc::clone(&sink)),
            Err(SchedulerError::ZeroInterval)
        );

        scheduler
            .start(Duration::from_secs(1), ready_store(), Arc::clone(&sink))
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(
            scheduler.start(Duration::from_secs(1), ready_store(), Arc::clone(&sink)),
            Err(SchedulerError::AlreadyRunning)
        );

        scheduler.stop().await;
        scheduler.stop().await;
        assert_eq!(
            scheduler.start(Duration::from_secs(1), ready_store(), sink),
            Err(SchedulerError::Stopped)
        );
    }

    #[tokio::test]
    async fn stopping_an_idle_scheduler_is_final() {
        let mut scheduler = PublishScheduler::default();
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.stats(), SchedulerStats::default());
    }
}
