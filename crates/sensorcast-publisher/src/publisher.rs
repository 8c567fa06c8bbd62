//! Connection lifecycle and at-most-once publishing.
//!
//! The [`Publisher`] owns a [`Transport`] and tracks its connection state.
//! Transport callbacks arrive on library-owned tasks; they are funneled
//! through an unbounded channel into a single event pump, so transport
//! events change [`ConnectionState`] one at a time.
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect--> Connecting --Connected--> Connected
//!                               |                         |
//!                               +--Disconnected/Failed--> Failed (sticky)
//! Connected --Closed--> Disconnected
//! any --disconnect--> Disconnected
//! ```
//!
//! `Failed` ignores further transport events until `connect` is called
//! again, and entering it closes the transport so nothing reconnects in the
//! background.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sensorcast_core::scheduler::SnapshotSink;
use sensorcast_types::{DEFAULT_DEVICE_NAME, Snapshot};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::DEFAULT_TOPIC;
use crate::credentials::{ChannelCredentialLoader, Identity};
use crate::error::PublisherError;

/// Connection state as seen by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Publishing is possible.
    Connected,
    /// The connection failed or was lost. Publishing is impossible until
    /// the next `connect`.
    Failed,
}

impl ConnectionState {
    /// Stable lowercase name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An attempt to reach the broker has started.
    Connecting,
    /// The broker accepted the connection.
    Connected,
    /// An established connection was lost.
    Disconnected(String),
    /// The connection could not be established or hit a fatal error.
    Failed(String),
    /// The transport was closed.
    Closed,
}

/// The messaging client underneath a [`Publisher`].
///
/// Implementations report connection changes through the `events` sender
/// handed to [`connect`](Transport::connect), from any task, for as long as
/// the connection lives.
pub trait Transport: Send + Sync + 'static {
    /// Open a mutually authenticated connection with `identity`.
    ///
    /// An `Err` is reported to the publisher as a connection failure.
    fn connect(
        &self,
        identity: Identity,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> impl Future<Output = Result<(), PublisherError>> + Send;

    /// Hand one message to the broker with no delivery guarantee.
    fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PublisherError>> + Send;

    /// Tear the connection down. Must be idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Why a publish was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The transport was not connected.
    NotConnected {
        /// State at the time of the publish.
        state: ConnectionState,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected { state } => write!(f, "not connected (state: {state})"),
        }
    }
}

/// Result of one [`Publisher::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The message was handed to the broker.
    Sent,
    /// The message was discarded without touching the transport.
    Dropped(DropReason),
}

/// Publish counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    /// Messages handed to the broker.
    pub sent: u64,
    /// Messages dropped because the transport was not connected.
    pub dropped: u64,
    /// Messages the transport rejected or that timed out.
    pub failed: u64,
}

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Subject snapshots are published to.
    pub topic: String,
    /// Deadline for one publish hand-off.
    pub publish_timeout: Duration,
    /// Client identifier reported in the status announcement.
    pub client_id: String,
    /// Device label reported in the status announcement.
    pub device_name: String,
    /// Whether to publish an online status message after connecting.
    pub announce: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_owned(),
            publish_timeout: Duration::from_millis(1000),
            client_id: uuid::Uuid::new_v4().to_string(),
            device_name: DEFAULT_DEVICE_NAME.to_owned(),
            announce: true,
        }
    }
}

/// Status document published on `<topic>.status` after connecting.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusAnnouncement<'a> {
    device_name: &'a str,
    client_id: &'a str,
    status: &'static str,
    at: DateTime<Utc>,
}

struct Inner<T> {
    transport: T,
    options: PublisherOptions,
    state: watch::Sender<ConnectionState>,
    last_failure: Mutex<Option<String>>,
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl<T: Transport> Inner<T> {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Replace the state, returning the previous one.
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "connection state changed");
        }
        previous
    }

    /// Move to `Connecting` unless a session is already active, as one
    /// step. Returns the state that was replaced, or the active state.
    fn begin_connect(&self) -> Result<ConnectionState, ConnectionState> {
        let mut previous = ConnectionState::Disconnected;
        let claimed = self.state.send_if_modified(|state| {
            previous = *state;
            if matches!(
                *state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                false
            } else {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if claimed {
            info!(from = %previous, to = %ConnectionState::Connecting, "connection state changed");
            Ok(previous)
        } else {
            Err(previous)
        }
    }

    async fn handle_event(&self, event: TransportEvent) {
        if self.state() == ConnectionState::Failed {
            trace!(?event, "ignoring transport event while failed");
            return;
        }
        match event {
            TransportEvent::Connecting => {
                self.set_state(ConnectionState::Connecting);
            }
            TransportEvent::Connected => {
                let previous = self.set_state(ConnectionState::Connected);
                if previous != ConnectionState::Connected && self.options.announce {
                    self.announce().await;
                }
            }
            TransportEvent::Disconnected(reason) | TransportEvent::Failed(reason) => {
                error!(reason = %reason, "connection failed");
                *self
                    .last_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(reason);
                self.set_state(ConnectionState::Failed);
                self.transport.close().await;
            }
            TransportEvent::Closed => {
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn announce(&self) {
        let subject = format!("{}.status", self.options.topic);
        let body = StatusAnnouncement {
            device_name: &self.options.device_name,
            client_id: &self.options.client_id,
            status: "online",
            at: Utc::now(),
        };
        let payload = match serde_json::to_vec(&body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode status announcement");
                return;
            }
        };
        match self.send_bounded(&subject, payload).await {
            Ok(()) => debug!(subject = %subject, "status announcement published"),
            Err(e) => warn!(subject = %subject, error = %e, "status announcement failed"),
        }
    }

    async fn send_bounded(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublisherError> {
        let timeout = self.options.publish_timeout;
        match tokio::time::timeout(timeout, self.transport.publish(subject, payload)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(PublisherError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

/// Publishes snapshots over a [`Transport`], at most once each.
pub struct Publisher<T: Transport> {
    inner: Arc<Inner<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> Publisher<T> {
    /// Create a disconnected publisher.
    pub fn new(transport: T, options: PublisherOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                options,
                state,
                last_failure: Mutex::new(None),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start connecting.
    ///
    /// The state moves to `Connecting` atomically, so concurrent callers
    /// cannot both start a session. The identity is loaded next; a
    /// credential failure restores the previous state before the transport
    /// is touched. Otherwise the connection is established in the
    /// background. Use
    /// [`subscribe_state`](Self::subscribe_state) or
    /// [`wait_until_settled`](Self::wait_until_settled) to observe the
    /// result.
    ///
    /// # Errors
    ///
    /// [`PublisherError::Connection`] if already connecting or connected,
    /// [`PublisherError::Credential`] if the identity cannot be loaded.
    pub fn connect(&self, loader: &ChannelCredentialLoader) -> Result<(), PublisherError> {
        let previous = self.inner.begin_connect().map_err(|current| {
            PublisherError::Connection(format!("connect called while {current}"))
        })?;
        // The previous session's pump must not see the new Connecting state.
        self.abort_tasks();

        let identity = match loader.load() {
            Ok(identity) => identity,
            Err(e) => {
                error!(alias = %loader.alias(), error = %e, "client identity rejected");
                self.inner.set_state(previous);
                return Err(e.into());
            }
        };

        *self
            .inner
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let (events, mut rx) = mpsc::unbounded_channel();
        let pump_inner = Arc::clone(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pump_inner.handle_event(event).await;
            }
            debug!("transport event pump exited");
        });

        let connect_inner = Arc::clone(&self.inner);
        let connector = tokio::spawn(async move {
            if let Err(e) = connect_inner
                .transport
                .connect(identity, events.clone())
                .await
            {
                let _ = events.send(TransportEvent::Failed(e.to_string()));
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([pump, connector]);
        info!(client_id = %self.inner.options.client_id, "connecting");
        Ok(())
    }

    /// Publish one snapshot to the configured subject.
    ///
    /// Returns [`PublishOutcome::Dropped`] without blocking unless the
    /// connection is up. No retry and no queueing.
    ///
    /// # Errors
    ///
    /// Encoding failures, transport rejections, and
    /// [`PublisherError::Timeout`] when the hand-off exceeds the deadline.
    pub async fn publish(&self, snapshot: &Snapshot) -> Result<PublishOutcome, PublisherError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(PublishOutcome::Dropped(DropReason::NotConnected { state }));
        }

        let result = match snapshot.to_wire() {
            Ok(payload) => {
                self.inner
                    .send_bounded(&self.inner.options.topic, payload)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {
                self.inner.sent.fetch_add(1, Ordering::Relaxed);
                Ok(PublishOutcome::Sent)
            }
            Err(e) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Stop watching the transport and close it.
    pub async fn disconnect(&self) {
        self.abort_tasks();
        self.inner.transport.close().await;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receive every state change from now on.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the state is anything but `Connecting`.
    pub async fn wait_until_settled(&self) -> ConnectionState {
        let mut rx = self.subscribe_state();
        rx.wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_or(ConnectionState::Disconnected, |state| *state)
    }

    /// Reason for the most recent failure since the last `connect`.
    pub fn last_failure(&self) -> Option<String> {
        self.inner
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish counters.
    pub fn stats(&self) -> PublishStats {
        PublishStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    /// Client identifier presented to the broker.
    pub fn client_id(&self) -> &str {
        &self.inner.options.client_id
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl<T: Transport> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl<T: Transport> SnapshotSink for Publisher<T> {
    async fn deliver(&self, snapshot: Snapshot) {
        match self.publish(&snapshot).await {
            Ok(PublishOutcome::Sent) => trace!("snapshot published"),
            Ok(PublishOutcome::Dropped(reason)) => debug!(%reason, "snapshot dropped"),
            Err(e) => warn!(error = %e, "snapshot publish failed"),
        }
    }
}
