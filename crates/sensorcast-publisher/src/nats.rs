//! NATS transport over mutually authenticated TLS.
//!
//! Core NATS publish is fire-and-forget, which gives the at-most-once
//! delivery the publisher promises. The client presents the loaded
//! [`Identity`] during the TLS handshake and verifies the broker against
//! the configured trust roots.
//!
//! Library connection events are translated into [`TransportEvent`]s and
//! forwarded to the publisher's event pump.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_nats::{ClientError, Event};
use rustls::{ClientConfig, RootCertStore};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialError, Identity, load_trust_roots};
use crate::error::PublisherError;
use crate::publisher::{Transport, TransportEvent};

/// Reconnect attempts the library makes after losing the connection before
/// it gives up and reports `MaxReconnects`.
pub const MAX_RECONNECTS: usize = 1;

/// Upper bound on the flush performed while closing.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection settings for [`NatsTransport`].
#[derive(Debug, Clone)]
pub struct NatsSettings {
    /// Broker address, e.g. `tls://device.example.com:4222`.
    pub endpoint: String,
    /// Connection name presented to the broker.
    pub client_id: String,
    /// CA bundle for the broker certificate. `None` uses Web PKI roots.
    pub ca_path: Option<PathBuf>,
    /// Ping interval.
    pub keep_alive: Duration,
    /// Deadline for establishing the connection.
    pub connect_timeout: Duration,
}

/// [`Transport`] backed by an `async-nats` client.
pub struct NatsTransport {
    settings: NatsSettings,
    roots: RootCertStore,
    client: Mutex<Option<async_nats::Client>>,
}

impl NatsTransport {
    /// Create a transport, loading the trust roots up front.
    ///
    /// # Errors
    ///
    /// [`CredentialError::TrustRoots`] if the CA bundle is unusable.
    pub fn new(settings: NatsSettings) -> Result<Self, CredentialError> {
        let roots = load_trust_roots(settings.ca_path.as_deref())?;
        debug!(roots = roots.len(), "trust roots loaded");
        Ok(Self {
            settings,
            roots,
            client: Mutex::new(None),
        })
    }

    fn current_client(&self) -> Option<async_nats::Client> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Build the client-authenticating TLS configuration.
///
/// # Errors
///
/// [`PublisherError::Connection`] if rustls rejects the identity.
pub fn tls_config(identity: Identity, roots: RootCertStore) -> Result<ClientConfig, PublisherError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| PublisherError::Connection(format!("TLS protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(identity.certificates, identity.private_key)
        .map_err(|e| PublisherError::Connection(format!("TLS client identity: {e}")))
}

/// Translate a library event. `None` for events that do not change the
/// connection state.
///
/// Only a lost connection or an exhausted reconnect budget is fatal. Broker
/// `-ERR` replies such as a permissions violation on one subject leave the
/// connection usable and are only logged.
pub fn map_event(event: Event) -> Option<TransportEvent> {
    match event {
        Event::Connected => Some(TransportEvent::Connected),
        Event::Disconnected => Some(TransportEvent::Disconnected(
            "connection to broker lost".to_owned(),
        )),
        Event::Closed => Some(TransportEvent::Closed),
        Event::ClientError(ClientError::MaxReconnects) => Some(TransportEvent::Failed(
            "reconnect attempts exhausted".to_owned(),
        )),
        Event::ServerError(e) => {
            warn!(error = %e, "NATS server error");
            None
        }
        Event::ClientError(e) => {
            warn!(error = %e, "NATS client error");
            None
        }
        Event::SlowConsumer(sid) => {
            warn!(sid, "NATS slow consumer");
            None
        }
        other => {
            debug!(event = ?other, "NATS event");
            None
        }
    }
}

/// Await `flush` for at most `limit`. Returns whether it completed in time.
///
/// While the library is busy reconnecting it does not service a flush, so
/// an unbounded wait could stall the caller indefinitely.
pub async fn bounded_flush<F, E>(flush: F, limit: Duration) -> bool
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, flush).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "flush before close failed");
            false
        }
        Err(_elapsed) => {
            warn!(
                timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                "flush before close timed out"
            );
            false
        }
    }
}

impl Transport for NatsTransport {
    async fn connect(
        &self,
        identity: Identity,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), PublisherError> {
        let tls = tls_config(identity, self.roots.clone())?;
        let forward = events.clone();

        info!(
            endpoint = %self.settings.endpoint,
            client_id = %self.settings.client_id,
            "connecting to NATS server"
        );
        let _ = events.send(TransportEvent::Connecting);

        let client = async_nats::ConnectOptions::new()
            .name(&self.settings.client_id)
            .require_tls(true)
            .tls_client_config(tls)
            .ping_interval(self.settings.keep_alive)
            .connection_timeout(self.settings.connect_timeout)
            .max_reconnects(MAX_RECONNECTS)
            .event_callback(move |event| {
                let forward = forward.clone();
                async move {
                    if let Some(mapped) = map_event(event) {
                        let _ = forward.send(mapped);
                    }
                }
            })
            .connect(self.settings.endpoint.as_str())
            .await
            .map_err(|e| {
                PublisherError::Connection(format!(
                    "failed to connect to {}: {e}",
                    self.settings.endpoint
                ))
            })?;

        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
        info!("NATS connection established");
        let _ = events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublisherError> {
        let client = self
            .current_client()
            .ok_or_else(|| PublisherError::Connection("no NATS client".to_owned()))?;
        client
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|e| PublisherError::Transport(format!("failed to publish to {subject}: {e}")))
    }

    async fn close(&self) {
        let taken = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = taken {
            bounded_flush(client.flush(), CLOSE_FLUSH_TIMEOUT).await;
            // Dropping the last handle ends the connection task.
            drop(client);
            info!("NATS connection closed");
        }
    }
}
