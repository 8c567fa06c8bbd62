//! Device telemetry publisher entry point.
//!
//! Reads platform events from a line-delimited JSON feed, keeps the latest
//! value of every channel in a snapshot store, and publishes that snapshot
//! at a fixed interval over a mutually authenticated NATS connection.
//!
//! Publishing starts once the connection is up and the first location fix
//! has arrived. A lost connection is not retried: the process logs the
//! reason and exits with an error so a supervisor can restart it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use sensorcast_core::ingest::EventIngestor;
use sensorcast_core::scheduler::PublishScheduler;
use sensorcast_core::store::SnapshotStore;
use sensorcast_publisher::config::PublisherConfig;
use sensorcast_publisher::credentials::{ChannelCredentialLoader, FileIdentityCache};
use sensorcast_publisher::feed;
use sensorcast_publisher::nats::{NatsSettings, NatsTransport};
use sensorcast_publisher::publisher::{ConnectionState, Publisher, PublisherOptions};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application entry point.
///
/// Initializes logging and the runtime, then runs the publisher until
/// Ctrl-C or a connection failure.
///
/// # Errors
///
/// Returns an error if configuration, credentials, or the connection fail.
fn main() -> anyhow::Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let result = runtime.block_on(run());
    // A pending stdin read holds a blocking thread that cannot be cancelled.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run() -> anyhow::Result<()> {
    info!("sensorcast-publisher starting");

    let config = PublisherConfig::from_env().context("loading configuration")?;
    info!(
        endpoint = config.endpoint,
        topic = config.topic,
        device_name = config.device_name,
        publish_interval_ms = config.publish_interval.as_millis(),
        geohash_precision = config.geohash_precision,
        "configuration loaded"
    );

    let store = Arc::new(SnapshotStore::new(
        config.device_name.clone(),
        config.geohash_precision,
    ));

    let loader = ChannelCredentialLoader::new(
        config.credentials.clone(),
        Arc::new(FileIdentityCache::new(&config.identity_dir)),
        config.identity_alias.clone(),
    );

    let client_id = uuid::Uuid::new_v4().to_string();
    let transport = NatsTransport::new(NatsSettings {
        endpoint: config.endpoint.clone(),
        client_id: client_id.clone(),
        ca_path: config.ca_path.clone(),
        keep_alive: config.keep_alive,
        connect_timeout: config.connect_timeout,
    })
    .context("loading trust roots")?;

    let publisher = Arc::new(Publisher::new(
        transport,
        PublisherOptions {
            topic: config.topic.clone(),
            publish_timeout: config.publish_timeout,
            client_id,
            device_name: config.device_name.clone(),
            announce: config.announce,
        },
    ));

    // Credential errors are fatal before any network activity.
    publisher.connect(&loader).context("connecting to broker")?;
    let settled = publisher.wait_until_settled().await;
    if settled != ConnectionState::Connected {
        bail!(
            "connection {settled}: {}",
            publisher.last_failure().unwrap_or_default()
        );
    }

    let mut ingestor = EventIngestor::new(Arc::clone(&store));
    let feed_name = config
        .feed_path
        .as_ref()
        .map_or_else(|| "stdin".to_owned(), |path| path.display().to_string());
    let reader = feed::open(config.feed_path.as_deref()).await?;
    ingestor.attach(feed::line_source(&feed_name, config.sensors.clone(), reader));
    ingestor.check_sensors();

    let mut scheduler = PublishScheduler::new();
    scheduler
        .start(
            config.publish_interval,
            Arc::clone(&store),
            Arc::clone(&publisher),
        )
        .context("starting publish scheduler")?;

    let mut states = publisher.subscribe_state();
    let failed = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            false
        }
        _ = states.wait_for(|state| *state == ConnectionState::Failed) => true,
    };

    scheduler.stop().await;
    ingestor.stop().await;
    let failure = publisher.last_failure();
    publisher.disconnect().await;

    let silent = store.freshness().silent_channels();
    if !silent.is_empty() {
        warn!(channels = ?silent, "channels never updated during this run");
    }

    let publish = publisher.stats();
    let ticks = scheduler.stats();
    let ingest = ingestor.stats();
    info!(
        sent = publish.sent,
        dropped = publish.dropped,
        failed = publish.failed,
        ticks = ticks.ticks,
        skipped_not_ready = ticks.skipped_not_ready,
        dropped_busy = ticks.dropped_busy,
        applied = ingest.applied,
        unrecognized = ingest.unrecognized,
        malformed = ingest.malformed,
        "sensorcast-publisher stopped"
    );

    if failed {
        let reason = failure.unwrap_or_default();
        error!(reason = %reason, "connection failed");
        bail!("connection failed: {reason}");
    }
    Ok(())
}
