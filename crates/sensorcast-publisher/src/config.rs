//! Configuration types for the publisher.
//!
//! All configuration is loaded from environment variables. The publisher
//! needs to know where the broker is, which client identity to present,
//! how often to publish, and how to label the device.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sensorcast_types::{DEFAULT_DEVICE_NAME, SensorKind, geohash};

use crate::credentials::{CredentialSource, PemSource};
use crate::error::PublisherError;

/// Subject snapshots are published to when none is configured.
pub const DEFAULT_TOPIC: &str = "sensorData";

/// Cache alias the client identity is stored under by default.
pub const DEFAULT_IDENTITY_ALIAS: &str = "sensorcast-identity";

/// Complete publisher configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Broker address (e.g. `tls://device.example.com:4222`).
    pub endpoint: String,
    /// Where the client certificate and private key come from.
    pub credentials: CredentialSource,
    /// CA bundle for the broker certificate. `None` uses the bundled
    /// Web PKI roots.
    pub ca_path: Option<PathBuf>,
    /// Subject snapshots are published to.
    pub topic: String,
    /// Time between publish ticks.
    pub publish_interval: Duration,
    /// Deadline for handing one message to the transport.
    pub publish_timeout: Duration,
    /// Deadline for establishing the connection.
    pub connect_timeout: Duration,
    /// Ping interval that keeps the connection alive.
    pub keep_alive: Duration,
    /// Label stamped on every snapshot.
    pub device_name: String,
    /// Geohash characters derived from the location (0 disables).
    pub geohash_precision: usize,
    /// Directory holding the persistent identity cache.
    pub identity_dir: PathBuf,
    /// Alias the identity is cached under.
    pub identity_alias: String,
    /// Line-delimited event feed. `None` reads stdin.
    pub feed_path: Option<PathBuf>,
    /// Motion sensors the host provides.
    pub sensors: Vec<SensorKind>,
    /// Whether to publish an online status message after connecting.
    pub announce: bool,
}

impl PublisherConfig {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - `SENSORCAST_ENDPOINT` -- broker address
    /// - `SENSORCAST_CERT_PATH` or `SENSORCAST_CERT_PEM` -- client certificate
    /// - `SENSORCAST_KEY_PATH` or `SENSORCAST_KEY_PEM` -- client private key
    ///
    /// Optional variables:
    /// - `SENSORCAST_CA_PATH` -- CA bundle (default: Web PKI roots)
    /// - `SENSORCAST_TOPIC` -- publish subject (default `sensorData`)
    /// - `SENSORCAST_PUBLISH_INTERVAL_MS` -- tick interval (default 50)
    /// - `SENSORCAST_PUBLISH_TIMEOUT_MS` -- per-publish deadline (default 1000)
    /// - `SENSORCAST_CONNECT_TIMEOUT_MS` -- connect deadline (default 5000)
    /// - `SENSORCAST_KEEP_ALIVE_SECS` -- ping interval (default 10)
    /// - `SENSORCAST_DEVICE_NAME` -- device label (default `laptop`)
    /// - `SENSORCAST_GEOHASH_PRECISION` -- geohash length, 0-12 (default 0)
    /// - `SENSORCAST_IDENTITY_DIR` -- identity cache directory (default `.sensorcast`)
    /// - `SENSORCAST_IDENTITY_ALIAS` -- identity cache alias (default `sensorcast-identity`)
    /// - `SENSORCAST_FEED_PATH` -- event feed file (default: stdin)
    /// - `SENSORCAST_SENSORS` -- comma-separated motion sensors the host has
    ///   (default `accelerometer,gyroscope,magnetometer`)
    /// - `SENSORCAST_ANNOUNCE` -- publish an online status message (default `true`)
    pub fn from_env() -> Result<Self, PublisherError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// [`from_env`](Self::from_env) is this function over the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PublisherError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = required(&lookup, "SENSORCAST_ENDPOINT")?;
        let credentials = CredentialSource {
            certificate: pem_source(&lookup, "SENSORCAST_CERT_PATH", "SENSORCAST_CERT_PEM")?,
            private_key: pem_source(&lookup, "SENSORCAST_KEY_PATH", "SENSORCAST_KEY_PEM")?,
        };

        let publish_interval_ms: u64 = parsed(&lookup, "SENSORCAST_PUBLISH_INTERVAL_MS", 50)?;
        if publish_interval_ms == 0 {
            return Err(PublisherError::Config(
                "SENSORCAST_PUBLISH_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }
        let publish_timeout_ms: u64 = parsed(&lookup, "SENSORCAST_PUBLISH_TIMEOUT_MS", 1000)?;
        let connect_timeout_ms: u64 = parsed(&lookup, "SENSORCAST_CONNECT_TIMEOUT_MS", 5000)?;
        let keep_alive_secs: u64 = parsed(&lookup, "SENSORCAST_KEEP_ALIVE_SECS", 10)?;

        let geohash_precision: usize = parsed(&lookup, "SENSORCAST_GEOHASH_PRECISION", 0)?;
        if geohash_precision > geohash::MAX_PRECISION {
            return Err(PublisherError::Config(format!(
                "SENSORCAST_GEOHASH_PRECISION must be at most {}",
                geohash::MAX_PRECISION
            )));
        }

        let sensors = match lookup("SENSORCAST_SENSORS") {
            Some(list) => parse_sensor_list(&list)?,
            None => SensorKind::MOTION.to_vec(),
        };

        Ok(Self {
            endpoint,
            credentials,
            ca_path: lookup("SENSORCAST_CA_PATH").map(PathBuf::from),
            topic: lookup("SENSORCAST_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC.to_owned()),
            publish_interval: Duration::from_millis(publish_interval_ms),
            publish_timeout: Duration::from_millis(publish_timeout_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            keep_alive: Duration::from_secs(keep_alive_secs),
            device_name: lookup("SENSORCAST_DEVICE_NAME")
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_owned()),
            geohash_precision,
            identity_dir: lookup("SENSORCAST_IDENTITY_DIR")
                .map_or_else(|| PathBuf::from(".sensorcast"), PathBuf::from),
            identity_alias: lookup("SENSORCAST_IDENTITY_ALIAS")
                .unwrap_or_else(|| DEFAULT_IDENTITY_ALIAS.to_owned()),
            feed_path: lookup("SENSORCAST_FEED_PATH").map(PathBuf::from),
            sensors,
            announce: parsed(&lookup, "SENSORCAST_ANNOUNCE", true)?,
        })
    }
}

/// Read a required variable.
fn required<F>(lookup: &F, name: &str) -> Result<String, PublisherError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| PublisherError::Config(format!("missing required env var {name}")))
}

/// Read an optional variable, falling back to `default`.
fn parsed<F, T>(lookup: &F, name: &str, default: T) -> Result<T, PublisherError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PublisherError::Config(format!("invalid {name}: {e}"))),
        None => Ok(default),
    }
}

/// A PEM source given either as a file path or inline.
fn pem_source<F>(lookup: &F, path_var: &str, inline_var: &str) -> Result<PemSource, PublisherError>
where
    F: Fn(&str) -> Option<String>,
{
    match (lookup(path_var), lookup(inline_var)) {
        (Some(path), None) => Ok(PemSource::File(PathBuf::from(path))),
        (None, Some(pem)) => Ok(PemSource::Inline(pem.into_bytes())),
        (Some(_), Some(_)) => Err(PublisherError::Config(format!(
            "set only one of {path_var} and {inline_var}"
        ))),
        (None, None) => Err(PublisherError::Config(format!(
            "missing required env var {path_var} (or {inline_var})"
        ))),
    }
}

fn parse_sensor_list(list: &str) -> Result<Vec<SensorKind>, PublisherError> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| match SensorKind::from_name(name) {
            SensorKind::Other(other) => Err(PublisherError::Config(format!(
                "unknown sensor in SENSORCAST_SENSORS: {other}"
            ))),
            kind => Ok(kind),
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("SENSORCAST_ENDPOINT", "tls://broker.example.com:4222"),
            ("SENSORCAST_CERT_PATH", "/etc/sensorcast/device.crt"),
            ("SENSORCAST_KEY_PATH", "/etc/sensorcast/device.key"),
        ]
    }

    #[test]
    fn defaults_apply_to_optional_settings() {
        let config = PublisherConfig::from_lookup(lookup_from(&minimal())).unwrap();
        assert_eq!(config.endpoint, "tls://broker.example.com:4222");
        assert_eq!(config.topic, "sensorData");
        assert_eq!(config.publish_interval, Duration::from_millis(50));
        assert_eq!(config.publish_timeout, Duration::from_millis(1000));
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.keep_alive, Duration::from_secs(10));
        assert_eq!(config.device_name, "laptop");
        assert_eq!(config.geohash_precision, 0);
        assert_eq!(config.identity_alias, "sensorcast-identity");
        assert_eq!(config.identity_dir, PathBuf::from(".sensorcast"));
        assert_eq!(config.sensors, SensorKind::MOTION.to_vec());
        assert!(config.ca_path.is_none());
        assert!(config.feed_path.is_none());
        assert!(config.announce);
        assert!(matches!(config.credentials.certificate, PemSource::File(_)));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = minimal();
        vars.extend([
            ("SENSORCAST_PUBLISH_INTERVAL_MS", "250"),
            ("SENSORCAST_DEVICE_NAME", "rover-7"),
            ("SENSORCAST_GEOHASH_PRECISION", "7"),
            ("SENSORCAST_SENSORS", "accelerometer, gyro"),
            ("SENSORCAST_ANNOUNCE", "false"),
        ]);
        let config = PublisherConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.publish_interval, Duration::from_millis(250));
        assert_eq!(config.device_name, "rover-7");
        assert_eq!(config.geohash_precision, 7);
        assert_eq!(
            config.sensors,
            vec![SensorKind::Accelerometer, SensorKind::Gyroscope]
        );
        assert!(!config.announce);
    }

    #[test]
    fn inline_pem_is_accepted() {
        let vars = [
            ("SENSORCAST_ENDPOINT", "tls://broker:4222"),
            ("SENSORCAST_CERT_PEM", "-----BEGIN CERTIFICATE-----"),
            ("SENSORCAST_KEY_PATH", "device.key"),
        ];
        let config = PublisherConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert!(matches!(config.credentials.certificate, PemSource::Inline(_)));
        assert!(matches!(config.credentials.private_key, PemSource::File(_)));
    }

    #[test]
    fn missing_endpoint_is_an_error() {
        let vars = [("SENSORCAST_CERT_PATH", "a"), ("SENSORCAST_KEY_PATH", "b")];
        let err = PublisherConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(err.to_string().contains("SENSORCAST_ENDPOINT"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let vars = [("SENSORCAST_ENDPOINT", "tls://b:4222"), ("SENSORCAST_CERT_PATH", "a")];
        let err = PublisherConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(err.to_string().contains("SENSORCAST_KEY_PATH"));
    }

    #[test]
    fn ambiguous_credential_source_is_an_error() {
        let mut vars = minimal();
        vars.push(("SENSORCAST_CERT_PEM", "inline"));
        assert!(PublisherConfig::from_lookup(lookup_from(&vars)).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (name, value) in [
            ("SENSORCAST_PUBLISH_INTERVAL_MS", "fast"),
            ("SENSORCAST_PUBLISH_INTERVAL_MS", "0"),
            ("SENSORCAST_GEOHASH_PRECISION", "13"),
            ("SENSORCAST_ANNOUNCE", "maybe"),
            ("SENSORCAST_SENSORS", "accelerometer,thermometer"),
        ] {
            let mut vars = minimal();
            vars.push((name, value));
            let result = PublisherConfig::from_lookup(lookup_from(&vars));
            assert!(
                matches!(result, Err(PublisherError::Config(_))),
                "{name}={value} should be rejected"
            );
        }
    }
}
