//! Error types for the publisher.
//!
//! Uses `thiserror` for typed errors that surface through the publish path:
//! configuration, credential loading, transport connectivity, and wire
//! encoding. Per-tick failures are logged by the publisher and never reach
//! the scheduler; only startup errors propagate to `main`.

use sensorcast_types::WireError;

use crate::credentials::CredentialError;

/// Errors that can occur while configuring or running the publisher.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    /// Configuration is invalid or missing.
    #[error("config error: {0}")]
    Config(String),

    /// The client identity could not be loaded. Fatal for connect.
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// The transport is not connected or the connection attempt failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport rejected a publish.
    #[error("transport error: {0}")]
    Transport(String),

    /// A publish did not hand off to the transport within the deadline.
    #[error("publish timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// A snapshot could not be encoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}
