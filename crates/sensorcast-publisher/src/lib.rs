//! Telemetry publisher for the sensorcast workspace.
//!
//! Turns the snapshot produced by `sensorcast-core` into messages on a
//! mutually authenticated NATS connection.
//!
//! # Architecture
//!
//! ```text
//! feed (stdin/file) --> EventIngestor --> SnapshotStore
//!                                              |
//!                          PublishScheduler (fixed interval)
//!                                              |
//!                                   Publisher --> NATS over mTLS
//! ```
//!
//! # Modules
//!
//! - [`config`] -- Environment configuration
//! - [`credentials`] -- Client identity loading, caching, and trust roots
//! - [`error`] -- Publisher error type
//! - [`feed`] -- Line-delimited JSON event feed
//! - [`nats`] -- NATS transport with a rustls client identity
//! - [`publisher`] -- Connection state machine and at-most-once publishing

pub mod config;
pub mod credentials;
pub mod error;
pub mod feed;
pub mod nats;
pub mod publisher;
