//! Sample aggregation and publish scheduling for sensorcast.
//!
//! This crate owns the concurrent half of the pipeline:
//!
//! ```text
//! event sources --> EventIngestor --> SnapshotStore --> PublishScheduler --> SnapshotSink
//! ```
//!
//! # Modules
//!
//! - [`store`] -- The lock-guarded [`SnapshotStore`] holding the latest value
//!   per channel, with per-channel staleness tracking.
//! - [`ingest`] -- [`EventIngestor`] mapping platform events onto store
//!   updates, and the [`EventSource`] trait for async sources.
//! - [`scheduler`] -- [`PublishScheduler`], the fixed-interval ticker with a
//!   skip-if-busy overlap policy, and the [`SnapshotSink`] trait it feeds.
//!
//! [`SnapshotStore`]: store::SnapshotStore
//! [`EventIngestor`]: ingest::EventIngestor
//! [`EventSource`]: ingest::EventSource
//! [`PublishScheduler`]: scheduler::PublishScheduler
//! [`SnapshotSink`]: scheduler::SnapshotSink

pub mod ingest;
pub mod scheduler;
pub mod store;
