//! Line-delimited JSON event feed.
//!
//! The binary's host adapter: each line is one platform event, read from
//! stdin or a file.
//!
//! ```text
//! {"type":"reading","sensor":"accelerometer","values":[0.1,9.8,0.2]}
//! {"type":"location","lat":59.33,"lon":18.06,"alt":12.0}
//! ```
//!
//! Blank lines are ignored. Malformed lines are logged and skipped; they
//! never end the feed.

use std::path::Path;
use std::pin::Pin;

use futures::Stream;
use sensorcast_core::ingest::{PlatformEvent, StreamSource};
use sensorcast_types::SensorKind;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};

/// Errors raised by the feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The feed could not be opened.
    #[error("cannot open feed {path}: {source}")]
    Open {
        /// Feed path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not a valid event document.
    #[error("invalid feed line: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Boxed stream of parsed feed events.
pub type FeedStream = Pin<Box<dyn Stream<Item = PlatformEvent> + Send>>;

/// A boxed line reader over stdin or a file.
pub type FeedReader = Box<dyn AsyncBufRead + Unpin + Send>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedLine {
    Reading {
        sensor: String,
        values: Vec<f32>,
    },
    Location {
        lat: f64,
        lon: f64,
        #[serde(default)]
        alt: f64,
    },
}

impl From<FeedLine> for PlatformEvent {
    fn from(line: FeedLine) -> Self {
        match line {
            FeedLine::Reading { sensor, values } => Self::Reading {
                sensor: SensorKind::from_name(&sensor),
                values,
            },
            FeedLine::Location { lat, lon, alt } => Self::LocationFix { lat, lon, alt },
        }
    }
}

/// Parse one feed line. Blank lines yield `Ok(None)`.
///
/// # Errors
///
/// [`FeedError::Parse`] for anything that is not an event document.
pub fn parse_line(line: &str) -> Result<Option<PlatformEvent>, FeedError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed: FeedLine = serde_json::from_str(trimmed)?;
    Ok(Some(parsed.into()))
}

/// Open the feed at `path`, or stdin when `None`.
///
/// # Errors
///
/// [`FeedError::Open`] if the file cannot be opened.
pub async fn open(path: Option<&Path>) -> Result<FeedReader, FeedError> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|source| FeedError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}

/// Wrap a line reader as an event source advertising `sensors`.
pub fn line_source<R>(name: &str, sensors: Vec<SensorKind>, reader: R) -> StreamSource<FeedStream>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let feed = name.to_owned();
    let stream = futures::stream::unfold(
        (reader.lines(), 0_u64, feed),
        |(mut lines, mut line_no, feed)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        line_no = line_no.saturating_add(1);
                        match parse_line(&line) {
                            Ok(Some(event)) => return Some((event, (lines, line_no, feed))),
                            Ok(None) => {}
                            Err(e) => {
                                warn!(feed = %feed, line = line_no, error = %e, "skipping malformed feed line");
                            }
                        }
                    }
                    Ok(None) => {
                        info!(feed = %feed, lines = line_no, "feed ended");
                        return None;
                    }
                    Err(e) => {
                        warn!(feed = %feed, error = %e, "feed read failed");
                        return None;
                    }
                }
            }
        },
    );
    StreamSource::new(name, sensors, Box::pin(stream) as FeedStream)
}
