#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Daily ingestion of match documents into the bronze layer.
//!
//! [`Orchestrator::run`] drives one day end to end: health check, id
//! resolution, fetching and storing every missing document, then (only when
//! every id landed) compaction and remote backup.

pub mod config;
pub mod orchestrator;
pub mod resolve;

use scout_bronze::BronzeError;
use scout_bronze_models::MatchDate;
use scout_source::FetchError;

pub use orchestrator::Orchestrator;

/// Errors that end a run early.
///
/// Per-id failures never show up here; they are recorded in
/// [`scout_ingest_models::RunMetrics`].
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The day's ids could not be resolved after exhausting retries, or the
    /// source answered with a permanent error.
    #[error("Failed to resolve match ids for {date}: {message}")]
    IdResolution {
        /// Day being resolved.
        date: MatchDate,
        /// Last error seen.
        message: String,
    },

    /// The pre-flight health check reported a critical failure.
    #[error("Storage health check failed: {message}")]
    Health {
        /// Critical checks that failed.
        message: String,
    },

    /// Bronze layer error outside a single document's task.
    #[error(transparent)]
    Bronze(#[from] BronzeError),

    /// The source could not open a fetch session.
    #[error(transparent)]
    Source(#[from] FetchError),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },

    /// A blocking or worker task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Runs blocking bronze I/O off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, IngestError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}
