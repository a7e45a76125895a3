#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Bronze layer storage: raw match documents on the local filesystem.
//!
//! ```text
//! {data_dir}/{scraper}/
//!   matches/YYYYMMDD/match_{id}.json          individual documents
//!   matches/YYYYMMDD/YYYYMMDD_matches.tar     compacted archive (.json.gz members)
//!   daily_listings/YYYYMMDD/matches.json      expected vs stored ids
//!   lineage/YYYYMMDD/lineage.json             audit trail
//! ```
//!
//! Every file is written with the same discipline: write a dot-prefixed
//! temp sibling, re-read and validate it, then rename it over the target.
//! Readers never see a partial file.

pub mod archive;
pub mod atomic;
pub mod compact;
pub mod health;
pub mod layout;
pub mod lineage;
pub mod listing;
pub mod store;

use std::path::Path;
use std::time::Duration;

use scout_bronze_models::{InvalidDate, MatchDate};

pub use compact::ArchiveCompactor;
pub use layout::BronzeLayout;
pub use lineage::{FsLineageLog, LineageEntry, LineageLog};
pub use listing::{FsListingTracker, ListingTracker, Resolution};
pub use store::{DocumentStore, FsDocumentStore};

/// Default bounded wait for a directory lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur in the bronze layer.
#[derive(Debug, thiserror::Error)]
pub enum BronzeError {
    /// Reading or writing a file failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A file exists but is not the JSON it should be.
    #[error("JSON error at {path}: {source}")]
    Json {
        /// Path that caused the error.
        path: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// No document for this `(date, id)`, individually or in the archive.
    #[error("Document not found: match {id} on {date}")]
    NotFound {
        /// Requested day.
        date: MatchDate,
        /// Requested match id.
        id: String,
    },

    /// A date string could not be normalized.
    #[error(transparent)]
    InvalidDate(#[from] InvalidDate),

    /// A match id that cannot be used as a file name component.
    #[error("Invalid match id {id:?}: {reason}")]
    InvalidId {
        /// The rejected id.
        id: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Another writer held the directory lock for longer than the timeout.
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    LockTimeout {
        /// Lock file path.
        path: String,
        /// How long we waited.
        waited: Duration,
    },

    /// A freshly written file did not read back as expected.
    #[error("Validation failed for {path}: {message}")]
    Validation {
        /// File that failed validation.
        path: String,
        /// What was wrong.
        message: String,
    },

    /// Archive verification failed; originals were kept.
    #[error("Archive integrity check failed for {date}: {message}")]
    Integrity {
        /// Day being compacted.
        date: MatchDate,
        /// What did not match.
        message: String,
    },
}

impl BronzeError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.display().to_string(),
            source,
        }
    }

    /// `true` for errors that mean the document is simply absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
