#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Match source contracts.
//!
//! A provider implements [`MatchSource`] to list a day's match ids and to
//! open [`FetchSession`]s that fetch one raw document per call. Sessions
//! are long-lived: the orchestrator opens one per worker and reuses it for
//! every id that worker handles.

pub mod http;
pub mod progress;
pub mod retry;

use async_trait::async_trait;
use scout_bronze_models::MatchDate;

pub use http::HttpMatchSource;

/// Errors from a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Timeout, connection failure, rate limiting, server error, or an
    /// undecodable body. Worth retrying later.
    #[error("Transient fetch error: {message}")]
    Transient {
        /// What went wrong.
        message: String,
    },

    /// Malformed request, unauthorized, or an unexpected response shape.
    /// Retrying will not help.
    #[error("Permanent fetch error: {message}")]
    Permanent {
        /// What went wrong.
        message: String,
    },

    /// The source has no document for this id.
    #[error("Match {id} not found")]
    NotFound {
        /// The requested id.
        id: String,
    },
}

impl FetchError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// `true` only for [`FetchError::Transient`].
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// A provider of match ids and documents.
#[async_trait]
pub trait MatchSource: Send + Sync {
    /// Upstream system name recorded in lineage (e.g. `"fotmob_api"`).
    fn name(&self) -> &str;

    /// Ids of every match on `date`. An empty list is ambiguous between
    /// "no matches" and a silent upstream failure.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the listing could not be fetched.
    async fn fetch_ids_for_date(&self, date: &MatchDate) -> Result<Vec<String>, FetchError>;

    /// Opens a reusable connection for fetching documents.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Permanent`] if the session cannot be built.
    fn session(&self) -> Result<Box<dyn FetchSession>, FetchError>;
}

/// One reusable connection to a [`MatchSource`].
#[async_trait]
pub trait FetchSession: Send {
    /// Fetches the raw document for `id` in a single attempt.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] classified as transient, permanent, or not
    /// found.
    async fn fetch_document(&mut self, id: &str) -> Result<serde_json::Value, FetchError>;
}
