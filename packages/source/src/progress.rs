//! Per-day progress for a scrape.
//!
//! One orchestrator run drives one sink: `set_total` with the day's
//! resolved id count, `inc` once per id as it is stored, fails, or is
//! skipped because it was already stored, then a single `finish` carrying
//! the `ok/failed/skipped` line. The `scout_ingest` binary renders this as
//! an `indicatif` bar per day.

use std::sync::Arc;

/// Sink for match-level progress during a day's scrape.
///
/// Workers report concurrently, so implementations must be `Send + Sync`.
pub trait ProgressCallback: Send + Sync {
    /// Ids resolved for the day, including ones that will be skipped.
    fn set_total(&self, total: u64);

    /// `delta` more ids accounted for. Skipped ids arrive in one batch
    /// before any fetch starts.
    fn inc(&self, delta: u64);

    /// The match id just stored, as `match {id}`.
    fn set_message(&self, msg: String);

    /// The day is done, or had no matches to fetch.
    fn finish(&self, msg: String);
}

/// Discards progress. The default when no bar is attached.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
