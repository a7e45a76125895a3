//! Resolving the set of match ids for a day.

use std::sync::Arc;
use std::time::Duration;

use scout_bronze::{ListingTracker, Resolution};
use scout_bronze_models::MatchDate;
use scout_source::{MatchSource, retry::backoff};

use crate::{IngestError, blocking};

/// Returns the day's ids: from the persisted listing when one exists,
/// otherwise from `source` (which then seeds the listing).
///
/// A remote empty list is retried like a transient error. Only after the
/// last attempt also comes back empty is "no matches" accepted.
///
/// # Errors
///
/// Returns [`IngestError::IdResolution`] on a permanent source error or when
/// the final attempt failed, and [`IngestError::Bronze`] if the listing
/// cannot be read or written.
pub async fn resolve_ids(
    source: &dyn MatchSource,
    listings: &Arc<dyn ListingTracker>,
    date: MatchDate,
    attempts: u32,
    base_delay: Duration,
) -> Result<Vec<String>, IngestError> {
    let tracker = Arc::clone(listings);
    if let Resolution::Cached(listing) = blocking(move || tracker.resolve(&date)).await?? {
        log::info!(
            "{date}: using cached listing ({} expected, {:.1}% stored)",
            listing.expected_ids().len(),
            listing.completion_percentage()
        );
        return Ok(listing.expected_ids().iter().cloned().collect());
    }

    let ids = fetch_with_retry(source, date, attempts, base_delay).await?;
    if ids.is_empty() {
        return Ok(ids);
    }

    let tracker = Arc::clone(listings);
    let seeded = ids.clone();
    blocking(move || tracker.initialize(&date, &seeded)).await??;
    Ok(ids)
}

/// Asks `source` for the day's ids with exponential backoff.
///
/// # Errors
///
/// Returns [`IngestError::IdResolution`] on a permanent error, or when the
/// last of `attempts` failed with a transient one.
pub async fn fetch_with_retry(
    source: &dyn MatchSource,
    date: MatchDate,
    attempts: u32,
    base_delay: Duration,
) -> Result<Vec<String>, IngestError> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match source.fetch_ids_for_date(&date).await {
            Ok(ids) if !ids.is_empty() => return Ok(ids),
            Ok(_) => {
                log::warn!("{date}: source returned no ids (attempt {attempt}/{attempts})");
                last_error = None;
            }
            Err(e) if e.is_retryable() => {
                log::warn!("{date}: id fetch failed (attempt {attempt}/{attempts}): {e}");
                last_error = Some(e);
            }
            Err(e) => {
                return Err(IngestError::IdResolution {
                    date,
                    message: e.to_string(),
                });
            }
        }

        if attempt < attempts {
            let delay = backoff(base_delay, attempt);
            log::debug!("{date}: retrying id fetch in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    match last_error {
        Some(e) => Err(IngestError::IdResolution {
            date,
            message: format!("gave up after {attempts} attempts: {e}"),
        }),
        None => {
            log::info!("{date}: no matches after {attempts} attempts");
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use scout_bronze::FsListingTracker;
    use scout_source::{FetchError, FetchSession};

    use super::*;

    struct ScriptedSource {
        replies: Mutex<VecDeque<Result<Vec<String>, FetchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<Vec<String>, FetchError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MatchSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_ids_for_date(&self, _date: &MatchDate) -> Result<Vec<String>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        fn session(&self) -> Result<Box<dyn FetchSession>, FetchError> {
            Err(FetchError::permanent("not used"))
        }
    }

    fn date() -> MatchDate {
        MatchDate::parse("20250101").unwrap()
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn transient_then_success() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::transient("timeout")),
            Ok(Vec::new()),
            Ok(ids(&["1", "2"])),
        ]);
        let got = fetch_with_retry(&source, date(), 5, Duration::ZERO).await.unwrap();
        assert_eq!(got, ids(&["1", "2"]));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_after_all_attempts_means_no_matches() {
        let source = ScriptedSource::new(Vec::new());
        let got = fetch_with_retry(&source, date(), 3, Duration::ZERO).await.unwrap();
        assert!(got.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let source = ScriptedSource::new(vec![Err(FetchError::permanent("HTTP 401"))]);
        let err = fetch_with_retry(&source, date(), 5, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, IngestError::IdResolution { .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_transient_errors_fail() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::transient("a")),
            Err(FetchError::transient("b")),
        ]);
        let err = fetch_with_retry(&source, date(), 2, Duration::ZERO).await.unwrap_err();
        assert!(err.to_string().contains("gave up after 2 attempts"));
    }

    #[tokio::test]
    async fn cached_listing_skips_the_source() {
        let tmp = tempfile::tempdir().unwrap();
        let listings: Arc<dyn ListingTracker> = Arc::new(FsListingTracker::new(
            tmp.path(),
            "fotmob",
            Duration::from_secs(5),
        ));

        let source = ScriptedSource::new(vec![Ok(ids(&["7", "8"]))]);
        let first = resolve_ids(&source, &listings, date(), 3, Duration::ZERO).await.unwrap();
        assert_eq!(first, ids(&["7", "8"]));

        let second = resolve_ids(&source, &listings, date(), 3, Duration::ZERO).await.unwrap();
        assert_eq!(second, ids(&["7", "8"]));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
