#![allow(clippy::module_name_repetitions)]
//! Persisted per-day listings of expected match ids.

use std::path::Path;
use std::time::Duration;

use scout_bronze_models::{Listing, MarkOutcome, MatchDate};

use crate::atomic::{DirLock, write_json_atomic};
use crate::layout::BronzeLayout;
use crate::{BronzeError, store};

const LISTING_LOCK_NAME: &str = ".listing.lock";

/// What [`ListingTracker::resolve`] found.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A persisted listing with a non-empty expected set. Use it instead of
    /// asking the remote source.
    Cached(Listing),
    /// No usable listing; the caller must fetch ids and `initialize`.
    NeedsFetch,
}

/// Tracks, per day, which ids should exist and which have been stored.
pub trait ListingTracker: Send + Sync {
    /// Returns the cached listing for `date`, or says the ids must be fetched.
    ///
    /// # Errors
    ///
    /// Returns an error only when the listing directory itself is
    /// unreadable; a corrupt listing file resolves to
    /// [`Resolution::NeedsFetch`].
    fn resolve(&self, date: &MatchDate) -> Result<Resolution, BronzeError>;

    /// Persists `ids` as the expected set for `date`.
    ///
    /// An empty set is refused (returns `Ok(None)`, nothing persisted). An
    /// unchanged set is a no-op. A changed set keeps stored ids that are
    /// still expected.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be written or locked.
    fn initialize(&self, date: &MatchDate, ids: &[String]) -> Result<Option<Listing>, BronzeError>;

    /// Moves `id` from missing to stored, recording its stored size.
    ///
    /// Without a listing for `date`, or for an id outside the expected set,
    /// returns [`MarkOutcome::NotExpected`] and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be written or locked.
    fn mark_stored(&self, date: &MatchDate, id: &str) -> Result<MarkOutcome, BronzeError>;

    /// The persisted listing for `date`, if one exists and parses.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing file exists but cannot be read.
    fn load(&self, date: &MatchDate) -> Result<Option<Listing>, BronzeError>;

    /// Completion percentage for `date`, or `None` without a listing.
    fn completion_percentage(&self, date: &MatchDate) -> Option<f64> {
        self.load(date)
            .ok()
            .flatten()
            .map(|listing| listing.completion_percentage())
    }
}

/// [`ListingTracker`] storing `daily_listings/{date}/matches.json`.
#[derive(Debug, Clone)]
pub struct FsListingTracker {
    layout: BronzeLayout,
    lock_timeout: Duration,
}

impl FsListingTracker {
    #[must_use]
    pub fn new(data_dir: &Path, scraper: &str, lock_timeout: Duration) -> Self {
        Self {
            layout: BronzeLayout::new(data_dir, scraper),
            lock_timeout,
        }
    }

    fn lock(&self, date: &MatchDate) -> Result<DirLock, BronzeError> {
        let dir = self.layout.listings_dir().join(date.compact());
        DirLock::acquire(&dir, LISTING_LOCK_NAME, self.lock_timeout)
    }

    fn read(&self, date: &MatchDate) -> Result<Option<Listing>, BronzeError> {
        let path = self.layout.listing_path(date);
        if !path.is_file() {
            return Ok(None);
        }

        let bytes = std::fs::read(&path).map_err(|e| BronzeError::io(&path, e))?;
        match serde_json::from_slice::<Listing>(&bytes) {
            Ok(mut listing) => {
                if !listing.is_consistent() {
                    log::warn!("Listing for {date} was inconsistent, repairing");
                    listing.repair();
                }
                Ok(Some(listing))
            }
            Err(e) => {
                log::warn!("Ignoring corrupt listing {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    fn write(&self, listing: &Listing) -> Result<(), BronzeError> {
        let path = self.layout.listing_path(&listing.date());
        write_json_atomic(&path, listing)?;
        Ok(())
    }
}

impl ListingTracker for FsListingTracker {
    fn resolve(&self, date: &MatchDate) -> Result<Resolution, BronzeError> {
        match self.read(date)? {
            Some(listing) if !listing.expected_ids().is_empty() => {
                log::info!(
                    "Using cached listing for {date}: {} expected, {} stored",
                    listing.expected_ids().len(),
                    listing.stored_ids().len()
                );
                Ok(Resolution::Cached(listing))
            }
            _ => Ok(Resolution::NeedsFetch),
        }
    }

    fn initialize(&self, date: &MatchDate, ids: &[String]) -> Result<Option<Listing>, BronzeError> {
        if ids.is_empty() {
            log::warn!("Refusing to persist an empty listing for {date}");
            return Ok(None);
        }

        let _lock = self.lock(date)?;
        let listing = match self.read(date)? {
            Some(mut existing) => {
                if !existing.reinitialize(ids.iter().cloned()) {
                    log::debug!("Listing for {date} unchanged");
                    return Ok(Some(existing));
                }
                log::info!(
                    "Listing for {date} re-initialized: {} expected, {} still stored",
                    existing.expected_ids().len(),
                    existing.stored_ids().len()
                );
                existing
            }
            None => {
                let listing = Listing::new(*date, ids.iter().cloned());
                log::info!(
                    "Listing for {date} initialized with {} ids",
                    listing.expected_ids().len()
                );
                listing
            }
        };

        self.write(&listing)?;
        Ok(Some(listing))
    }

    fn mark_stored(&self, date: &MatchDate, id: &str) -> Result<MarkOutcome, BronzeError> {
        let _lock = self.lock(date)?;
        let Some(mut listing) = self.read(date)? else {
            log::debug!("No listing for {date}; not marking {id}");
            return Ok(MarkOutcome::NotExpected);
        };

        let size = store::stored_size(&self.layout, date, id).unwrap_or(0);
        let outcome = listing.mark_stored(id, size);
        match outcome {
            MarkOutcome::Stored => self.write(&listing)?,
            MarkOutcome::AlreadyStored => {}
            MarkOutcome::NotExpected => {
                log::warn!("Match {id} is not in the listing for {date}");
            }
        }

        Ok(outcome)
    }

    fn load(&self, date: &MatchDate) -> Result<Option<Listing>, BronzeError> {
        self.read(date)
    }
}
