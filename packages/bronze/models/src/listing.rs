//! Expected-versus-stored accounting for one day.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MatchDate;

/// What [`Listing::mark_stored`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The id moved from missing to stored.
    Stored,
    /// The id was already stored; nothing changed.
    AlreadyStored,
    /// The id is not part of the expected set; nothing changed.
    NotExpected,
}

/// The expected id set for a day and how much of it has landed.
///
/// `stored_ids` and `missing_ids` always partition `expected_ids`. All
/// mutation goes through methods that recompute the derived fields, so a
/// deserialized listing is the only way to observe an inconsistent one
/// (see [`Listing::is_consistent`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    date: MatchDate,
    resolved_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expected_ids: BTreeSet<String>,
    stored_ids: BTreeSet<String>,
    missing_ids: BTreeSet<String>,
    #[serde(default)]
    document_sizes: BTreeMap<String, u64>,
    total_size_bytes: u64,
    completion_pct: f64,
}

impl Listing {
    /// A fresh listing with nothing stored yet.
    #[must_use]
    pub fn new<I>(date: MatchDate, ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let now = Utc::now();
        let expected_ids: BTreeSet<String> = ids.into_iter().collect();
        let mut listing = Self {
            date,
            resolved_at: now,
            updated_at: now,
            missing_ids: expected_ids.clone(),
            expected_ids,
            stored_ids: BTreeSet::new(),
            document_sizes: BTreeMap::new(),
            total_size_bytes: 0,
            completion_pct: 0.0,
        };
        listing.recompute();
        listing
    }

    /// Replaces the expected set, keeping stored ids that are still
    /// expected along with their recorded sizes.
    ///
    /// Returns `false` (and changes nothing) when the set is unchanged.
    pub fn reinitialize<I>(&mut self, ids: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let ids: BTreeSet<String> = ids.into_iter().collect();
        if ids == self.expected_ids {
            return false;
        }
        self.stored_ids.retain(|id| ids.contains(id));
        self.document_sizes.retain(|id, _| ids.contains(id));
        self.expected_ids = ids;
        self.resolved_at = Utc::now();
        self.recompute();
        true
    }

    /// Moves `id` from missing to stored and records its size.
    pub fn mark_stored(&mut self, id: &str, size_bytes: u64) -> MarkOutcome {
        if !self.expected_ids.contains(id) {
            return MarkOutcome::NotExpected;
        }
        if self.stored_ids.contains(id) {
            return MarkOutcome::AlreadyStored;
        }
        self.stored_ids.insert(id.to_string());
        self.document_sizes.insert(id.to_string(), size_bytes);
        self.recompute();
        MarkOutcome::Stored
    }

    fn recompute(&mut self) {
        self.stored_ids.retain(|id| self.expected_ids.contains(id));
        self.missing_ids = self
            .expected_ids
            .difference(&self.stored_ids)
            .cloned()
            .collect();
        self.total_size_bytes = self
            .stored_ids
            .iter()
            .filter_map(|id| self.document_sizes.get(id))
            .sum();
        self.completion_pct = completion_pct(self.stored_ids.len(), self.expected_ids.len());
        self.updated_at = Utc::now();
    }

    /// The day this listing covers.
    #[must_use]
    pub const fn date(&self) -> MatchDate {
        self.date
    }

    /// When the expected set was last resolved.
    #[must_use]
    pub const fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }

    /// When the listing last changed.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    #[must_use]
    pub const fn expected_ids(&self) -> &BTreeSet<String> {
        &self.expected_ids
    }

    #[must_use]
    pub const fn stored_ids(&self) -> &BTreeSet<String> {
        &self.stored_ids
    }

    #[must_use]
    pub const fn missing_ids(&self) -> &BTreeSet<String> {
        &self.missing_ids
    }

    /// Sum of the recorded sizes of all stored documents.
    #[must_use]
    pub const fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    /// `100 * stored / expected`, rounded to two decimals; `0` for an empty
    /// expected set.
    #[must_use]
    pub const fn completion_percentage(&self) -> f64 {
        self.completion_pct
    }

    /// Every expected id is stored (and there is at least one).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.expected_ids.is_empty() && self.missing_ids.is_empty()
    }

    /// `true` when stored and missing partition the expected set and the
    /// derived completion figure agrees with the sets.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let union: BTreeSet<&String> = self.stored_ids.union(&self.missing_ids).collect();
        let expected: BTreeSet<&String> = self.expected_ids.iter().collect();
        union == expected
            && self.stored_ids.is_disjoint(&self.missing_ids)
            && (self.completion_pct
                - completion_pct(self.stored_ids.len(), self.expected_ids.len()))
            .abs()
                < f64::EPSILON
    }

    /// Rebuilds derived fields from the id sets, for listings read from disk.
    pub fn repair(&mut self) {
        self.recompute();
    }
}

#[allow(clippy::cast_precision_loss)]
fn completion_pct(stored: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    (stored as f64 / expected as f64 * 100.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> MatchDate {
        MatchDate::parse("20250101").unwrap()
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn new_listing_is_all_missing() {
        let listing = Listing::new(date(), ids(&["A", "B", "C"]));
        assert_eq!(listing.missing_ids().len(), 3);
        assert!(listing.stored_ids().is_empty());
        assert!(listing.completion_percentage().abs() < f64::EPSILON);
        assert!(listing.is_consistent());
    }

    #[test]
    fn partition_holds_after_every_mark() {
        let mut listing = Listing::new(date(), ids(&["A", "B", "C"]));
        for (id, size) in [("A", 10), ("C", 5), ("A", 99), ("Z", 1), ("B", 1)] {
            listing.mark_stored(id, size);
            assert!(listing.is_consistent(), "inconsistent after marking {id}");
        }
        assert!(listing.is_complete());
        assert_eq!(listing.total_size_bytes(), 16);
        assert!((listing.completion_percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mark_outcomes() {
        let mut listing = Listing::new(date(), ids(&["A"]));
        assert_eq!(listing.mark_stored("A", 1), MarkOutcome::Stored);
        assert_eq!(listing.mark_stored("A", 1), MarkOutcome::AlreadyStored);
        assert_eq!(listing.mark_stored("B", 1), MarkOutcome::NotExpected);
    }

    #[test]
    fn completion_rounds_to_two_decimals() {
        let mut listing = Listing::new(date(), ids(&["A", "B", "C"]));
        listing.mark_stored("A", 1);
        assert!((listing.completion_percentage() - 33.33).abs() < 1e-9);
    }

    #[test]
    fn empty_expected_set_is_zero_percent_and_not_complete() {
        let listing = Listing::new(date(), Vec::new());
        assert!(listing.completion_percentage().abs() < f64::EPSILON);
        assert!(!listing.is_complete());
    }

    #[test]
    fn reinitialize_keeps_surviving_stored_ids() {
        let mut listing = Listing::new(date(), ids(&["A", "B"]));
        listing.mark_stored("A", 7);
        listing.mark_stored("B", 3);

        assert!(!listing.reinitialize(ids(&["B", "A"])));

        assert!(listing.reinitialize(ids(&["A", "C"])));
        assert_eq!(listing.stored_ids().len(), 1);
        assert!(listing.missing_ids().contains("C"));
        assert_eq!(listing.total_size_bytes(), 7);
        assert!(listing.is_consistent());
    }
}
