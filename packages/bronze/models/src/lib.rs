#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Bronze layer types shared by the storage, ingestion, and backup crates.
//!
//! The bronze layer holds raw match documents exactly as they were fetched,
//! one document per `(date, match id)`, plus the per-date bookkeeping that
//! goes with them: the expected-id [`Listing`], the [`LineageRecord`] audit
//! trail, and the compacted archive.

pub mod lineage;
pub mod listing;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Datelike as _, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use lineage::{LineageRecord, Transformation};
pub use listing::{Listing, MarkOutcome};

/// Returned when a date string is neither `YYYYMMDD` nor `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid date format: {0}. Expected YYYYMMDD or YYYY-MM-DD")]
pub struct InvalidDate(pub String);

/// A calendar day, always rendered in the compact `YYYYMMDD` form.
///
/// Every path, listing, lineage partition, and backup key is derived from
/// the compact form, so two spellings of the same day can never land in
/// different directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatchDate(NaiveDate);

impl MatchDate {
    /// Parses `YYYYMMDD` or `YYYY-MM-DD`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidDate`] for any other shape or for an impossible
    /// calendar day.
    pub fn parse(value: &str) -> Result<Self, InvalidDate> {
        let value = value.trim();
        let format = if value.len() == 10 && value.contains('-') {
            "%Y-%m-%d"
        } else if value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()) {
            "%Y%m%d"
        } else {
            return Err(InvalidDate(value.to_string()));
        };

        NaiveDate::parse_from_str(value, format)
            .map(Self)
            .map_err(|_| InvalidDate(value.to_string()))
    }

    /// Wraps an existing [`NaiveDate`].
    #[must_use]
    pub const fn from_naive(date: NaiveDate) -> Self {
        Self(date)
    }

    /// The underlying calendar day.
    #[must_use]
    pub const fn naive(&self) -> NaiveDate {
        self.0
    }

    /// `YYYYMMDD`.
    #[must_use]
    pub fn compact(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    /// `YYYYMM`, used to bucket remote backups by month.
    #[must_use]
    pub fn year_month(&self) -> String {
        format!("{:04}{:02}", self.0.year(), self.0.month())
    }

    /// The following day, if representable.
    #[must_use]
    pub fn succ(&self) -> Option<Self> {
        self.0.succ_opt().map(Self)
    }
}

impl fmt::Display for MatchDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

impl FromStr for MatchDate {
    type Err = InvalidDate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MatchDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.compact())
    }
}

impl<'de> Deserialize<'de> for MatchDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The on-disk envelope around one raw match document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Source-defined match identifier.
    pub match_id: String,
    /// When the payload was fetched.
    pub scraped_at: DateTime<Utc>,
    /// The day this document belongs to.
    pub date: MatchDate,
    /// The payload exactly as received.
    pub data: serde_json::Value,
}

/// Outcome of a per-item batch save.
///
/// Partial failures are reported per id; a batch is never rolled back.
#[derive(Debug, Clone, Default)]
pub struct BatchSaveReport {
    /// Ids that were saved, with their final location.
    pub saved: Vec<(String, PathBuf)>,
    /// Ids that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl BatchSaveReport {
    /// `true` when every item was saved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The compacted form of one day's documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Day the archive covers.
    pub date: MatchDate,
    /// Location of the archive file.
    pub path: PathBuf,
    /// Number of compressed documents inside.
    pub member_count: u64,
    /// Archive size on disk.
    pub size_bytes: u64,
}

/// What a compaction call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStatus {
    /// A new archive was written and verified; individual files removed.
    Completed,
    /// A valid archive already existed and `force` was not set.
    AlreadyCompacted,
    /// The date directory exists but holds no documents.
    NoFiles,
    /// Nothing has ever been stored for the date.
    NoDirectory,
}

/// Result of compacting one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionResult {
    /// What happened.
    pub status: CompactionStatus,
    /// Documents bundled in this call (0 unless `Completed`).
    pub compacted: u64,
    /// Total size of the individual documents before compaction.
    pub size_before_bytes: u64,
    /// Archive size after compaction.
    pub size_after_bytes: u64,
    /// The archive, when one exists.
    pub archive: Option<ArchiveInfo>,
}

impl CompactionResult {
    /// A result that did no work.
    #[must_use]
    pub fn skipped(status: CompactionStatus, archive: Option<ArchiveInfo>) -> Self {
        let size_after_bytes = archive.as_ref().map_or(0, |info| info.size_bytes);
        Self {
            status,
            compacted: 0,
            size_before_bytes: 0,
            size_after_bytes,
            archive,
        }
    }

    /// Percentage of bytes saved, rounded to one decimal.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn saved_pct(&self) -> f64 {
        if self.size_before_bytes == 0 {
            return 0.0;
        }
        let saved = self.size_before_bytes.saturating_sub(self.size_after_bytes) as f64;
        (saved / self.size_before_bytes as f64 * 1000.0).round() / 10.0
    }
}

/// Result of re-checking a document against its recorded checksum.
///
/// Lineage verification never fails loudly: a missing file or a missing
/// record is reported as `verified = false` with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Whether the current checksum matches the recorded one.
    pub verified: bool,
    /// The match id that was checked.
    pub source_id: String,
    /// Why verification failed, when it did.
    pub reason: Option<String>,
    /// File that was hashed.
    pub source_path: Option<PathBuf>,
    /// Checksum recorded in the lineage log.
    pub expected_checksum: Option<String>,
    /// Checksum of the file right now.
    pub current_checksum: Option<String>,
    /// Number of lineage records in the chain.
    pub lineage_records: usize,
}

impl IntegrityReport {
    /// An unverified report with only a reason.
    #[must_use]
    pub fn unverified(source_id: &str, reason: impl Into<String>) -> Self {
        Self {
            verified: false,
            source_id: source_id.to_string(),
            reason: Some(reason.into()),
            source_path: None,
            expected_checksum: None,
            current_checksum: None,
            lineage_records: 0,
        }
    }
}

/// Status of a single pre-flight check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ok,
    Warning,
    Fail,
}

/// One pre-flight check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Short check name (e.g. `"Write Permissions"`).
    pub name: String,
    /// Outcome.
    pub status: HealthStatus,
    /// Human-readable detail.
    pub message: String,
    /// A failing critical check aborts the run.
    pub critical: bool,
}

/// All pre-flight checks for a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Individual checks, in the order they ran.
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// `true` when every check passed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|c| c.status == HealthStatus::Ok)
    }

    /// Checks that failed and are marked critical.
    #[must_use]
    pub fn critical_failures(&self) -> Vec<&HealthCheck> {
        self.checks
            .iter()
            .filter(|c| c.critical && c.status == HealthStatus::Fail)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_date_spellings_to_the_same_day() {
        let compact = MatchDate::parse("20250101").unwrap();
        let dashed = MatchDate::parse("2025-01-01").unwrap();
        assert_eq!(compact, dashed);
        assert_eq!(dashed.to_string(), "20250101");
        assert_eq!(dashed.year_month(), "202501");
    }

    #[test]
    fn rejects_malformed_dates() {
        for bad in ["2025011", "2025/01/01", "20251301", "yesterday", ""] {
            assert!(MatchDate::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn date_serializes_compact() {
        let date = MatchDate::parse("2024-02-29").unwrap();
        let json = serde_json::to_string(&date).unwrap();
        assert_eq!(json, "\"20240229\"");
        let back: MatchDate = serde_json::from_str("\"2024-02-29\"").unwrap();
        assert_eq!(back, date);
    }

    #[test]
    fn saved_pct_handles_empty_input() {
        let result = CompactionResult::skipped(CompactionStatus::NoFiles, None);
        assert!(result.saved_pct().abs() < f64::EPSILON);

        let result = CompactionResult {
            status: CompactionStatus::Completed,
            compacted: 2,
            size_before_bytes: 1000,
            size_after_bytes: 250,
            archive: None,
        };
        assert!((result.saved_pct() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn critical_failures_only_counts_critical_fails() {
        let report = HealthReport {
            checks: vec![
                HealthCheck {
                    name: "Write Permissions".to_string(),
                    status: HealthStatus::Fail,
                    message: "denied".to_string(),
                    critical: true,
                },
                HealthCheck {
                    name: "Lineage Directory".to_string(),
                    status: HealthStatus::Warning,
                    message: "missing".to_string(),
                    critical: false,
                },
            ],
        };
        assert!(!report.is_healthy());
        assert_eq!(report.critical_failures().len(), 1);
    }
}
