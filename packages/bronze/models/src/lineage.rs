//! Provenance records for persisted documents.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The step that produced a lineage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    /// Raw document fetched and written to the bronze layer.
    Scrape,
    /// Document folded into the day's compacted archive.
    Archive,
    /// Document loaded from bronze into a downstream store.
    Load,
}

impl Transformation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Archive => "archive",
            Self::Load => "load",
        }
    }

    /// Where documents end up after this step.
    #[must_use]
    pub const fn destination(self) -> &'static str {
        match self {
            Self::Scrape => "bronze",
            Self::Archive => "bronze_archive",
            Self::Load => "warehouse",
        }
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    /// Unique within the day's log.
    pub lineage_id: String,
    /// Upstream system (e.g. `"fotmob_api"`).
    pub source: String,
    /// Match id the record is about.
    pub source_id: String,
    /// File the checksum was computed from.
    pub source_path: Option<PathBuf>,
    pub transformation: Transformation,
    pub destination: String,
    pub destination_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hex digest of `source_path` at record time.
    pub checksum: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub parent_lineage_ids: Vec<String>,
}

impl LineageRecord {
    /// `{source}_{source_id}_{transformation}_{YYYYmmdd_HHMMSS_micros}`.
    #[must_use]
    pub fn generate_id(
        source: &str,
        source_id: &str,
        transformation: Transformation,
        timestamp: DateTime<Utc>,
    ) -> String {
        format!(
            "{source}_{source_id}_{transformation}_{}",
            timestamp.format("%Y%m%d_%H%M%S_%6f")
        )
    }

    /// `true` if this record names `id` as its source or destination.
    #[must_use]
    pub fn references(&self, id: &str) -> bool {
        self.source_id == id || self.destination_id.as_deref() == Some(id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn id_carries_microsecond_precision() {
        let ts = Utc
            .with_ymd_and_hms(2025, 1, 1, 12, 30, 5)
            .unwrap()
            .checked_add_signed(chrono::Duration::microseconds(42))
            .unwrap();
        let id = LineageRecord::generate_id("fotmob_api", "123", Transformation::Scrape, ts);
        assert_eq!(id, "fotmob_api_123_scrape_20250101_123005_000042");
    }

    #[test]
    fn transformation_serializes_snake_case() {
        let json = serde_json::to_string(&Transformation::Archive).unwrap();
        assert_eq!(json, "\"archive\"");
    }
}
