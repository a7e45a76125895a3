#![allow(clippy::module_name_repetitions)]
//! Append-only audit log of where each stored document came from.
//!
//! Lineage is best-effort. A failure to record is logged and returns
//! `None`; it never fails the write it describes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use scout_bronze_models::{IntegrityReport, LineageRecord, MatchDate, Transformation};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::BronzeError;
use crate::atomic::{DirLock, write_json_atomic};
use crate::layout::BronzeLayout;

const LINEAGE_LOCK_NAME: &str = ".lineage.lock";

/// Everything needed to record one lineage step.
#[derive(Debug, Clone)]
pub struct LineageEntry<'a> {
    pub scraper: &'a str,
    /// Upstream system (e.g. `"fotmob_api"`).
    pub source: &'a str,
    pub source_id: &'a str,
    pub date: MatchDate,
    /// File the checksum is computed from.
    pub path: Option<&'a Path>,
    pub transformation: Transformation,
    pub destination_id: Option<&'a str>,
    pub metadata: BTreeMap<String, Value>,
    pub parent_lineage_ids: Vec<String>,
}

impl<'a> LineageEntry<'a> {
    /// A scrape step: `source_id` was fetched and written to `path`.
    #[must_use]
    pub fn scrape(
        scraper: &'a str,
        source: &'a str,
        source_id: &'a str,
        date: MatchDate,
        path: &'a Path,
    ) -> Self {
        Self {
            scraper,
            source,
            source_id,
            date,
            path: Some(path),
            transformation: Transformation::Scrape,
            destination_id: Some(source_id),
            metadata: BTreeMap::new(),
            parent_lineage_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parent_lineage_ids = parents;
        self
    }
}

/// Records and queries lineage, partitioned by scraper and day.
pub trait LineageLog: Send + Sync {
    /// Appends a record. Returns `None` (after logging) on any failure.
    fn record(&self, entry: LineageEntry<'_>) -> Option<LineageRecord>;

    /// Every record whose source or destination is `id`, oldest first.
    fn chain(&self, scraper: &str, date: &MatchDate, id: &str) -> Vec<LineageRecord>;

    /// Recomputes the checksum of the most recent checksummed record for
    /// `id` and compares it to the recorded one.
    fn verify_integrity(&self, scraper: &str, date: &MatchDate, id: &str) -> IntegrityReport {
        let chain = self.chain(scraper, date, id);
        if chain.is_empty() {
            return IntegrityReport::unverified(id, "No lineage records found");
        }

        let Some(latest) = chain
            .iter()
            .rev()
            .find(|r| r.checksum.is_some() && r.source_path.is_some())
        else {
            let mut report = IntegrityReport::unverified(id, "No checksummed lineage record");
            report.lineage_records = chain.len();
            return report;
        };

        let expected = latest.checksum.clone();
        let path = latest.source_path.clone();
        let current = path.as_deref().and_then(|p| sha256_file(p).ok());

        let reason = if current.is_none() {
            Some("Source file missing or unreadable".to_string())
        } else if current != expected {
            Some("Checksum mismatch".to_string())
        } else {
            None
        };

        IntegrityReport {
            verified: reason.is_none(),
            source_id: id.to_string(),
            reason,
            source_path: path,
            expected_checksum: expected,
            current_checksum: current,
            lineage_records: chain.len(),
        }
    }
}

/// Hex-encoded SHA-256 of a file, streamed in 8 KiB chunks.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`LineageLog`] storing `{scraper}/lineage/{date}/lineage.json`.
#[derive(Debug, Clone)]
pub struct FsLineageLog {
    data_dir: PathBuf,
    lock_timeout: Duration,
}

impl FsLineageLog {
    #[must_use]
    pub fn new(data_dir: &Path, lock_timeout: Duration) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            lock_timeout,
        }
    }

    fn log_path(&self, scraper: &str, date: &MatchDate) -> PathBuf {
        BronzeLayout::new(&self.data_dir, scraper).lineage_path(date)
    }

    fn read(path: &Path) -> Result<BTreeMap<String, LineageRecord>, BronzeError> {
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        let bytes = std::fs::read(path).map_err(|e| BronzeError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| BronzeError::json(path, e))
    }

    fn try_record(&self, entry: LineageEntry<'_>) -> Result<LineageRecord, BronzeError> {
        let path = self.log_path(entry.scraper, &entry.date);
        let dir = path
            .parent()
            .map_or_else(|| self.data_dir.clone(), Path::to_path_buf);
        let _lock = DirLock::acquire(&dir, LINEAGE_LOCK_NAME, self.lock_timeout)?;

        let mut records = match Self::read(&path) {
            Ok(records) => records,
            Err(e) => {
                let aside = path.with_extension(format!("json.corrupt-{}", Utc::now().timestamp()));
                log::warn!(
                    "Lineage log {} is unreadable ({e}); moving it to {}",
                    path.display(),
                    aside.display()
                );
                std::fs::rename(&path, &aside).map_err(|e| BronzeError::io(&path, e))?;
                BTreeMap::new()
            }
        };

        let timestamp = Utc::now();
        let checksum = entry.path.and_then(|p| match sha256_file(p) {
            Ok(sum) => Some(sum),
            Err(e) => {
                log::warn!("Could not checksum {}: {e}", p.display());
                None
            }
        });

        let base_id = LineageRecord::generate_id(
            entry.source,
            entry.source_id,
            entry.transformation,
            timestamp,
        );
        let mut lineage_id = base_id.clone();
        let mut n = 1;
        while records.contains_key(&lineage_id) {
            lineage_id = format!("{base_id}_{n}");
            n += 1;
        }

        let record = LineageRecord {
            lineage_id: lineage_id.clone(),
            source: entry.source.to_string(),
            source_id: entry.source_id.to_string(),
            source_path: entry.path.map(Path::to_path_buf),
            transformation: entry.transformation,
            destination: entry.transformation.destination().to_string(),
            destination_id: entry.destination_id.map(ToString::to_string),
            timestamp,
            checksum,
            metadata: entry.metadata,
            parent_lineage_ids: entry.parent_lineage_ids,
        };

        records.insert(lineage_id, record.clone());
        write_json_atomic(&path, &records)?;
        Ok(record)
    }
}

impl LineageLog for FsLineageLog {
    fn record(&self, entry: LineageEntry<'_>) -> Option<LineageRecord> {
        let source_id = entry.source_id.to_string();
        let transformation = entry.transformation;
        match self.try_record(entry) {
            Ok(record) => {
                log::debug!("Recorded lineage {}", record.lineage_id);
                Some(record)
            }
            Err(e) => {
                log::warn!("Failed to record {transformation} lineage for match {source_id}: {e}");
                None
            }
        }
    }

    fn chain(&self, scraper: &str, date: &MatchDate, id: &str) -> Vec<LineageRecord> {
        let path = self.log_path(scraper, date);
        let records = match Self::read(&path) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Could not read lineage log {}: {e}", path.display());
                return Vec::new();
            }
        };

        let mut chain: Vec<LineageRecord> = records
            .into_values()
            .filter(|r| r.references(id))
            .collect();
        chain.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.lineage_id.cmp(&b.lineage_id))
        });
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> MatchDate {
        MatchDate::parse("20250101").unwrap()
    }

    fn log(root: &Path) -> FsLineageLog {
        FsLineageLog::new(root, Duration::from_secs(1))
    }

    #[test]
    fn records_checksum_and_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("match_1.json");
        std::fs::write(&doc, b"{\"a\":1}").unwrap();
        let log = log(tmp.path());

        let record = log
            .record(LineageEntry::scrape("fotmob", "fotmob_api", "1", date(), &doc))
            .unwrap();
        assert_eq!(record.destination, "bronze");
        assert_eq!(record.checksum.as_deref().map(str::len), Some(64));
        assert!(record.lineage_id.starts_with("fotmob_api_1_scrape_"));

        let report = log.verify_integrity("fotmob", &date(), "1");
        assert!(report.verified, "{report:?}");
        assert_eq!(report.lineage_records, 1);
    }

    #[test]
    fn modified_file_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("match_1.json");
        std::fs::write(&doc, b"{\"a\":1}").unwrap();
        let log = log(tmp.path());
        log.record(LineageEntry::scrape("fotmob", "fotmob_api", "1", date(), &doc));

        std::fs::write(&doc, b"{\"a\":2}").unwrap();
        let report = log.verify_integrity("fotmob", &date(), "1");
        assert!(!report.verified);
        assert_eq!(report.reason.as_deref(), Some("Checksum mismatch"));

        std::fs::remove_file(&doc).unwrap();
        let report = log.verify_integrity("fotmob", &date(), "1");
        assert!(!report.verified);
        assert!(report.current_checksum.is_none());
    }

    #[test]
    fn unknown_id_is_unverified_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let report = log(tmp.path()).verify_integrity("fotmob", &date(), "nope");
        assert!(!report.verified);
        assert_eq!(report.reason.as_deref(), Some("No lineage records found"));
    }

    #[test]
    fn chain_is_ordered_and_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = tmp.path().join("match_1.json");
        std::fs::write(&doc, b"{}").unwrap();
        let log = log(tmp.path());

        let scrape = log
            .record(LineageEntry::scrape("fotmob", "fotmob_api", "1", date(), &doc))
            .unwrap();
        log.record(LineageEntry::scrape("fotmob", "fotmob_api", "2", date(), &doc));
        let archive = log
            .record(LineageEntry {
                transformation: Transformation::Archive,
                ..LineageEntry::scrape("fotmob", "fotmob_api", "1", date(), &doc)
            }
            .with_parents(vec![scrape.lineage_id.clone()]))
            .unwrap();

        let chain = log.chain("fotmob", &date(), "1");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].lineage_id, scrape.lineage_id);
        assert_eq!(chain[1].lineage_id, archive.lineage_id);
        assert_eq!(chain[1].parent_lineage_ids, [scrape.lineage_id]);
        assert_eq!(chain[1].destination, "bronze_archive");
    }

    #[test]
    fn missing_source_file_still_records() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("gone.json");
        let record = log(tmp.path())
            .record(LineageEntry::scrape("fotmob", "fotmob_api", "1", date(), &missing))
            .unwrap();
        assert!(record.checksum.is_none());
    }

    #[test]
    fn corrupt_log_is_set_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let log = log(tmp.path());
        let path = log.log_path("fotmob", &date());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"[broken").unwrap();

        let doc = tmp.path().join("match_1.json");
        std::fs::write(&doc, b"{}").unwrap();
        assert!(log
            .record(LineageEntry::scrape("fotmob", "fotmob_api", "1", date(), &doc))
            .is_some());
        assert_eq!(log.chain("fotmob", &date(), "1").len(), 1);
    }
}
