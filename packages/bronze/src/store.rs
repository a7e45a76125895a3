#![allow(clippy::module_name_repetitions)]
//! Durable storage of one raw document per `(date, match id)`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use scout_bronze_models::{
    ArchiveInfo, BatchSaveReport, CompactionResult, HealthReport, MatchDate, StoredDocument,
};
use serde_json::Value;

use crate::atomic::{DirLock, write_atomic};
use crate::compact::ArchiveCompactor;
use crate::layout::{self, BronzeLayout, validate_id};
use crate::{BronzeError, archive, health};

/// Name of the lock file taken inside a date directory during batch writes
/// and compaction.
pub const BATCH_LOCK_NAME: &str = ".batch_write.lock";

/// Persisted document storage for a single scraper.
///
/// Implementations must make `save` atomic: a reader sees either the
/// previous document or the complete new one. `exists` and `load` look in
/// the individual file first and the day's archive second.
pub trait DocumentStore: Send + Sync {
    /// Writes `payload` for `(date, id)`, overwriting any previous version.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is unusable or the write or its
    /// validation fails; the previous version is left untouched.
    fn save(&self, date: &MatchDate, id: &str, payload: &Value) -> Result<PathBuf, BronzeError>;

    /// `true` if a document for `(date, id)` is stored individually or in
    /// the day's archive.
    fn exists(&self, date: &MatchDate, id: &str) -> bool;

    /// Returns the stored payload for `(date, id)`.
    ///
    /// # Errors
    ///
    /// Returns [`BronzeError::NotFound`] if neither the individual file nor
    /// an archive member exists, or a read error for a corrupt document.
    fn load(&self, date: &MatchDate, id: &str) -> Result<Value, BronzeError>;

    /// Saves many documents under one directory lock.
    ///
    /// Each item is written atomically on its own; failures are reported
    /// per id and never roll back the items that succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`BronzeError::LockTimeout`] if the directory lock cannot be
    /// acquired in time. Per-item failures go in the report instead.
    fn save_batch(
        &self,
        date: &MatchDate,
        items: &[(String, Value)],
    ) -> Result<BatchSaveReport, BronzeError>;

    /// Bundles the day's documents into a verified archive.
    ///
    /// # Errors
    ///
    /// Returns [`BronzeError::Integrity`] when verification fails; every
    /// individual document is kept in that case.
    fn compact(&self, date: &MatchDate, force: bool) -> Result<CompactionResult, BronzeError>;

    /// Every id with a stored document for the day, individual or archived.
    ///
    /// # Errors
    ///
    /// Returns an error if the date directory or archive cannot be read.
    fn stored_ids(&self, date: &MatchDate) -> Result<BTreeSet<String>, BronzeError>;

    /// Where the individual document for `(date, id)` lives.
    fn document_path(&self, date: &MatchDate, id: &str) -> PathBuf;

    /// The day's archive, if one has been written.
    fn archive(&self, date: &MatchDate) -> Option<ArchiveInfo>;

    /// Pre-flight checks, run before any fetching starts.
    fn health_check(&self) -> HealthReport;
}

/// [`DocumentStore`] backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    layout: BronzeLayout,
    lock_timeout: Duration,
    compactor: ArchiveCompactor,
}

impl FsDocumentStore {
    /// A store rooted at `{data_dir}/{scraper}`.
    #[must_use]
    pub fn new(data_dir: &Path, scraper: &str, lock_timeout: Duration) -> Self {
        let layout = BronzeLayout::new(data_dir, scraper);
        Self {
            compactor: ArchiveCompactor::new(layout.clone(), lock_timeout),
            layout,
            lock_timeout,
        }
    }

    #[must_use]
    pub const fn layout(&self) -> &BronzeLayout {
        &self.layout
    }

    fn save_unlocked(
        &self,
        date: &MatchDate,
        id: &str,
        payload: &Value,
    ) -> Result<PathBuf, BronzeError> {
        validate_id(id)?;

        let document = StoredDocument {
            match_id: id.to_string(),
            scraped_at: Utc::now(),
            date: *date,
            data: payload.clone(),
        };
        let path = self.layout.document_path(date, id);
        let bytes = serde_json::to_vec_pretty(&document).map_err(|e| BronzeError::json(&path, e))?;

        write_atomic(&path, &bytes, |tmp| validate_document(tmp, id))?;

        log::debug!("Saved match {id} ({} bytes) to {}", bytes.len(), path.display());
        Ok(path)
    }
}

/// Checks that a freshly written document parses and carries the right id.
fn validate_document(path: &Path, id: &str) -> Result<(), BronzeError> {
    let written = std::fs::read(path).map_err(|e| BronzeError::io(path, e))?;
    let document: StoredDocument =
        serde_json::from_slice(&written).map_err(|e| BronzeError::json(path, e))?;
    if document.match_id != id {
        return Err(BronzeError::Validation {
            path: path.display().to_string(),
            message: format!("expected match_id {id}, found {}", document.match_id),
        });
    }
    Ok(())
}

/// Parses a stored envelope and returns its payload.
pub(crate) fn decode_document(path: &Path, bytes: &[u8]) -> Result<Value, BronzeError> {
    let document: StoredDocument =
        serde_json::from_slice(bytes).map_err(|e| BronzeError::json(path, e))?;
    Ok(document.data)
}

/// Size of the stored document for `(date, id)`: the individual file if
/// present, else the compressed archive member.
#[must_use]
pub fn stored_size(layout: &BronzeLayout, date: &MatchDate, id: &str) -> Option<u64> {
    let path = layout.document_path(date, id);
    if let Ok(meta) = std::fs::metadata(&path) {
        return Some(meta.len());
    }

    let archive_path = layout.archive_path(date);
    if !archive_path.is_file() {
        return None;
    }
    let member = layout::member_name(id);
    archive::list_members(&archive_path)
        .ok()?
        .into_iter()
        .find_map(|(name, size)| (name == member).then_some(size))
}

/// Ids of the individual `match_{id}.json` files in a date directory.
pub(crate) fn individual_ids(date_dir: &Path) -> Result<BTreeSet<String>, BronzeError> {
    let mut ids = BTreeSet::new();
    if !date_dir.is_dir() {
        return Ok(ids);
    }

    for entry in std::fs::read_dir(date_dir).map_err(|e| BronzeError::io(date_dir, e))? {
        let entry = entry.map_err(|e| BronzeError::io(date_dir, e))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(layout::id_from_document_name) {
            ids.insert(id.to_string());
        }
    }

    Ok(ids)
}

impl DocumentStore for FsDocumentStore {
    fn save(&self, date: &MatchDate, id: &str, payload: &Value) -> Result<PathBuf, BronzeError> {
        self.save_unlocked(date, id, payload)
    }

    fn exists(&self, date: &MatchDate, id: &str) -> bool {
        if validate_id(id).is_err() {
            return false;
        }
        if self.layout.document_path(date, id).is_file() {
            return true;
        }

        let archive_path = self.layout.archive_path(date);
        if !archive_path.is_file() {
            return false;
        }
        let member = layout::member_name(id);
        match archive::list_members(&archive_path) {
            Ok(members) => members.iter().any(|(name, _)| *name == member),
            Err(e) => {
                log::warn!("Could not read archive {}: {e}", archive_path.display());
                false
            }
        }
    }

    fn load(&self, date: &MatchDate, id: &str) -> Result<Value, BronzeError> {
        validate_id(id)?;

        let path = self.layout.document_path(date, id);
        if path.is_file() {
            let bytes = std::fs::read(&path).map_err(|e| BronzeError::io(&path, e))?;
            return decode_document(&path, &bytes);
        }

        let archive_path = self.layout.archive_path(date);
        if archive_path.is_file() {
            if let Some(raw) = archive::read_member(&archive_path, &layout::member_name(id))? {
                let bytes = archive::gunzip(&archive_path, &raw)?;
                return decode_document(&archive_path, &bytes);
            }
        }

        Err(BronzeError::NotFound {
            date: *date,
            id: id.to_string(),
        })
    }

    fn save_batch(
        &self,
        date: &MatchDate,
        items: &[(String, Value)],
    ) -> Result<BatchSaveReport, BronzeError> {
        let date_dir = self.layout.date_dir(date);
        let _lock = DirLock::acquire(&date_dir, BATCH_LOCK_NAME, self.lock_timeout)?;

        let mut report = BatchSaveReport::default();
        for (id, payload) in items {
            match self.save_unlocked(date, id, payload) {
                Ok(path) => report.saved.push((id.clone(), path)),
                Err(e) => {
                    log::error!("Batch save failed for match {id}: {e}");
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        log::info!(
            "Batch save for {date}: {} saved, {} failed",
            report.saved.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn compact(&self, date: &MatchDate, force: bool) -> Result<CompactionResult, BronzeError> {
        self.compactor.compact(date, force)
    }

    fn stored_ids(&self, date: &MatchDate) -> Result<BTreeSet<String>, BronzeError> {
        let mut ids = individual_ids(&self.layout.date_dir(date))?;

        let archive_path = self.layout.archive_path(date);
        if archive_path.is_file() {
            for (name, _) in archive::list_members(&archive_path)? {
                if let Some(id) = layout::id_from_member_name(&name) {
                    ids.insert(id.to_string());
                }
            }
        }

        Ok(ids)
    }

    fn document_path(&self, date: &MatchDate, id: &str) -> PathBuf {
        self.layout.document_path(date, id)
    }

    fn archive(&self, date: &MatchDate) -> Option<ArchiveInfo> {
        self.compactor.archive_info(date)
    }

    fn health_check(&self) -> HealthReport {
        health::check_all(&self.layout)
    }
}

#[cfg(test)]
mod tests {
    use scout_bronze_models::CompactionStatus;
    use serde_json::json;

    use super::*;

    fn date() -> MatchDate {
        MatchDate::parse("20250101").unwrap()
    }

    fn store(root: &Path) -> FsDocumentStore {
        FsDocumentStore::new(root, "fotmob", Duration::from_secs(1))
    }

    #[test]
    fn save_then_load_returns_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let payload = json!({"home": "A", "away": "B", "score": [1, 0]});

        let path = store.save(&date(), "42", &payload).unwrap();
        assert_eq!(path, tmp.path().join("fotmob/matches/20250101/match_42.json"));
        assert!(store.exists(&date(), "42"));
        assert_eq!(store.load(&date(), "42").unwrap(), payload);
    }

    #[test]
    fn stored_file_is_an_envelope() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.save(&date(), "42", &json!({"x": 1})).unwrap();

        let bytes = std::fs::read(store.document_path(&date(), "42")).unwrap();
        let envelope: StoredDocument = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope.match_id, "42");
        assert_eq!(envelope.date, date());
        assert_eq!(envelope.data, json!({"x": 1}));
    }

    #[test]
    fn save_overwrites_previous_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.save(&date(), "42", &json!({"v": 1})).unwrap();
        store.save(&date(), "42", &json!({"v": 2})).unwrap();
        assert_eq!(store.load(&date(), "42").unwrap(), json!({"v": 2}));
    }

    #[test]
    fn load_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let err = store.load(&date(), "404").unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.exists(&date(), "404"));
    }

    #[test]
    fn interrupted_write_leaves_no_document() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let path = store.document_path(&date(), "42");

        let result = write_atomic(&path, b"{\"partial\":", |tmp| validate_document(tmp, "42"));

        assert!(result.is_err());
        assert!(!store.exists(&date(), "42"));
        assert!(!layout::temp_path(&path).exists());
        assert!(store.stored_ids(&date()).unwrap().is_empty());
    }

    #[test]
    fn rejects_path_escaping_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let err = store.save(&date(), "../evil", &json!({})).unwrap_err();
        assert!(matches!(err, BronzeError::InvalidId { .. }));
    }

    #[test]
    fn batch_reports_per_item_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let items = vec![
            ("1".to_string(), json!({"n": 1})),
            ("bad/id".to_string(), json!({"n": 2})),
            ("3".to_string(), json!({"n": 3})),
        ];

        let report = store.save_batch(&date(), &items).unwrap();

        assert_eq!(report.saved.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad/id");
        assert!(!report.is_complete());
        assert!(store.exists(&date(), "1"));
        assert!(store.exists(&date(), "3"));
        assert!(!store.layout().date_dir(&date()).join(BATCH_LOCK_NAME).exists());
    }

    #[test]
    fn batch_times_out_when_directory_is_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(tmp.path(), "fotmob", Duration::from_millis(50));
        let date_dir = store.layout().date_dir(&date());
        let _held = DirLock::acquire(&date_dir, BATCH_LOCK_NAME, Duration::from_secs(1)).unwrap();

        let err = store
            .save_batch(&date(), &[("1".to_string(), json!({}))])
            .unwrap_err();
        assert!(matches!(err, BronzeError::LockTimeout { .. }));
    }

    #[test]
    fn concurrent_batches_do_not_interleave() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FsDocumentStore::new(
            tmp.path(),
            "fotmob",
            Duration::from_secs(30),
        ));
        let ids: Vec<String> = (0..20).map(|i| i.to_string()).collect();

        let handles: Vec<_> = (0..8)
            .map(|writer| {
                let store = std::sync::Arc::clone(&store);
                let items: Vec<(String, Value)> = ids
                    .iter()
                    .map(|id| (id.clone(), json!({"writer": writer, "id": id})))
                    .collect();
                std::thread::spawn(move || store.save_batch(&date(), &items).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_complete());
        }

        let writers: BTreeSet<_> = ids
            .iter()
            .map(|id| {
                let payload = store.load(&date(), id).unwrap();
                assert_eq!(payload["id"], id.as_str());
                payload["writer"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(writers.len(), 1, "one batch must win every id: {writers:?}");

        assert_eq!(store.stored_ids(&date()).unwrap().len(), ids.len());
        let leftovers: Vec<_> = std::fs::read_dir(store.layout().date_dir(&date()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "stray files: {leftovers:?}");
    }

    #[test]
    fn ids_ending_in_json_are_listed_and_compacted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let path = store.save(&date(), "x.json", &json!({"v": 1})).unwrap();
        assert!(path.ends_with("match_x.json.json"));

        assert_eq!(
            store.stored_ids(&date()).unwrap(),
            BTreeSet::from(["x.json".to_string()])
        );

        let result = store.compact(&date(), false).unwrap();
        assert_eq!(result.status, CompactionStatus::Completed);
        assert_eq!(result.compacted, 1);
        assert!(!path.exists());
        assert_eq!(store.load(&date(), "x.json").unwrap(), json!({"v": 1}));
    }

    #[test]
    fn stored_size_reads_individual_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.save(&date(), "7", &json!({"pad": "xxxxxxxx"})).unwrap();
        let on_disk = std::fs::metadata(store.document_path(&date(), "7")).unwrap().len();
        assert_eq!(stored_size(store.layout(), &date(), "7"), Some(on_disk));
        assert_eq!(stored_size(store.layout(), &date(), "8"), None);
    }
}
