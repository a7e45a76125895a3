//! Folding a finished day's documents into one verified archive.
//!
//! Compaction runs in four steps under the date directory's batch lock:
//!
//! 1. Gzip every `match_{id}.json` to a `match_{id}.json.gz` intermediate.
//!    The originals stay where they are.
//! 2. Bundle the intermediates into a temp tar next to the archive.
//! 3. Verify the temp tar: the member set must equal the intermediate set,
//!    and every member must match its intermediate byte for byte, inflate
//!    to the original document, and parse as one.
//! 4. Rename the temp tar over the archive, then delete intermediates and
//!    originals.
//!
//! A failure at any step before the rename removes the temp tar and the
//! intermediates and leaves every original document in place.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use scout_bronze_models::{
    ArchiveInfo, CompactionResult, CompactionStatus, MatchDate, StoredDocument,
};
use sha2::{Digest as _, Sha256};

use crate::atomic::DirLock;
use crate::layout::{self, BronzeLayout};
use crate::store::{BATCH_LOCK_NAME, individual_ids};
use crate::{BronzeError, archive};

/// One document about to go into the archive.
#[derive(Debug)]
struct PendingMember {
    id: String,
    name: String,
    gz_path: PathBuf,
    /// SHA-256 of the uncompressed original, when it came from an
    /// individual file.
    original_digest: Option<String>,
    /// `true` when this call wrote the intermediate (and must clean it up).
    intermediate: bool,
}

/// Compacts date directories for one scraper.
#[derive(Debug, Clone)]
pub struct ArchiveCompactor {
    layout: BronzeLayout,
    lock_timeout: Duration,
}

impl ArchiveCompactor {
    #[must_use]
    pub const fn new(layout: BronzeLayout, lock_timeout: Duration) -> Self {
        Self {
            layout,
            lock_timeout,
        }
    }

    /// Compacts one day.
    ///
    /// Without `force`, an existing readable archive makes this a no-op.
    /// With `force`, documents already in the archive are carried over and
    /// individual files replace archived members with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`BronzeError::Integrity`] if the new archive fails
    /// verification (all originals are kept), or an I/O or lock error.
    pub fn compact(&self, date: &MatchDate, force: bool) -> Result<CompactionResult, BronzeError> {
        self.compact_with(date, force, |_| {})
    }

    fn compact_with<F>(
        &self,
        date: &MatchDate,
        force: bool,
        before_bundle: F,
    ) -> Result<CompactionResult, BronzeError>
    where
        F: FnOnce(&[PendingMember]),
    {
        let date_dir = self.layout.date_dir(date);
        if !date_dir.is_dir() {
            log::info!("No directory for {date}, nothing to compact");
            return Ok(CompactionResult::skipped(CompactionStatus::NoDirectory, None));
        }

        let _lock = DirLock::acquire(&date_dir, BATCH_LOCK_NAME, self.lock_timeout)?;
        let archive_path = self.layout.archive_path(date);

        let mut carried = BTreeMap::new();
        let mut archive_valid = false;
        if archive_path.is_file() {
            match archive::read_all_members(&archive_path) {
                Ok(members) => {
                    if !force {
                        log::info!("{date} already compacted");
                        return Ok(CompactionResult::skipped(
                            CompactionStatus::AlreadyCompacted,
                            self.archive_info(date),
                        ));
                    }
                    archive_valid = true;
                    carried = members;
                }
                Err(e) => {
                    log::warn!(
                        "Existing archive {} is unreadable, rebuilding: {e}",
                        archive_path.display()
                    );
                }
            }
        }

        let individuals = individual_ids(&date_dir)?;
        let leftovers = self.leftover_intermediates(date, &individuals)?;

        if individuals.is_empty() && leftovers.is_empty() {
            if archive_valid {
                return Ok(CompactionResult::skipped(
                    CompactionStatus::AlreadyCompacted,
                    self.archive_info(date),
                ));
            }
            if archive_path.is_file() {
                return Err(BronzeError::Integrity {
                    date: *date,
                    message: "existing archive is unreadable and no documents remain to rebuild it"
                        .to_string(),
                });
            }
            log::info!("No documents to compact for {date}");
            return Ok(CompactionResult::skipped(CompactionStatus::NoFiles, None));
        }

        log::info!(
            "Compacting {} documents for {date}{}",
            individuals.len() + leftovers.len(),
            if force { " (forced)" } else { "" }
        );

        let mut pending = Vec::new();
        let prepared = self.prepare_members(date, &individuals, &leftovers, &carried, &mut pending);
        let size_before = match prepared {
            Ok(size) => size,
            Err(e) => {
                remove_intermediates(&pending);
                return Err(e);
            }
        };

        before_bundle(&pending);

        let tmp_archive = layout::temp_path(&archive_path);
        let members: Vec<(String, PathBuf)> = pending
            .iter()
            .map(|m| (m.name.clone(), m.gz_path.clone()))
            .collect();

        let verified = archive::bundle(&tmp_archive, &members)
            .map_err(|e| e.to_string())
            .and_then(|_| verify(&tmp_archive, &pending));

        if let Err(message) = verified {
            log::error!("Archive verification failed for {date}: {message}. Keeping originals");
            remove_temp_archive(&tmp_archive);
            remove_intermediates(&pending);
            return Err(BronzeError::Integrity {
                date: *date,
                message,
            });
        }

        if let Err(e) = std::fs::rename(&tmp_archive, &archive_path) {
            remove_temp_archive(&tmp_archive);
            remove_intermediates(&pending);
            return Err(BronzeError::io(&archive_path, e));
        }

        for member in &pending {
            if let Err(e) = std::fs::remove_file(&member.gz_path) {
                log::warn!("Failed to remove {}: {e}", member.gz_path.display());
            }
        }
        for id in &individuals {
            let path = self.layout.document_path(date, id);
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove {}: {e}", path.display());
            }
        }

        let info = self.archive_info(date);
        let result = CompactionResult {
            status: CompactionStatus::Completed,
            compacted: (individuals.len() + leftovers.len()) as u64,
            size_before_bytes: size_before,
            size_after_bytes: info.as_ref().map_or(0, |i| i.size_bytes),
            archive: info,
        };

        log::info!(
            "Compacted {} documents for {date}: {} -> {} bytes ({:.1}% saved)",
            result.compacted,
            result.size_before_bytes,
            result.size_after_bytes,
            result.saved_pct()
        );

        Ok(result)
    }

    /// `match_{id}.json.gz` files left behind by an interrupted compaction
    /// whose original document is already gone.
    fn leftover_intermediates(
        &self,
        date: &MatchDate,
        individuals: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, BronzeError> {
        let date_dir = self.layout.date_dir(date);
        let mut ids = BTreeSet::new();

        for entry in std::fs::read_dir(&date_dir).map_err(|e| BronzeError::io(&date_dir, e))? {
            let entry = entry.map_err(|e| BronzeError::io(&date_dir, e))?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(layout::id_from_member_name) {
                if !individuals.contains(id) {
                    ids.insert(id.to_string());
                }
            }
        }

        Ok(ids)
    }

    /// Writes intermediates into `pending` and returns the total size of
    /// the original documents.
    fn prepare_members(
        &self,
        date: &MatchDate,
        individuals: &BTreeSet<String>,
        leftovers: &BTreeSet<String>,
        carried: &BTreeMap<String, Vec<u8>>,
        pending: &mut Vec<PendingMember>,
    ) -> Result<u64, BronzeError> {
        let mut size_before = 0;

        for id in individuals {
            let source = self.layout.document_path(date, id);
            let bytes = std::fs::read(&source).map_err(|e| BronzeError::io(&source, e))?;
            size_before += bytes.len() as u64;

            let gz_path = self.layout.member_path(date, id);
            let compressed = archive::gzip(&gz_path, &bytes)?;
            std::fs::write(&gz_path, compressed).map_err(|e| BronzeError::io(&gz_path, e))?;

            pending.push(PendingMember {
                id: id.clone(),
                name: layout::member_name(id),
                gz_path,
                original_digest: Some(hex::encode(Sha256::digest(&bytes))),
                intermediate: true,
            });
        }

        for id in leftovers {
            pending.push(PendingMember {
                id: id.clone(),
                name: layout::member_name(id),
                gz_path: self.layout.member_path(date, id),
                original_digest: None,
                intermediate: false,
            });
        }

        for (name, raw) in carried {
            let Some(id) = layout::id_from_member_name(name) else {
                log::warn!("Dropping unrecognized archive member {name}");
                continue;
            };
            if individuals.contains(id) || leftovers.contains(id) {
                continue;
            }
            let gz_path = self.layout.member_path(date, id);
            std::fs::write(&gz_path, raw).map_err(|e| BronzeError::io(&gz_path, e))?;
            pending.push(PendingMember {
                id: id.to_string(),
                name: name.clone(),
                gz_path,
                original_digest: None,
                intermediate: true,
            });
        }

        Ok(size_before)
    }

    /// The day's archive on disk, if it exists and is readable.
    #[must_use]
    pub fn archive_info(&self, date: &MatchDate) -> Option<ArchiveInfo> {
        let path = self.layout.archive_path(date);
        if !path.is_file() {
            return None;
        }
        let members = match archive::list_members(&path) {
            Ok(members) => members,
            Err(e) => {
                log::warn!("Could not read archive {}: {e}", path.display());
                return None;
            }
        };
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        Some(ArchiveInfo {
            date: *date,
            path,
            member_count: members.len() as u64,
            size_bytes,
        })
    }
}

fn remove_temp_archive(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove temp archive {}: {e}", path.display()),
    }
}

fn remove_intermediates(pending: &[PendingMember]) {
    for member in pending.iter().filter(|m| m.intermediate) {
        if member.gz_path.exists() {
            if let Err(e) = std::fs::remove_file(&member.gz_path) {
                log::warn!("Failed to remove {}: {e}", member.gz_path.display());
            }
        }
    }
}

/// Checks a freshly bundled archive against the members that went into it.
fn verify(archive_path: &Path, pending: &[PendingMember]) -> Result<(), String> {
    let members = archive::read_all_members(archive_path).map_err(|e| e.to_string())?;

    let expected: BTreeSet<&str> = pending.iter().map(|m| m.name.as_str()).collect();
    let found: BTreeSet<&str> = members.keys().map(String::as_str).collect();
    if expected != found {
        let missing: Vec<_> = expected.difference(&found).collect();
        let unexpected: Vec<_> = found.difference(&expected).collect();
        return Err(format!(
            "member set mismatch: missing {missing:?}, unexpected {unexpected:?}"
        ));
    }

    for member in pending {
        let raw = &members[&member.name];
        let source = std::fs::read(&member.gz_path).map_err(|e| e.to_string())?;
        if *raw != source {
            return Err(format!("member {} differs from its source", member.name));
        }

        let inflated = archive::gunzip(archive_path, raw)
            .map_err(|e| format!("member {} does not decompress: {e}", member.name))?;

        if let Some(digest) = &member.original_digest {
            if hex::encode(Sha256::digest(&inflated)) != *digest {
                return Err(format!("member {} does not match its original", member.name));
            }
        }

        let document: StoredDocument = serde_json::from_slice(&inflated)
            .map_err(|e| format!("member {} is not a valid document: {e}", member.name))?;
        if document.match_id != member.id {
            return Err(format!(
                "member {} holds match {}",
                member.name, document.match_id
            ));
        }
    }

    Ok(())
}
