#![allow(clippy::module_name_repetitions)]
//! Canonical file paths for one scraper's bronze directory.

use std::path::{Path, PathBuf};

use scout_bronze_models::MatchDate;

use crate::BronzeError;

const DOCUMENT_PREFIX: &str = "match_";
const DOCUMENT_SUFFIX: &str = ".json";
const MEMBER_SUFFIX: &str = ".json.gz";

/// Resolves every bronze path for one scraper under a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BronzeLayout {
    base_dir: PathBuf,
}

impl BronzeLayout {
    /// Layout rooted at `{data_dir}/{scraper}`.
    #[must_use]
    pub fn new(data_dir: &Path, scraper: &str) -> Self {
        Self {
            base_dir: data_dir.join(scraper),
        }
    }

    /// `{data_dir}/{scraper}`.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn matches_dir(&self) -> PathBuf {
        self.base_dir.join("matches")
    }

    #[must_use]
    pub fn listings_dir(&self) -> PathBuf {
        self.base_dir.join("daily_listings")
    }

    #[must_use]
    pub fn lineage_dir(&self) -> PathBuf {
        self.base_dir.join("lineage")
    }

    /// Directory holding one day's documents and archive.
    #[must_use]
    pub fn date_dir(&self, date: &MatchDate) -> PathBuf {
        self.matches_dir().join(date.compact())
    }

    #[must_use]
    pub fn document_path(&self, date: &MatchDate, id: &str) -> PathBuf {
        self.date_dir(date).join(document_file_name(id))
    }

    /// Compressed intermediate written next to a document during compaction.
    #[must_use]
    pub fn member_path(&self, date: &MatchDate, id: &str) -> PathBuf {
        self.date_dir(date).join(member_name(id))
    }

    #[must_use]
    pub fn archive_path(&self, date: &MatchDate) -> PathBuf {
        self.date_dir(date)
            .join(format!("{}_matches.tar", date.compact()))
    }

    #[must_use]
    pub fn listing_path(&self, date: &MatchDate) -> PathBuf {
        self.listings_dir().join(date.compact()).join("matches.json")
    }

    #[must_use]
    pub fn lineage_path(&self, date: &MatchDate) -> PathBuf {
        self.lineage_dir().join(date.compact()).join("lineage.json")
    }

    /// Creates the matches, listings, and lineage directories.
    ///
    /// # Errors
    ///
    /// Returns [`BronzeError::Io`] if a directory cannot be created or a
    /// plain file is squatting on one of the paths.
    pub fn ensure_dirs(&self) -> Result<(), BronzeError> {
        for dir in [
            self.base_dir.clone(),
            self.matches_dir(),
            self.listings_dir(),
            self.lineage_dir(),
        ] {
            if dir.is_file() {
                return Err(BronzeError::io(
                    &dir,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "a file exists where a directory is expected",
                    ),
                ));
            }
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

/// `match_{id}.json`.
#[must_use]
pub fn document_file_name(id: &str) -> String {
    format!("{DOCUMENT_PREFIX}{id}{DOCUMENT_SUFFIX}")
}

/// `match_{id}.json.gz`, the name of an archive member.
#[must_use]
pub fn member_name(id: &str) -> String {
    format!("{DOCUMENT_PREFIX}{id}{MEMBER_SUFFIX}")
}

/// Extracts the id from `match_{id}.json`. Temp files never match: their
/// leading dot hides the prefix.
#[must_use]
pub fn id_from_document_name(name: &str) -> Option<&str> {
    name.strip_prefix(DOCUMENT_PREFIX)?
        .strip_suffix(DOCUMENT_SUFFIX)
        .filter(|id| !id.is_empty())
}

/// Extracts the id from `match_{id}.json.gz`.
#[must_use]
pub fn id_from_member_name(name: &str) -> Option<&str> {
    name.strip_prefix(DOCUMENT_PREFIX)?
        .strip_suffix(MEMBER_SUFFIX)
        .filter(|id| !id.is_empty())
}

/// The dot-prefixed temp sibling used for atomic writes.
#[must_use]
pub fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Rejects ids that would escape or confuse the directory layout.
///
/// # Errors
///
/// Returns [`BronzeError::InvalidId`] for empty ids, ids with path
/// separators, and ids starting with a dot.
pub fn validate_id(id: &str) -> Result<(), BronzeError> {
    let reason = if id.is_empty() {
        "empty"
    } else if id.contains(['/', '\\']) {
        "contains a path separator"
    } else if id.starts_with('.') {
        "starts with a dot"
    } else if id.chars().any(char::is_control) {
        "contains control characters"
    } else {
        return Ok(());
    };
    Err(BronzeError::InvalidId {
        id: id.to_string(),
        reason,
    })
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns [`BronzeError::Io`] if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<(), BronzeError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| BronzeError::io(path, e))?;
    }
    Ok(())
}
