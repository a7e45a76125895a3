#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Remote backup of compacted daily archives.
//!
//! [`BackupUploader`] pushes a verified `{date}_matches.tar` to
//! `{prefix}/{scraper}/{YYYYMM}/{date}.tar.gz` on an [`ObjectStore`].
//! Uploads are idempotent: an object that already exists at the key is never
//! overwritten. Its size and `ETag` are still compared with the local file so
//! drift shows up in the logs.

pub mod s3;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scout_bronze_models::MatchDate;

pub use s3::S3ObjectStore;

/// Content type of uploaded archives. Members are already gzip-compressed;
/// the bundle itself is a plain tar.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-tar";

/// Errors that can occur during a backup.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// `HeadObject` failed for a reason other than the object not existing.
    #[error("Failed to head s3://{bucket}/{key}: {source}")]
    Head {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `PutObject` failed.
    #[error("Failed to upload s3://{bucket}/{key}: {source}")]
    Upload {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The local archive to upload does not exist.
    #[error("Archive not found: {}", .0.display())]
    ArchiveNotFound(PathBuf),

    /// I/O error reading the local archive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote object metadata from a `HEAD` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMeta {
    /// Content length in bytes.
    pub size: u64,
    /// `ETag`, usually the quoted MD5 hex digest for single-part uploads.
    pub etag: Option<String>,
}

/// Minimal object storage used by [`BackupUploader`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Metadata for `key`, or `None` when no such object exists.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::Head`] on any failure other than not found.
    async fn head(&self, key: &str) -> Result<Option<RemoteMeta>, BackupError>;

    /// Writes `body` to `key` in a single request.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::Upload`] if the request fails.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), BackupError>;
}

/// Object key for a day's archive: `{prefix}/{scraper}/{YYYYMM}/{date}.tar.gz`.
///
/// An empty or missing prefix is omitted; surrounding slashes are trimmed.
#[must_use]
pub fn backup_key(prefix: Option<&str>, scraper: &str, date: &MatchDate) -> String {
    let key = format!("{scraper}/{}/{}.tar.gz", date.year_month(), date.compact());
    match prefix.map(|p| p.trim_matches('/')) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}/{key}"),
        _ => key,
    }
}

/// What [`BackupUploader::upload`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// The archive was uploaded.
    Uploaded {
        /// Object key.
        key: String,
        /// Bytes sent.
        bytes: u64,
    },
    /// An object already existed at the key; nothing was sent.
    AlreadyPresent {
        /// Object key.
        key: String,
        /// Whether the remote object matches the local archive. `None` when
        /// the `ETag` is not a plain MD5 and the sizes agree.
        matches: Option<bool>,
    },
}

impl BackupOutcome {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Uploaded { key, .. } | Self::AlreadyPresent { key, .. } => key,
        }
    }
}

impl std::fmt::Display for BackupOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uploaded { key, bytes } => write!(f, "uploaded {key} ({bytes} bytes)"),
            Self::AlreadyPresent { key, .. } => write!(f, "{key} already present"),
        }
    }
}

/// Uploads daily archives to an [`ObjectStore`].
#[derive(Clone)]
pub struct BackupUploader {
    store: std::sync::Arc<dyn ObjectStore>,
    key_prefix: Option<String>,
}

impl BackupUploader {
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn ObjectStore>, key_prefix: Option<String>) -> Self {
        Self { store, key_prefix }
    }

    #[must_use]
    pub fn key_for(&self, scraper: &str, date: &MatchDate) -> String {
        backup_key(self.key_prefix.as_deref(), scraper, date)
    }

    /// Uploads `archive_path` unless an object already exists at its key.
    ///
    /// Failures are returned, not retried. The local archive is never
    /// modified or removed.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::ArchiveNotFound`] if `archive_path` is not a
    /// file, or the store's error if the existence check or upload fails.
    pub async fn upload(
        &self,
        date: &MatchDate,
        scraper: &str,
        archive_path: &Path,
    ) -> Result<BackupOutcome, BackupError> {
        if !tokio::fs::metadata(archive_path)
            .await
            .is_ok_and(|meta| meta.is_file())
        {
            return Err(BackupError::ArchiveNotFound(archive_path.to_path_buf()));
        }

        let key = self.key_for(scraper, date);
        let bucket = self.store.bucket().to_string();

        if let Some(remote) = self.store.head(&key).await? {
            let matches = local_match(archive_path, &remote).await?;
            if matches == Some(false) {
                log::warn!(
                    "s3://{bucket}/{key} exists but differs from {} (remote {} bytes, etag {:?}); not overwriting",
                    archive_path.display(),
                    remote.size,
                    remote.etag,
                );
            } else {
                log::info!("s3://{bucket}/{key}: already backed up, skipping");
            }
            return Ok(BackupOutcome::AlreadyPresent { key, matches });
        }

        let data = tokio::fs::read(archive_path).await?;
        let bytes = data.len() as u64;
        #[allow(clippy::cast_precision_loss)]
        let mb = bytes as f64 / 1_048_576.0;
        log::info!(
            "Pushing {} -> s3://{bucket}/{key} ({mb:.1} MB)",
            archive_path.display()
        );

        self.store.put(&key, data, ARCHIVE_CONTENT_TYPE).await?;

        log::info!("  uploaded {key}");
        Ok(BackupOutcome::Uploaded { key, bytes })
    }
}

/// Compares a local file with remote metadata: size first, then MD5 when
/// the `ETag` looks like a single-part digest.
async fn local_match(local_path: &Path, remote: &RemoteMeta) -> Result<Option<bool>, BackupError> {
    let local_size = tokio::fs::metadata(local_path).await?.len();
    if local_size != remote.size {
        return Ok(Some(false));
    }

    if let Some(etag) = &remote.etag {
        let clean = etag.trim_matches('"');
        // Multipart ETags look like "abc123-5"
        if !clean.contains('-') && clean.len() == 32 {
            let local_md5 = compute_md5(local_path).await?;
            return Ok(Some(local_md5.eq_ignore_ascii_case(clean)));
        }
    }

    Ok(None)
}

/// Hex MD5 of a file, computed off the async runtime.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub async fn compute_md5(path: &Path) -> Result<String, std::io::Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_md5_sync(&path))
        .await
        .map_err(std::io::Error::other)?
}

fn compute_md5_sync(path: &Path) -> Result<String, std::io::Error> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(format!("{:x}", context.finalize()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        puts: AtomicUsize,
        fail_puts: bool,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        fn bucket(&self) -> &str {
            "test-bucket"
        }

        async fn head(&self, key: &str) -> Result<Option<RemoteMeta>, BackupError> {
            Ok(self.objects.lock().unwrap().get(key).map(|body| RemoteMeta {
                size: body.len() as u64,
                etag: Some(format!("\"{:x}\"", md5::compute(body))),
            }))
        }

        async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), BackupError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_puts {
                return Err(BackupError::Upload {
                    bucket: "test-bucket".to_string(),
                    key: key.to_string(),
                    source: "connection reset".into(),
                });
            }
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }
    }

    fn date() -> MatchDate {
        MatchDate::parse("20250101").unwrap()
    }

    fn archive(dir: &Path, contents: &[u8]) -> PathBuf {
        let path = dir.join("20250101_matches.tar");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn key_layout() {
        assert_eq!(backup_key(None, "fotmob", &date()), "fotmob/202501/20250101.tar.gz");
        assert_eq!(
            backup_key(Some("bronze/"), "fotmob", &date()),
            "bronze/fotmob/202501/20250101.tar.gz"
        );
        assert_eq!(backup_key(Some(""), "fotmob", &date()), "fotmob/202501/20250101.tar.gz");
    }

    #[tokio::test]
    async fn second_upload_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = archive(tmp.path(), b"archive bytes");
        let store = Arc::new(MemoryStore::default());
        let uploader = BackupUploader::new(store.clone(), Some("bronze".to_string()));

        let first = uploader.upload(&date(), "fotmob", &path).await.unwrap();
        assert_eq!(
            first,
            BackupOutcome::Uploaded {
                key: "bronze/fotmob/202501/20250101.tar.gz".to_string(),
                bytes: 13,
            }
        );

        let second = uploader.upload(&date(), "fotmob", &path).await.unwrap();
        assert_eq!(
            second,
            BackupOutcome::AlreadyPresent {
                key: "bronze/fotmob/202501/20250101.tar.gz".to_string(),
                matches: Some(true),
            }
        );
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn differing_remote_is_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let path = archive(tmp.path(), b"local");
        let store = Arc::new(MemoryStore::default());
        store
            .objects
            .lock()
            .unwrap()
            .insert("fotmob/202501/20250101.tar.gz".to_string(), b"other".to_vec());
        let uploader = BackupUploader::new(store.clone(), None);

        let outcome = uploader.upload(&date(), "fotmob", &path).await.unwrap();
        assert!(matches!(
            outcome,
            BackupOutcome::AlreadyPresent {
                matches: Some(false),
                ..
            }
        ));
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_archive_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let uploader = BackupUploader::new(Arc::new(MemoryStore::default()), None);
        let err = uploader
            .upload(&date(), "fotmob", &tmp.path().join("nope.tar"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ArchiveNotFound(_)));
    }

    #[tokio::test]
    async fn upload_failure_is_reported_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = archive(tmp.path(), b"bytes");
        let store = Arc::new(MemoryStore {
            fail_puts: true,
            ..MemoryStore::default()
        });
        let uploader = BackupUploader::new(store.clone(), None);

        let err = uploader.upload(&date(), "fotmob", &path).await.unwrap_err();
        assert!(matches!(err, BackupError::Upload { .. }));
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn md5_matches_digest_of_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = archive(tmp.path(), b"hello");
        assert_eq!(
            compute_md5(&path).await.unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }
}
