//! Temp-write, validate, rename; plus the cooperative directory lock that
//! serializes writers sharing a directory.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::BronzeError;
use crate::layout::{ensure_dir, temp_path};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A lock file untouched for this long is assumed to belong to a dead
/// process.
const STALE_LOCK_AGE: Duration = Duration::from_secs(600);

/// Writes `bytes` to `path` so that readers see either the old content or
/// the complete new content.
///
/// The bytes go to a dot-prefixed sibling first, are flushed to disk, and
/// `validate` is run against that temp file. Only a temp file that passes
/// validation is renamed over the target; otherwise it is removed and the
/// target is left untouched.
///
/// # Errors
///
/// Returns [`BronzeError::Io`] on write or rename failure, or whatever
/// `validate` returns.
pub fn write_atomic<F>(path: &Path, bytes: &[u8], validate: F) -> Result<(), BronzeError>
where
    F: FnOnce(&Path) -> Result<(), BronzeError>,
{
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let tmp = temp_path(path);
    let result = write_synced(&tmp, bytes)
        .and_then(|()| validate(&tmp))
        .and_then(|()| std::fs::rename(&tmp, path).map_err(|e| BronzeError::io(path, e)));

    if result.is_err() && tmp.exists() {
        if let Err(e) = std::fs::remove_file(&tmp) {
            log::warn!("Failed to remove temp file {}: {e}", tmp.display());
        }
    }

    result
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), BronzeError> {
    let mut file = File::create(path).map_err(|e| BronzeError::io(path, e))?;
    file.write_all(bytes).map_err(|e| BronzeError::io(path, e))?;
    file.sync_all().map_err(|e| BronzeError::io(path, e))
}

/// Serializes `value` as pretty JSON and writes it atomically, validating
/// that the temp file parses back.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns [`BronzeError::Json`] if `value` cannot be serialized or the
/// temp file does not parse, and [`BronzeError::Io`] on write failure.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<u64, BronzeError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| BronzeError::json(path, e))?;
    write_atomic(path, &bytes, |tmp| {
        let written = std::fs::read(tmp).map_err(|e| BronzeError::io(tmp, e))?;
        serde_json::from_slice::<serde_json::Value>(&written)
            .map(|_| ())
            .map_err(|e| BronzeError::json(tmp, e))
    })?;
    Ok(bytes.len() as u64)
}

/// A held lock on a directory. Released when dropped.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquires `{dir}/{name}`, waiting at most `timeout`.
    ///
    /// The lock is a file created with `create_new`, so only one holder
    /// can exist at a time across threads and processes. Lock files older
    /// than ten minutes are treated as abandoned and broken.
    ///
    /// # Errors
    ///
    /// Returns [`BronzeError::LockTimeout`] if the lock is still held when
    /// `timeout` elapses, or [`BronzeError::Io`] if the lock file cannot be
    /// created for another reason.
    pub fn acquire(dir: &Path, name: &str, timeout: Duration) -> Result<Self, BronzeError> {
        ensure_dir(dir)?;
        let path = dir.join(name);
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", std::process::id()) {
                        log::warn!("Failed to record owner in lock {}: {e}", path.display());
                    }
                    log::trace!("Acquired lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        log::warn!("Breaking stale lock {}", path.display());
                        match std::fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => {
                                log::warn!("Failed to break stale lock {}: {e}", path.display());
                                return Err(BronzeError::io(&path, e));
                            }
                        }
                    }
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(BronzeError::LockTimeout {
                            path: path.display().to_string(),
                            waited,
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(BronzeError::io(&path, e)),
            }
        }
    }
}

fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to release lock {}: {e}", self.path.display());
        } else {
            log::trace!("Released lock {}", self.path.display());
        }
    }
}
