//! Reading and writing the per-day `.tar` of gzip-compressed documents.
//!
//! The archive itself is an uncompressed tar; each member is an
//! individually gzip-compressed `match_{id}.json.gz`, so a single
//! document can be pulled out without inflating the rest.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::BronzeError;

/// Gzip-compresses `bytes` at the default level.
///
/// # Errors
///
/// Returns [`BronzeError::Io`] (attributed to `path`) if the encoder fails.
pub fn gzip(path: &Path, bytes: &[u8]) -> Result<Vec<u8>, BronzeError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| BronzeError::io(path, e))?;
    encoder.finish().map_err(|e| BronzeError::io(path, e))
}

/// Inflates a gzip stream fully into memory.
///
/// # Errors
///
/// Returns [`BronzeError::Io`] (attributed to `path`) for a truncated or
/// corrupt stream.
pub fn gunzip(path: &Path, bytes: &[u8]) -> Result<Vec<u8>, BronzeError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| BronzeError::io(path, e))?;
    Ok(out)
}

fn open(archive_path: &Path) -> Result<tar::Archive<File>, BronzeError> {
    let file = File::open(archive_path).map_err(|e| BronzeError::io(archive_path, e))?;
    Ok(tar::Archive::new(file))
}

fn entry_name(entry: &tar::Entry<'_, File>, archive_path: &Path) -> Result<String, BronzeError> {
    let path = entry.path().map_err(|e| BronzeError::io(archive_path, e))?;
    Ok(path.to_string_lossy().into_owned())
}

/// Member names and their compressed sizes, in archive order.
///
/// # Errors
///
/// Returns [`BronzeError::Io`] if the archive cannot be opened or its
/// headers are unreadable.
pub fn list_members(archive_path: &Path) -> Result<Vec<(String, u64)>, BronzeError> {
    let mut archive = open(archive_path)?;
    let mut members = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| BronzeError::io(archive_path, e))?
    {
        let entry = entry.map_err(|e| BronzeError::io(archive_path, e))?;
        let size = entry.header().size().unwrap_or(0);
        members.push((entry_name(&entry, archive_path)?, size));
    }

    Ok(members)
}

/// Reads every member's raw (still compressed) bytes.
///
/// # Errors
///
/// Returns [`BronzeError::Io`] if the archive cannot be read.
pub fn read_all_members(archive_path: &Path) -> Result<BTreeMap<String, Vec<u8>>, BronzeError> {
    let mut archive = open(archive_path)?;
    let mut members = BTreeMap::new();

    for entry in archive
        .entries()
        .map_err(|e| BronzeError::io(archive_path, e))?
    {
        let mut entry = entry.map_err(|e| BronzeError::io(archive_path, e))?;
        let name = entry_name(&entry, archive_path)?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| BronzeError::io(archive_path, e))?;
        members.insert(name, bytes);
    }

    Ok(members)
}

/// Reads one member's raw (still compressed) bytes, if present.
///
/// # Errors
///
/// Returns [`BronzeError::Io`] if the archive cannot be read.
pub fn read_member(archive_path: &Path, name: &str) -> Result<Option<Vec<u8>>, BronzeError> {
    let mut archive = open(archive_path)?;

    for entry in archive
        .entries()
        .map_err(|e| BronzeError::io(archive_path, e))?
    {
        let mut entry = entry.map_err(|e| BronzeError::io(archive_path, e))?;
        if entry_name(&entry, archive_path)? == name {
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| BronzeError::io(archive_path, e))?;
            return Ok(Some(bytes));
        }
    }

    Ok(None)
}

/// Writes `members` (name, source file) into a new tar at `archive_path`.
///
/// Members are stored flat, under their bare names.
///
/// # Errors
///
/// Returns [`BronzeError::Io`] if any member cannot be read or the archive
/// cannot be written.
pub fn bundle(archive_path: &Path, members: &[(String, PathBuf)]) -> Result<u64, BronzeError> {
    let file = File::create(archive_path).map_err(|e| BronzeError::io(archive_path, e))?;
    let mut builder = tar::Builder::new(file);

    for (name, source) in members {
        builder
            .append_path_with_name(source, name)
            .map_err(|e| BronzeError::io(source, e))?;
    }

    let file = builder
        .into_inner()
        .map_err(|e| BronzeError::io(archive_path, e))?;
    file.sync_all()
        .map_err(|e| BronzeError::io(archive_path, e))?;

    let size = std::fs::metadata(archive_path)
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(size)
}
