//! Loading [`IngestConfig`] from TOML and the environment.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, environment
//! variables, then CLI flags (applied by the binary).
//!
//! | Variable | Field |
//! |---|---|
//! | `SCOUT_DATA_DIR` | `data_dir` |
//! | `SCOUT_MAX_WORKERS` | `max_workers` |
//! | `SCOUT_PARALLEL` | `enable_parallel` (`1`/`true`/`yes`) |
//! | `S3_ENDPOINT` | `backup.endpoint` |
//! | `S3_BUCKET` | `backup.bucket` |
//! | `S3_REGION` | `backup.region` |
//!
//! Setting any `S3_*` variable enables backup. Credentials
//! (`S3_ACCESS_KEY`, `S3_SECRET_KEY`) are read by
//! [`scout_backup::S3ObjectStore`] and never stored in the config.

use std::path::{Path, PathBuf};

use scout_ingest_models::{BackupConfig, IngestConfig};

use crate::IngestError;

/// Reads `path` (if given), applies the process environment, and
/// validates the result.
///
/// # Errors
///
/// Returns [`IngestError::Config`] if the file cannot be read or parsed,
/// an environment value is malformed, or validation fails.
pub fn load(path: Option<&Path>) -> Result<IngestConfig, IngestError> {
    let mut config = match path {
        Some(path) => from_file(path)?,
        None => IngestConfig::default(),
    };
    apply_env(&mut config, |name| std::env::var(name).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Parses a TOML config file.
///
/// # Errors
///
/// Returns [`IngestError::Config`] if the file is unreadable or invalid.
pub fn from_file(path: &Path) -> Result<IngestConfig, IngestError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| IngestError::config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&text)
        .map_err(|e| IngestError::config(format!("invalid config {}: {e}", path.display())))
}

/// Overrides fields from environment variables looked up through `var`.
///
/// # Errors
///
/// Returns [`IngestError::Config`] if a numeric or boolean value does not
/// parse.
pub fn apply_env(
    config: &mut IngestConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), IngestError> {
    if let Some(dir) = var("SCOUT_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(workers) = var("SCOUT_MAX_WORKERS") {
        config.max_workers = workers.trim().parse().map_err(|_| {
            IngestError::config(format!("SCOUT_MAX_WORKERS must be a number, got {workers:?}"))
        })?;
    }
    if let Some(parallel) = var("SCOUT_PARALLEL") {
        config.enable_parallel = parse_bool(&parallel).ok_or_else(|| {
            IngestError::config(format!("SCOUT_PARALLEL must be a boolean, got {parallel:?}"))
        })?;
    }

    let endpoint = var("S3_ENDPOINT");
    let bucket = var("S3_BUCKET");
    let region = var("S3_REGION");
    if endpoint.is_some() || bucket.is_some() || region.is_some() {
        let backup = config.backup.get_or_insert_with(BackupConfig::default);
        if endpoint.is_some() {
            backup.endpoint = endpoint;
        }
        if bucket.is_some() {
            backup.bucket = bucket;
        }
        if region.is_some() {
            backup.region = region;
        }
    }

    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Rejects configurations the pipeline cannot run with.
///
/// # Errors
///
/// Returns [`IngestError::Config`] describing the first problem.
pub fn validate(config: &IngestConfig) -> Result<(), IngestError> {
    if config.max_workers == 0 {
        return Err(IngestError::config("max_workers must be at least 1"));
    }
    if config.scraper.is_empty() || config.scraper.contains(['/', '\\']) {
        return Err(IngestError::config(format!(
            "scraper must be a plain directory name, got {:?}",
            config.scraper
        )));
    }
    if config.id_fetch_attempts == 0 {
        return Err(IngestError::config("id_fetch_attempts must be at least 1"));
    }
    Ok(())
}
