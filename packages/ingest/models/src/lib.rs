#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ingestion configuration, run metrics, and report types.

pub mod metrics;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use scout_bronze_models::CompactionResult;
use serde::{Deserialize, Serialize};

pub use metrics::{ErrorEntry, ErrorKind, RunMetrics};

/// Configuration for one ingestion pipeline.
///
/// Every field has a default, so an empty TOML file is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Root of the bronze layer.
    pub data_dir: PathBuf,
    /// Scraper name; the bronze directory under `data_dir`.
    pub scraper: String,
    /// Upstream system name recorded in lineage.
    pub source_name: String,
    /// Dispatch across a worker pool instead of one id at a time.
    pub enable_parallel: bool,
    /// Worker pool width when `enable_parallel` is set.
    pub max_workers: usize,
    /// Attempts for resolving a day's id set before giving up.
    pub id_fetch_attempts: u32,
    /// Base delay for id-resolution backoff; doubles on every retry.
    pub retry_base_delay_ms: u64,
    /// Log a progress line every this many completed ids.
    pub metrics_update_interval: u64,
    /// Where to export `metrics_{date}.json`, if anywhere.
    pub metrics_dir: Option<PathBuf>,
    /// Bounded wait for directory locks.
    pub lock_timeout_secs: u64,
    /// Compact the day once every id is stored.
    pub compact_after_run: bool,
    /// Remote backup of compacted archives.
    pub backup: Option<BackupConfig>,
    /// HTTP source definition.
    pub http: Option<HttpSourceConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            scraper: "fotmob".to_string(),
            source_name: "fotmob_api".to_string(),
            enable_parallel: false,
            max_workers: 1,
            id_fetch_attempts: 5,
            retry_base_delay_ms: 1000,
            metrics_update_interval: 10,
            metrics_dir: None,
            lock_timeout_secs: 30,
            compact_after_run: true,
            backup: None,
            http: None,
        }
    }
}

impl IngestConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    #[must_use]
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Effective worker count: `max_workers` in parallel mode, else 1.
    #[must_use]
    pub const fn workers(&self) -> usize {
        if self.enable_parallel {
            self.max_workers
        } else {
            1
        }
    }
}

/// Remote object storage for archives. Unset fields fall back to the
/// `S3_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub bucket: Option<String>,
    /// Prepended to every object key, e.g. `"bronze"`.
    pub key_prefix: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

/// A JSON-over-HTTP match source.
///
/// URL templates may contain `{date}` (`YYYYMMDD`), `{date_dashed}`
/// (`YYYY-MM-DD`) and `{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    /// Returns the day's fixtures; ids are extracted with `id_path`.
    pub listing_url: String,
    /// Returns one match document.
    pub document_url: String,
    /// Dotted path to the ids in the listing response. A `[]` suffix
    /// iterates an array, e.g. `leagues[].matches[].id`.
    pub id_path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    30
}

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    HealthCheck,
    ResolvingIds,
    Scraping,
    Aggregating,
    Compacting,
    Uploading,
    Done,
}

/// What happened to an optional post-scrape stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage ran and succeeded.
    Completed {
        /// Short description of the result.
        detail: String,
    },
    /// The stage was deliberately not run.
    Skipped {
        /// Why it did not run.
        reason: String,
    },
    /// The stage ran and failed. The run itself still succeeded.
    Failed {
        /// The error message.
        error: String,
    },
}

impl StageOutcome {
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Everything one orchestrator run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub metrics: RunMetrics,
    pub compaction: StageOutcome,
    /// Set when compaction ran (successfully or as a no-op).
    pub compaction_result: Option<CompactionResult>,
    pub backup: StageOutcome,
    /// `true` if the run stopped early because the abort flag was set.
    pub aborted: bool,
}

impl RunReport {
    /// No failures and every id accounted for.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !self.aborted && self.metrics.is_fully_successful()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config: IngestConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.workers(), 1);
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn workers_only_widen_in_parallel_mode() {
        let config = IngestConfig {
            max_workers: 8,
            ..IngestConfig::default()
        };
        assert_eq!(config.workers(), 1);

        let config = IngestConfig {
            enable_parallel: true,
            ..config
        };
        assert_eq!(config.workers(), 8);
    }

    #[test]
    fn stage_outcome_is_tagged() {
        let json = serde_json::to_value(StageOutcome::skipped("1 match missing")).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "1 match missing");
    }
}
