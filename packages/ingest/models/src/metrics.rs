//! Per-run counters and the summary printed at the end of a run.

use std::fmt;

use chrono::{DateTime, Utc};
use scout_bronze_models::MatchDate;
use serde::{Deserialize, Serialize};

const SUMMARY_ERROR_LINES: usize = 3;
const SUMMARY_MESSAGE_LEN: usize = 80;

/// Classification of a per-id failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientFetch,
    PermanentFetch,
    NotFound,
    StorageWrite,
    Integrity,
    Backup,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TransientFetch => "transient_fetch",
            Self::PermanentFetch => "permanent_fetch",
            Self::NotFound => "not_found",
            Self::StorageWrite => "storage_write",
            Self::Integrity => "integrity",
            Self::Backup => "backup",
        })
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub id: String,
    pub message: String,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
}

/// Counters for one orchestrator run.
///
/// `skipped` ids were already stored before the run and also count as
/// `succeeded`. All updates are commutative, so the order in which
/// workers report does not change the final counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub date: MatchDate,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: Vec<ErrorEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunMetrics {
    /// Starts the clock for a run over `date`.
    #[must_use]
    pub fn start(date: MatchDate) -> Self {
        Self {
            date,
            total: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    /// An id that was already stored.
    pub fn record_skip(&mut self) {
        self.skipped += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, id: &str, message: impl Into<String>, kind: ErrorKind) {
        self.failed += 1;
        self.errors.push(ErrorEntry {
            id: id.to_string(),
            message: message.into(),
            kind,
            timestamp: Utc::now(),
        });
    }

    /// Lists a stage error (compaction, backup) in `errors` without
    /// counting it against any id.
    pub fn note_error(&mut self, subject: &str, message: impl Into<String>, kind: ErrorKind) {
        self.errors.push(ErrorEntry {
            id: subject.to_string(),
            message: message.into(),
            kind,
            timestamp: Utc::now(),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Ids that have been reported either way.
    #[must_use]
    pub const fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// How many ids are not yet stored.
    #[must_use]
    pub const fn shortfall(&self) -> u64 {
        self.total.saturating_sub(self.succeeded)
    }

    /// `succeeded == total && failed == 0`.
    #[must_use]
    pub const fn is_fully_successful(&self) -> bool {
        self.succeeded == self.total && self.failed == 0
    }

    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at.map(|end| {
            #[allow(clippy::cast_precision_loss)]
            let ms = (end - self.started_at).num_milliseconds() as f64;
            ms / 1000.0
        })
    }

    /// `100 * succeeded / (succeeded + failed)`, two decimals.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let attempted = self.processed();
        if attempted == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / attempted as f64 * 10_000.0).round() / 100.0
    }

    /// `metrics_{date}.json`, the export file name for this run.
    #[must_use]
    pub fn export_file_name(&self) -> String {
        format!("metrics_{}.json", self.date)
    }

    /// The serialized counters plus the derived `success_rate` and
    /// `duration_secs`.
    ///
    /// # Errors
    ///
    /// Returns a serde error if the metrics cannot be serialized.
    pub fn export_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("success_rate".to_string(), self.success_rate().into());
            map.insert(
                "duration_secs".to_string(),
                self.duration_secs().map_or(serde_json::Value::Null, Into::into),
            );
        }
        Ok(value)
    }
}

impl fmt::Display for RunMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        let duration = self
            .duration_secs()
            .map_or_else(|| "N/A".to_string(), |secs| format!("{secs:.2}s"));

        writeln!(f, "{rule}")?;
        writeln!(f, "RUN SUMMARY - {}", self.date)?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Total:        {}", self.total)?;
        writeln!(f, "Succeeded:    {}", self.succeeded)?;
        writeln!(f, "Failed:       {}", self.failed)?;
        writeln!(f, "Skipped:      {}", self.skipped)?;
        writeln!(f, "Success rate: {}%", self.success_rate())?;
        writeln!(f, "Duration:     {duration}")?;

        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "Errors:       {}", self.errors.len())?;
            for error in self.errors.iter().take(SUMMARY_ERROR_LINES) {
                let message: String = error.message.chars().take(SUMMARY_MESSAGE_LEN).collect();
                writeln!(f, "  - Match {} [{}]: {message}", error.id, error.kind)?;
            }
            if self.errors.len() > SUMMARY_ERROR_LINES {
                writeln!(
                    f,
                    "  ... and {} more",
                    self.errors.len() - SUMMARY_ERROR_LINES
                )?;
            }
        }

        write!(f, "{rule}")
    }
}
