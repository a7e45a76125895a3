//! The per-day ingestion pipeline.
//!
//! ```text
//! HEALTH_CHECK -> RESOLVING_IDS -> SCRAPING -> AGGREGATING -> COMPACTING? -> UPLOADING? -> DONE
//! ```
//!
//! Sequential and parallel runs share one code path: `N` workers (1 when
//! parallel mode is off) each own a [`FetchSession`] opened before the pool
//! starts and pull ids from a shared queue. Results stream back over a
//! channel in completion order and are folded into [`RunMetrics`], whose
//! updates are commutative.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use scout_backup::BackupUploader;
use scout_bronze::atomic::write_json_atomic;
use scout_bronze::{
    BronzeError, DocumentStore, FsDocumentStore, FsLineageLog, FsListingTracker, LineageEntry,
    LineageLog, ListingTracker,
};
use scout_bronze_models::{
    CompactionResult, CompactionStatus, HealthStatus, MarkOutcome, MatchDate, Transformation,
};
use scout_ingest_models::{ErrorKind, IngestConfig, RunMetrics, RunPhase, RunReport, StageOutcome};
use scout_source::progress::{ProgressCallback, null_progress};
use scout_source::{FetchError, FetchSession, MatchSource};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{IngestError, blocking, resolve};

/// Drives one day through the pipeline.
pub struct Orchestrator {
    config: IngestConfig,
    source: Arc<dyn MatchSource>,
    store: Arc<dyn DocumentStore>,
    listings: Arc<dyn ListingTracker>,
    lineage: Arc<dyn LineageLog>,
    backup: Option<BackupUploader>,
    progress: Arc<dyn ProgressCallback>,
    abort: Arc<AtomicBool>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: IngestConfig,
        source: Arc<dyn MatchSource>,
        store: Arc<dyn DocumentStore>,
        listings: Arc<dyn ListingTracker>,
        lineage: Arc<dyn LineageLog>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            listings,
            lineage,
            backup: None,
            progress: null_progress(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wires the filesystem bronze components under `config.data_dir`.
    #[must_use]
    pub fn from_config(config: IngestConfig, source: Arc<dyn MatchSource>) -> Self {
        let timeout = config.lock_timeout();
        let store = Arc::new(FsDocumentStore::new(
            &config.data_dir,
            &config.scraper,
            timeout,
        ));
        let listings = Arc::new(FsListingTracker::new(
            &config.data_dir,
            &config.scraper,
            timeout,
        ));
        let lineage = Arc::new(FsLineageLog::new(&config.data_dir, timeout));
        Self::new(config, source, store, listings, lineage)
    }

    /// Uploads the day's archive after a successful compaction.
    #[must_use]
    pub fn with_backup(mut self, backup: BackupUploader) -> Self {
        self.backup = Some(backup);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Once `abort` is set, workers stop taking new ids. Writes already in
    /// flight complete.
    #[must_use]
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Replaces the progress sink, e.g. with a fresh bar for the next day.
    pub fn set_progress(&mut self, progress: Arc<dyn ProgressCallback>) {
        self.progress = progress;
    }

    #[must_use]
    pub const fn config(&self) -> &IngestConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Ingests `date`.
    ///
    /// Ids already stored are skipped unless `force_rescrape` is set, in
    /// which case every id is fetched again and compaction is forced.
    /// Per-id failures are recorded in the report's metrics; compaction and
    /// backup only run when every id is stored and their failures never
    /// fail the run.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Health`] before any fetch if storage is not
    /// usable, [`IngestError::IdResolution`] if the day's ids cannot be
    /// resolved, and [`IngestError::Source`] if a fetch session cannot be
    /// opened.
    #[allow(clippy::too_many_lines)]
    pub async fn run(
        &self,
        date: &MatchDate,
        force_rescrape: bool,
    ) -> Result<RunReport, IngestError> {
        let date = *date;
        let mut metrics = RunMetrics::start(date);
        log::info!("Starting ingestion for {date} ({})", self.source.name());

        enter(date, RunPhase::HealthCheck);
        self.check_health().await?;

        enter(date, RunPhase::ResolvingIds);
        let ids = resolve::resolve_ids(
            self.source.as_ref(),
            &self.listings,
            date,
            self.config.id_fetch_attempts,
            self.config.retry_base_delay(),
        )
        .await?;

        if ids.is_empty() {
            log::warn!("{date}: no matches to process");
            metrics.finish();
            self.progress.finish(format!("{date}: no matches"));
            self.save_metrics(&metrics).await;
            return Ok(RunReport {
                metrics,
                compaction: StageOutcome::skipped("no matches"),
                compaction_result: None,
                backup: StageOutcome::skipped("no matches"),
                aborted: false,
            });
        }

        metrics.total = ids.len() as u64;
        self.progress.set_total(metrics.total);

        let pending = if force_rescrape {
            log::info!("{date}: force rescrape of all {} matches", ids.len());
            ids
        } else if self.listing_complete(date).await? {
            log::info!("{date}: listing already complete, skipping fetch");
            for _ in &ids {
                metrics.record_skip();
            }
            Vec::new()
        } else {
            let store = Arc::clone(&self.store);
            let listings = Arc::clone(&self.listings);
            let (already, pending) =
                blocking(move || partition_stored(store.as_ref(), listings.as_ref(), date, ids))
                    .await?;
            for _ in 0..already {
                metrics.record_skip();
            }
            pending
        };
        self.progress.inc(metrics.skipped);

        log::info!(
            "{date}: {} matches, {} already stored, {} to fetch",
            metrics.total,
            metrics.skipped,
            pending.len()
        );

        if !pending.is_empty() {
            enter(date, RunPhase::Scraping);
            self.scrape(date, pending, &mut metrics).await?;
        }

        enter(date, RunPhase::Aggregating);
        metrics.finish();
        let aborted = self.abort.load(Ordering::SeqCst) && metrics.processed() < metrics.total;

        let (compaction, compaction_result, backup) = if aborted {
            log::warn!("{date}: run aborted after {} of {}", metrics.processed(), metrics.total);
            (
                StageOutcome::skipped("run aborted"),
                None,
                StageOutcome::skipped("run aborted"),
            )
        } else if !metrics.is_fully_successful() {
            log::warn!(
                "{date}: skipping compaction and backup, {} of {} matches not stored ({} failed)",
                metrics.shortfall(),
                metrics.total,
                metrics.failed
            );
            let reason = format!("{} matches not stored", metrics.shortfall());
            (
                StageOutcome::skipped(reason.clone()),
                None,
                StageOutcome::skipped(reason),
            )
        } else if !self.config.compact_after_run {
            (
                StageOutcome::skipped("compaction disabled"),
                None,
                StageOutcome::skipped("compaction disabled"),
            )
        } else {
            enter(date, RunPhase::Compacting);
            let (compaction, result) = self.compact(date, force_rescrape, &mut metrics).await?;
            let backup = if compaction.is_completed() {
                enter(date, RunPhase::Uploading);
                self.upload(date, &mut metrics).await
            } else {
                StageOutcome::skipped("compaction did not complete")
            };
            (compaction, result, backup)
        };

        enter(date, RunPhase::Done);
        self.progress.finish(format!(
            "{date}: {} ok, {} failed, {} skipped",
            metrics.succeeded, metrics.failed, metrics.skipped
        ));
        self.save_metrics(&metrics).await;

        Ok(RunReport {
            metrics,
            compaction,
            compaction_result,
            backup,
            aborted,
        })
    }

    async fn check_health(&self) -> Result<(), IngestError> {
        let store = Arc::clone(&self.store);
        let report = blocking(move || store.health_check()).await?;

        for check in &report.checks {
            log::debug!("health: {} {:?} - {}", check.name, check.status, check.message);
        }
        let critical = report.critical_failures();
        if !critical.is_empty() {
            let message = critical
                .iter()
                .map(|c| format!("{}: {}", c.name, c.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(IngestError::Health { message });
        }
        for check in report
            .checks
            .iter()
            .filter(|c| !c.critical && c.status != HealthStatus::Ok)
        {
            log::warn!("health: {} - {}", check.name, check.message);
        }
        Ok(())
    }

    async fn listing_complete(&self, date: MatchDate) -> Result<bool, IngestError> {
        let listings = Arc::clone(&self.listings);
        match blocking(move || listings.load(&date)).await? {
            Ok(listing) => Ok(listing.is_some_and(|l| l.is_complete())),
            Err(e) => {
                log::warn!("{date}: cannot read listing: {e}");
                Ok(false)
            }
        }
    }

    async fn scrape(
        &self,
        date: MatchDate,
        pending: Vec<String>,
        metrics: &mut RunMetrics,
    ) -> Result<(), IngestError> {
        let total = pending.len();
        let workers = self.config.workers().clamp(1, total.max(1));
        if workers == 1 {
            log::info!("{date}: fetching {total} matches sequentially");
        } else {
            log::info!("{date}: fetching {total} matches with {workers} workers");
        }

        let sessions = (0..workers)
            .map(|_| self.source.session())
            .collect::<Result<Vec<_>, FetchError>>()?;

        let persist = Persist {
            date,
            scraper: Arc::from(self.config.scraper.as_str()),
            source_name: Arc::from(self.source.name()),
            store: Arc::clone(&self.store),
            listings: Arc::clone(&self.listings),
            lineage: Arc::clone(&self.lineage),
        };
        let queue = Arc::new(Mutex::new(pending.into_iter().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handles: Vec<_> = sessions
            .into_iter()
            .map(|session| {
                tokio::spawn(worker(
                    session,
                    Arc::clone(&queue),
                    persist.clone(),
                    Arc::clone(&self.abort),
                    tx.clone(),
                ))
            })
            .collect();
        drop(tx);

        let interval = self.config.metrics_update_interval;
        let mut completed: u64 = 0;
        while let Some((id, result)) = rx.recv().await {
            match result {
                Ok(()) => {
                    metrics.record_success();
                    self.progress.set_message(format!("match {id}"));
                }
                Err(failure) => {
                    log::warn!("{date}: match {id} failed: {}", failure.message);
                    metrics.record_failure(&id, failure.message, failure.kind);
                }
            }
            self.progress.inc(1);

            completed += 1;
            if interval > 0 && completed % interval == 0 {
                log::info!(
                    "{date}: {completed}/{total} fetched ({} ok, {} failed)",
                    metrics.succeeded - metrics.skipped,
                    metrics.failed
                );
            }
        }

        for handle in handles {
            handle.await?;
        }
        Ok(())
    }

    async fn compact(
        &self,
        date: MatchDate,
        force: bool,
        metrics: &mut RunMetrics,
    ) -> Result<(StageOutcome, Option<CompactionResult>), IngestError> {
        let store = Arc::clone(&self.store);
        match blocking(move || store.compact(&date, force)).await? {
            Ok(result) => {
                let detail = match result.status {
                    CompactionStatus::Completed => {
                        self.record_archive_lineage(date).await?;
                        format!("compacted {} documents", result.compacted)
                    }
                    CompactionStatus::AlreadyCompacted => "already compacted".to_string(),
                    CompactionStatus::NoFiles | CompactionStatus::NoDirectory => {
                        log::warn!("{date}: nothing to compact ({:?})", result.status);
                        return Ok((
                            StageOutcome::skipped("no documents to compact"),
                            Some(result),
                        ));
                    }
                };
                Ok((StageOutcome::Completed { detail }, Some(result)))
            }
            Err(e) => {
                log::error!("{date}: compaction failed: {e}");
                let kind = if matches!(e, BronzeError::Integrity { .. }) {
                    ErrorKind::Integrity
                } else {
                    ErrorKind::StorageWrite
                };
                metrics.note_error(&date.compact(), e.to_string(), kind);
                Ok((StageOutcome::Failed { error: e.to_string() }, None))
            }
        }
    }

    /// One `archive` record per member, parented on its latest scrape.
    async fn record_archive_lineage(&self, date: MatchDate) -> Result<(), IngestError> {
        let store = Arc::clone(&self.store);
        let lineage = Arc::clone(&self.lineage);
        let scraper = self.config.scraper.clone();
        let source_name = self.source.name().to_string();

        blocking(move || {
            let Some(archive) = store.archive(&date) else {
                return;
            };
            let ids = match store.stored_ids(&date) {
                Ok(ids) => ids,
                Err(e) => {
                    log::warn!("{date}: cannot list archived ids for lineage: {e}");
                    return;
                }
            };
            let archive_name = archive
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            for id in &ids {
                let parents = lineage
                    .chain(&scraper, &date, id)
                    .iter()
                    .rev()
                    .find(|r| r.transformation == Transformation::Scrape)
                    .map(|r| vec![r.lineage_id.clone()])
                    .unwrap_or_default();

                let entry = LineageEntry {
                    scraper: &scraper,
                    source: &source_name,
                    source_id: id.as_str(),
                    date,
                    path: Some(archive.path.as_path()),
                    transformation: Transformation::Archive,
                    destination_id: Some(archive_name.as_str()),
                    metadata: std::collections::BTreeMap::new(),
                    parent_lineage_ids: Vec::new(),
                }
                .with_metadata("member_count", archive.member_count)
                .with_parents(parents);
                lineage.record(entry);
            }
        })
        .await
    }

    async fn upload(&self, date: MatchDate, metrics: &mut RunMetrics) -> StageOutcome {
        let Some(backup) = &self.backup else {
            return StageOutcome::skipped("backup not configured");
        };
        let Some(archive) = self.store.archive(&date) else {
            return StageOutcome::skipped("no archive to upload");
        };

        match backup.upload(&date, &self.config.scraper, &archive.path).await {
            Ok(outcome) => StageOutcome::Completed {
                detail: outcome.to_string(),
            },
            Err(e) => {
                log::error!("{date}: backup failed: {e}");
                metrics.note_error(&date.compact(), e.to_string(), ErrorKind::Backup);
                StageOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn save_metrics(&self, metrics: &RunMetrics) {
        let Some(dir) = self.config.metrics_dir.clone() else {
            return;
        };
        let value = match metrics.export_value() {
            Ok(value) => value,
            Err(e) => {
                log::warn!("failed to serialize metrics: {e}");
                return;
            }
        };
        let path = dir.join(metrics.export_file_name());
        match blocking(move || write_json_atomic(&path, &value).map(|_| path)).await {
            Ok(Ok(path)) => log::debug!("metrics written to {}", path.display()),
            Ok(Err(e)) => log::warn!("failed to write metrics: {e}"),
            Err(e) => log::warn!("failed to write metrics: {e}"),
        }
    }
}

fn enter(date: MatchDate, phase: RunPhase) {
    log::debug!("{date}: entering {phase:?}");
}

/// Splits `ids` into already-stored (marked in the listing, counted) and
/// still-missing.
fn partition_stored(
    store: &dyn DocumentStore,
    listings: &dyn ListingTracker,
    date: MatchDate,
    ids: Vec<String>,
) -> (u64, Vec<String>) {
    let mut already = 0;
    let mut pending = Vec::new();
    for id in ids {
        if store.exists(&date, &id) {
            if let Err(e) = listings.mark_stored(&date, &id) {
                log::warn!("{date}: failed to reconcile listing for match {id}: {e}");
            }
            already += 1;
        } else {
            pending.push(id);
        }
    }
    (already, pending)
}

/// A failed id, as reported back to the aggregator.
#[derive(Debug)]
struct Failure {
    message: String,
    kind: ErrorKind,
}

impl Failure {
    fn fetch(e: &FetchError) -> Self {
        let kind = match e {
            FetchError::Transient { .. } => ErrorKind::TransientFetch,
            FetchError::Permanent { .. } => ErrorKind::PermanentFetch,
            FetchError::NotFound { .. } => ErrorKind::NotFound,
        };
        Self {
            message: e.to_string(),
            kind,
        }
    }

    fn storage(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::StorageWrite,
        }
    }
}

type Outcome = (String, Result<(), Failure>);

/// Everything a worker needs to persist one document.
#[derive(Clone)]
struct Persist {
    date: MatchDate,
    scraper: Arc<str>,
    source_name: Arc<str>,
    store: Arc<dyn DocumentStore>,
    listings: Arc<dyn ListingTracker>,
    lineage: Arc<dyn LineageLog>,
}

impl Persist {
    /// Store, then mark stored, then record lineage. Only the store step
    /// can fail the id.
    fn save(&self, id: &str, payload: &Value) -> Result<(), Failure> {
        let path = self
            .store
            .save(&self.date, id, payload)
            .map_err(|e| Failure::storage(e.to_string()))?;

        match self.listings.mark_stored(&self.date, id) {
            Ok(MarkOutcome::NotExpected) => {
                log::debug!("{}: match {id} is not in the listing", self.date);
            }
            Ok(_) => {}
            Err(e) => log::warn!("{}: failed to mark match {id} stored: {e}", self.date),
        }

        let size = std::fs::metadata(&path).map_or(0, |m| m.len());
        self.lineage.record(
            LineageEntry::scrape(&self.scraper, &self.source_name, id, self.date, &path)
                .with_metadata("size_bytes", size),
        );
        Ok(())
    }
}

async fn worker(
    mut session: Box<dyn FetchSession>,
    queue: Arc<Mutex<VecDeque<String>>>,
    persist: Persist,
    abort: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Outcome>,
) {
    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(id) = next else {
            break;
        };

        let result = process(session.as_mut(), &persist, &id).await;
        if tx.send((id, result)).is_err() {
            break;
        }
    }
}

async fn process(
    session: &mut dyn FetchSession,
    persist: &Persist,
    id: &str,
) -> Result<(), Failure> {
    let payload = session
        .fetch_document(id)
        .await
        .map_err(|e| Failure::fetch(&e))?;

    let persist = persist.clone();
    let id = id.to_string();
    tokio::task::spawn_blocking(move || persist.save(&id, &payload))
        .await
        .map_err(|e| Failure::storage(format!("storage task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    use async_trait::async_trait;
    use scout_backup::{BackupError, ObjectStore, RemoteMeta};
    use serde_json::json;

    use super::*;

    /// A fake upstream shared by a source and all of its sessions.
    #[derive(Default)]
    struct FakeApi {
        ids: Vec<String>,
        failing: Mutex<BTreeSet<String>>,
        fetched: Mutex<Vec<String>>,
        id_calls: AtomicUsize,
        sessions: AtomicUsize,
    }

    impl FakeApi {
        fn new(ids: &[&str], failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                ids: ids.iter().map(ToString::to_string).collect(),
                failing: Mutex::new(failing.iter().map(ToString::to_string).collect()),
                ..Self::default()
            })
        }

        fn fetched(&self) -> Vec<String> {
            let mut fetched = self.fetched.lock().unwrap().clone();
            fetched.sort();
            fetched
        }
    }

    struct FakeSource(Arc<FakeApi>);

    #[async_trait]
    impl MatchSource for FakeSource {
        fn name(&self) -> &str {
            "fake_api"
        }

        async fn fetch_ids_for_date(&self, _date: &MatchDate) -> Result<Vec<String>, FetchError> {
            self.0.id_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.ids.clone())
        }

        fn session(&self) -> Result<Box<dyn FetchSession>, FetchError> {
            self.0.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession(Arc::clone(&self.0))))
        }
    }

    struct FakeSession(Arc<FakeApi>);

    #[async_trait]
    impl FetchSession for FakeSession {
        async fn fetch_document(&mut self, id: &str) -> Result<Value, FetchError> {
            tokio::task::yield_now().await;
            self.0.fetched.lock().unwrap().push(id.to_string());
            if self.0.failing.lock().unwrap().contains(id) {
                return Err(FetchError::permanent("HTTP 403 from upstream"));
            }
            Ok(json!({"matchId": id, "home": "Home FC", "away": "Away FC"}))
        }
    }

    #[derive(Default)]
    struct MemoryObjects {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for MemoryObjects {
        fn bucket(&self) -> &str {
            "test"
        }

        async fn head(&self, key: &str) -> Result<Option<RemoteMeta>, BackupError> {
            Ok(self.objects.lock().unwrap().get(key).map(|body| RemoteMeta {
                size: body.len() as u64,
                etag: None,
            }))
        }

        async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), BackupError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }
    }

    /// Remote that accepts nothing.
    #[derive(Default)]
    struct RejectingObjects {
        puts: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for RejectingObjects {
        fn bucket(&self) -> &str {
            "test"
        }

        async fn head(&self, _key: &str) -> Result<Option<RemoteMeta>, BackupError> {
            Ok(None)
        }

        async fn put(&self, key: &str, _body: Vec<u8>, _content_type: &str) -> Result<(), BackupError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Err(BackupError::Upload {
                bucket: "test".to_string(),
                key: key.to_string(),
                source: "connection reset by peer".into(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        total: AtomicU64,
        done: AtomicU64,
        messages: Mutex<Vec<String>>,
        finished: Mutex<Vec<String>>,
    }

    impl ProgressCallback for RecordingProgress {
        fn set_total(&self, total: u64) {
            self.total.store(total, Ordering::SeqCst);
        }

        fn inc(&self, delta: u64) {
            self.done.fetch_add(delta, Ordering::SeqCst);
        }

        fn set_message(&self, msg: String) {
            self.messages.lock().unwrap().push(msg);
        }

        fn finish(&self, msg: String) {
            self.finished.lock().unwrap().push(msg);
        }
    }

    fn date() -> MatchDate {
        MatchDate::parse("20250101").unwrap()
    }

    fn config(root: &Path) -> IngestConfig {
        IngestConfig {
            data_dir: root.to_path_buf(),
            retry_base_delay_ms: 0,
            lock_timeout_secs: 10,
            ..IngestConfig::default()
        }
    }

    fn orchestrator(config: IngestConfig, api: &Arc<FakeApi>, objects: &Arc<MemoryObjects>) -> Orchestrator {
        Orchestrator::from_config(config, Arc::new(FakeSource(Arc::clone(api))))
            .with_backup(BackupUploader::new(objects.clone(), Some("bronze".to_string())))
    }

    fn listing(root: &Path) -> scout_bronze_models::Listing {
        FsListingTracker::new(root, "fotmob", std::time::Duration::from_secs(5))
            .load(&date())
            .unwrap()
            .unwrap()
    }

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn one_failure_blocks_compaction_then_rerun_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B", "C"], &["C"]);
        let objects = Arc::new(MemoryObjects::default());

        let first = orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap();

        assert_eq!(first.metrics.succeeded, 2);
        assert_eq!(first.metrics.failed, 1);
        assert_eq!(first.metrics.skipped, 0);
        assert_eq!(first.metrics.errors[0].id, "C");
        assert_eq!(first.metrics.errors[0].kind, ErrorKind::PermanentFetch);
        assert!(!first.is_success());
        assert_eq!(
            first.compaction,
            StageOutcome::skipped("1 matches not stored")
        );

        let after_first = listing(tmp.path());
        assert_eq!(after_first.stored_ids(), &set(&["A", "B"]));
        assert_eq!(after_first.missing_ids(), &set(&["C"]));
        assert!(!tmp.path().join("fotmob/matches/20250101/20250101_matches.tar").exists());
        assert_eq!(objects.puts.load(Ordering::SeqCst), 0);

        api.failing.lock().unwrap().clear();
        api.fetched.lock().unwrap().clear();
        let metrics_dir = tmp.path().join("metrics");
        let second = orchestrator(
            IngestConfig {
                metrics_dir: Some(metrics_dir.clone()),
                ..config(tmp.path())
            },
            &api,
            &objects,
        )
        .run(&date(), false)
        .await
        .unwrap();

        assert_eq!(api.fetched(), ["C"]);
        assert_eq!(api.id_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.metrics.succeeded, 3);
        assert_eq!(second.metrics.failed, 0);
        assert_eq!(second.metrics.skipped, 2);
        assert!(second.is_success());
        assert!(second.compaction.is_completed());
        assert_eq!(
            second.compaction_result.as_ref().map(|r| r.compacted),
            Some(3)
        );
        assert!(second.backup.is_completed());
        assert_eq!(objects.puts.load(Ordering::SeqCst), 1);
        assert!(
            objects
                .objects
                .lock()
                .unwrap()
                .contains_key("bronze/fotmob/202501/20250101.tar.gz")
        );
        assert!(listing(tmp.path()).is_complete());
        let exported: Value =
            serde_json::from_slice(&std::fs::read(metrics_dir.join("metrics_20250101.json")).unwrap())
                .unwrap();
        assert_eq!(exported["succeeded"], 3);
        assert!(!metrics_dir.join(".metrics_20250101.json.tmp").exists());
    }

    #[tokio::test]
    async fn backup_failure_is_reported_but_run_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B"], &[]);
        let remote = Arc::new(RejectingObjects::default());

        let source = Arc::new(FakeSource(Arc::clone(&api)));
        let report = Orchestrator::from_config(config(tmp.path()), source)
            .with_backup(BackupUploader::new(remote.clone(), None))
            .run(&date(), false)
            .await
            .unwrap();

        assert!(report.compaction.is_completed());
        assert!(matches!(report.backup, StageOutcome::Failed { .. }));
        assert_eq!(remote.puts.load(Ordering::SeqCst), 1);
        assert!(report.metrics.is_fully_successful());
        assert!(report.is_success());
        assert_eq!(report.metrics.failed, 0);
        assert!(
            report
                .metrics
                .errors
                .iter()
                .any(|e| e.kind == ErrorKind::Backup && e.message.contains("connection reset"))
        );
        assert!(tmp.path().join("fotmob/matches/20250101/20250101_matches.tar").is_file());
    }

    #[tokio::test]
    async fn compaction_failure_is_reported_and_retried_on_rerun() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B"], &[]);
        let objects = Arc::new(MemoryObjects::default());
        let archive_path = tmp.path().join("fotmob/matches/20250101/20250101_matches.tar");
        std::fs::create_dir_all(archive_path.join("occupied")).unwrap();

        let report = orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap();

        assert!(matches!(report.compaction, StageOutcome::Failed { .. }));
        assert!(report.compaction_result.is_none());
        assert_eq!(
            report.backup,
            StageOutcome::skipped("compaction did not complete")
        );
        assert!(report.metrics.is_fully_successful());
        assert_eq!(report.metrics.failed, 0);
        assert!(
            report
                .metrics
                .errors
                .iter()
                .any(|e| e.kind == ErrorKind::StorageWrite && e.id == "20250101")
        );
        assert_eq!(objects.puts.load(Ordering::SeqCst), 0);
        for id in ["A", "B"] {
            assert!(
                tmp.path()
                    .join(format!("fotmob/matches/20250101/match_{id}.json"))
                    .is_file()
            );
        }

        std::fs::remove_dir_all(&archive_path).unwrap();
        api.fetched.lock().unwrap().clear();
        let rerun = orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap();

        assert!(api.fetched().is_empty());
        assert!(rerun.compaction.is_completed());
        assert!(rerun.backup.is_completed());
        assert_eq!(objects.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn archive_lineage_keeps_integrity_verifiable() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["10", "11"], &[]);
        let objects = Arc::new(MemoryObjects::default());

        let report = orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap();
        assert!(report.compaction.is_completed());

        let log = FsLineageLog::new(tmp.path(), std::time::Duration::from_secs(5));
        let chain = log.chain("fotmob", &date(), "10");
        assert_eq!(
            chain.iter().map(|r| r.transformation).collect::<Vec<_>>(),
            [Transformation::Scrape, Transformation::Archive]
        );
        assert_eq!(chain[1].parent_lineage_ids, [chain[0].lineage_id.clone()]);
        assert!(log.verify_integrity("fotmob", &date(), "10").verified);
    }

    #[tokio::test]
    async fn completed_day_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B"], &[]);
        let objects = Arc::new(MemoryObjects::default());

        orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap();
        api.fetched.lock().unwrap().clear();

        let again = orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap();

        assert!(api.fetched().is_empty());
        assert_eq!(api.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(again.metrics.succeeded, 2);
        assert_eq!(again.metrics.skipped, 2);
        assert_eq!(
            again.compaction,
            StageOutcome::Completed {
                detail: "already compacted".to_string()
            }
        );
        assert!(again.backup.is_completed());
        assert_eq!(objects.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_rescrape_fetches_everything_again() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B", "C"], &[]);
        let objects = Arc::new(MemoryObjects::default());

        orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap();
        api.fetched.lock().unwrap().clear();

        let forced = orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), true)
            .await
            .unwrap();
        assert_eq!(api.fetched(), ["A", "B", "C"]);
        assert_eq!(forced.metrics.skipped, 0);
        assert_eq!(forced.metrics.succeeded, 3);
        assert!(forced.compaction.is_completed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_and_sequential_runs_agree() {
        let ids: Vec<String> = (1..=12).map(|i| i.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let objects = Arc::new(MemoryObjects::default());

        let seq_dir = tempfile::tempdir().unwrap();
        let seq_api = FakeApi::new(&id_refs, &["5"]);
        let sequential = orchestrator(config(seq_dir.path()), &seq_api, &objects)
            .run(&date(), false)
            .await
            .unwrap();

        let par_dir = tempfile::tempdir().unwrap();
        let par_api = FakeApi::new(&id_refs, &["5"]);
        let parallel = orchestrator(
            IngestConfig {
                enable_parallel: true,
                max_workers: 4,
                ..config(par_dir.path())
            },
            &par_api,
            &objects,
        )
        .run(&date(), false)
        .await
        .unwrap();

        assert_eq!(seq_api.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(par_api.sessions.load(Ordering::SeqCst), 4);
        assert_eq!(seq_api.fetched(), par_api.fetched());

        for report in [&sequential, &parallel] {
            assert_eq!(report.metrics.succeeded, 11);
            assert_eq!(report.metrics.failed, 1);
            assert!(!report.compaction.is_completed());
        }

        let seq_listing = listing(seq_dir.path());
        let par_listing = listing(par_dir.path());
        assert_eq!(seq_listing.stored_ids(), par_listing.stored_ids());
        assert_eq!(par_listing.missing_ids(), &set(&["5"]));
    }

    #[tokio::test]
    async fn abort_stops_before_fetching() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B"], &[]);
        let objects = Arc::new(MemoryObjects::default());
        let abort = Arc::new(AtomicBool::new(true));

        let report = orchestrator(config(tmp.path()), &api, &objects)
            .with_abort(abort)
            .run(&date(), false)
            .await
            .unwrap();

        assert!(report.aborted);
        assert!(!report.is_success());
        assert!(api.fetched().is_empty());
        assert_eq!(report.compaction, StageOutcome::skipped("run aborted"));
    }

    #[tokio::test]
    async fn unhealthy_storage_fails_before_resolving_ids() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("fotmob")).unwrap();
        std::fs::write(tmp.path().join("fotmob/matches"), b"not a directory").unwrap();
        let api = FakeApi::new(&["A"], &[]);
        let objects = Arc::new(MemoryObjects::default());

        let err = orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Health { .. }));
        assert_eq!(api.id_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_day_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&[], &[]);
        let objects = Arc::new(MemoryObjects::default());

        let report = orchestrator(
            IngestConfig {
                id_fetch_attempts: 3,
                ..config(tmp.path())
            },
            &api,
            &objects,
        )
        .run(&date(), false)
        .await
        .unwrap();

        assert_eq!(report.metrics.total, 0);
        assert_eq!(api.id_calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.compaction, StageOutcome::skipped("no matches"));
    }

    #[tokio::test]
    async fn progress_accounts_for_every_id() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B", "C"], &["C"]);
        let objects = Arc::new(MemoryObjects::default());
        let store = FsDocumentStore::new(tmp.path(), "fotmob", std::time::Duration::from_secs(5));
        store.save(&date(), "A", &json!({"seeded": true})).unwrap();

        let progress = Arc::new(RecordingProgress::default());
        orchestrator(config(tmp.path()), &api, &objects)
            .with_progress(progress.clone())
            .run(&date(), false)
            .await
            .unwrap();

        assert_eq!(progress.total.load(Ordering::SeqCst), 3);
        assert_eq!(progress.done.load(Ordering::SeqCst), 3);
        assert_eq!(*progress.messages.lock().unwrap(), ["match B"]);
        assert_eq!(
            *progress.finished.lock().unwrap(),
            ["20250101: 2 ok, 1 failed, 1 skipped"]
        );
    }

    #[tokio::test]
    async fn stale_listing_is_reconciled_from_the_store() {
        let tmp = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B"], &[]);
        let objects = Arc::new(MemoryObjects::default());

        let store = FsDocumentStore::new(tmp.path(), "fotmob", std::time::Duration::from_secs(5));
        store.save(&date(), "A", &json!({"seeded": true})).unwrap();

        let report = orchestrator(config(tmp.path()), &api, &objects)
            .run(&date(), false)
            .await
            .unwrap();

        assert_eq!(api.fetched(), ["B"]);
        assert_eq!(report.metrics.skipped, 1);
        assert!(report.is_success());
    }
}
