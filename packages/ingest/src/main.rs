#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for bronze layer ingestion.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use scout_backup::{BackupUploader, S3ObjectStore};
use scout_bronze::{
    DocumentStore, FsDocumentStore, FsLineageLog, FsListingTracker, LineageLog, ListingTracker,
};
use scout_bronze_models::{CompactionStatus, MatchDate};
use scout_cli_utils::IndicatifProgress;
use scout_ingest::{Orchestrator, config};
use scout_ingest_models::IngestConfig;
use scout_source::HttpMatchSource;

#[derive(Parser)]
#[command(name = "scout_ingest", about = "Bronze layer ingestion for match documents")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Root of the bronze layer (overrides config and `SCOUT_DATA_DIR`)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and store every match for a day (or a range of days)
    Scrape {
        /// Day to ingest, `YYYYMMDD` or `YYYY-MM-DD`
        #[arg(long)]
        date: String,
        /// Last day of an inclusive range starting at `--date`
        #[arg(long)]
        to: Option<String>,
        /// Fetch every match again, even ones already stored
        #[arg(long)]
        force: bool,
        /// Fetch with a worker pool
        #[arg(long)]
        parallel: bool,
        /// Worker pool width (implies `--parallel`)
        #[arg(long)]
        workers: Option<usize>,
        /// Skip the remote backup even if one is configured
        #[arg(long)]
        no_backup: bool,
    },
    /// Bundle a day's documents into a verified archive
    Compact {
        #[arg(long)]
        date: String,
        /// Rebuild the archive even if one already exists
        #[arg(long)]
        force: bool,
    },
    /// Upload a day's archive to S3-compatible storage
    Backup {
        #[arg(long)]
        date: String,
    },
    /// Show listing completion and archive state for a day
    Status {
        #[arg(long)]
        date: String,
    },
    /// Show lineage records and verify integrity for one match
    Lineage {
        #[arg(long)]
        date: String,
        #[arg(long)]
        id: String,
    },
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = scout_cli_utils::init_logger();
    let cli = Cli::parse();

    let mut config = config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Scrape {
            date,
            to,
            force,
            parallel,
            workers,
            no_backup,
        } => {
            if parallel || workers.is_some() {
                config.enable_parallel = true;
            }
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            config::validate(&config)?;

            let days = date_range(&date, to.as_deref())?;
            let http = config
                .http
                .clone()
                .ok_or("no [http] source configured")?;
            let source = HttpMatchSource::new(&config.source_name, http)?;

            let abort = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&abort);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupt received, finishing in-flight matches...");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            let backup = if no_backup {
                None
            } else {
                build_uploader(&config)
            };
            let mut orchestrator = Orchestrator::from_config(config, Arc::new(source))
                .with_abort(Arc::clone(&abort));
            if let Some(backup) = backup {
                orchestrator = orchestrator.with_backup(backup);
            }

            let days_bar = (days.len() > 1)
                .then(|| IndicatifProgress::days_bar(&multi, days.len() as u64));
            let mut failed_days = Vec::new();

            for day in &days {
                orchestrator.set_progress(IndicatifProgress::matches_bar(&multi, &day.compact()));
                match orchestrator.run(day, force).await {
                    Ok(report) => {
                        println!("{}", report.metrics);
                        println!("Compaction: {:?}", report.compaction);
                        println!("Backup:     {:?}", report.backup);
                        if !report.is_success() {
                            failed_days.push(*day);
                        }
                        if report.aborted {
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("{day}: {e}");
                        failed_days.push(*day);
                    }
                }
                if let Some(bar) = &days_bar {
                    bar.inc(1);
                }
                if abort.load(Ordering::SeqCst) {
                    break;
                }
            }
            if let Some(bar) = &days_bar {
                bar.finish(format!("{} days, {} with failures", days.len(), failed_days.len()));
            }

            if !failed_days.is_empty() {
                let list = failed_days
                    .iter()
                    .map(MatchDate::compact)
                    .collect::<Vec<_>>()
                    .join(", ");
                log::error!("Days with failures: {list}");
                std::process::exit(1);
            }
        }
        Commands::Compact { date, force } => {
            let date = MatchDate::parse(&date)?;
            let store = fs_store(&config);
            let result = store.compact(&date, force)?;
            match result.status {
                CompactionStatus::Completed => println!(
                    "{date}: compacted {} documents, {} -> {} bytes ({}% saved)",
                    result.compacted,
                    result.size_before_bytes,
                    result.size_after_bytes,
                    result.saved_pct()
                ),
                status => println!("{date}: {status:?}"),
            }
        }
        Commands::Backup { date } => {
            let date = MatchDate::parse(&date)?;
            let store = fs_store(&config);
            let archive = store
                .archive(&date)
                .ok_or_else(|| format!("no archive for {date}; run compact first"))?;
            let backup_config = config.backup.clone().unwrap_or_default();
            let uploader = BackupUploader::new(
                Arc::new(S3ObjectStore::from_env(&backup_config)?),
                backup_config.key_prefix,
            );
            let outcome = uploader.upload(&date, &config.scraper, &archive.path).await?;
            println!("{date}: {outcome}");
        }
        Commands::Status { date } => {
            let date = MatchDate::parse(&date)?;
            let store = fs_store(&config);
            let listings =
                FsListingTracker::new(&config.data_dir, &config.scraper, config.lock_timeout());

            match listings.load(&date)? {
                Some(listing) => {
                    println!(
                        "{date}: {}/{} stored ({:.1}%), {} bytes",
                        listing.stored_ids().len(),
                        listing.expected_ids().len(),
                        listing.completion_percentage(),
                        listing.total_size_bytes()
                    );
                    if !listing.missing_ids().is_empty() {
                        let missing = listing
                            .missing_ids()
                            .iter()
                            .map(String::as_str)
                            .collect::<Vec<_>>()
                            .join(", ");
                        println!("  missing: {missing}");
                    }
                }
                None => println!("{date}: no listing"),
            }

            match store.archive(&date) {
                Some(archive) => println!(
                    "  archive: {} ({} members, {} bytes)",
                    archive.path.display(),
                    archive.member_count,
                    archive.size_bytes
                ),
                None => println!("  archive: none"),
            }

            for check in store.health_check().checks {
                println!("  health: {:<20} {:?} {}", check.name, check.status, check.message);
            }
        }
        Commands::Lineage { date, id } => {
            let date = MatchDate::parse(&date)?;
            let log = FsLineageLog::new(&config.data_dir, config.lock_timeout());

            for record in log.chain(&config.scraper, &date, &id) {
                println!(
                    "{} {:<8} {} -> {} {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.transformation.as_str(),
                    record.source_id,
                    record.destination,
                    record.lineage_id
                );
            }

            let report = log.verify_integrity(&config.scraper, &date, &id);
            if report.verified {
                println!("integrity: verified ({} records)", report.lineage_records);
            } else {
                println!(
                    "integrity: NOT verified: {}",
                    report.reason.as_deref().unwrap_or("unknown")
                );
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn fs_store(config: &IngestConfig) -> FsDocumentStore {
    FsDocumentStore::new(&config.data_dir, &config.scraper, config.lock_timeout())
}

/// `None` (with a warning) when backup is configured but credentials are
/// missing, so the scrape still runs.
fn build_uploader(config: &IngestConfig) -> Option<BackupUploader> {
    let backup_config = config.backup.as_ref()?;
    match S3ObjectStore::from_env(backup_config) {
        Ok(store) => Some(BackupUploader::new(
            Arc::new(store),
            backup_config.key_prefix.clone(),
        )),
        Err(e) => {
            log::warn!("Backup disabled: {e}");
            None
        }
    }
}

/// Every day from `from` through `to` (inclusive), or just `from`.
fn date_range(from: &str, to: Option<&str>) -> Result<Vec<MatchDate>, Box<dyn std::error::Error>> {
    let start = MatchDate::parse(from)?;
    let Some(to) = to else {
        return Ok(vec![start]);
    };
    let end = MatchDate::parse(to)?;
    if end < start {
        return Err(format!("--to {end} is before --date {start}").into());
    }

    let mut days = vec![start];
    let mut day = start;
    while day < end {
        day = day.succ().ok_or("date out of range")?;
        days.push(day);
    }
    Ok(days)
}
