//! # mdsync CLI
//!
//! The `mdsync` binary keeps a search index in step with a Markdown
//! directory.
//!
//! ## Usage
//!
//! ```bash
//! mdsync --config ./config/mdsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mdsync init` | Create the SQLite database and run schema migrations |
//! | `mdsync sync` | Index what changed since the last sync |
//! | `mdsync sync --force` | Re-index every document |
//! | `mdsync sync --dry-run` | Print the diff without indexing |
//! | `mdsync watch` | Sync once, then keep syncing on file changes and on a timer |
//! | `mdsync status` | Manifest, queue and index counts |
//! | `mdsync failures` | Jobs that ran out of retries |
//!
//! Progress goes to stderr (`--progress human|json|off`). Command output
//! goes to stdout.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use mdsync::config::{self, Config};
use mdsync::context::SyncContext;
use mdsync::diff::{compute_diff, hash_scan};
use mdsync::index::sqlite::SqliteIndex;
use mdsync::manifest::ManifestStore;
use mdsync::orchestrator::{SyncOrchestrator, SyncRun, SyncSummary};
use mdsync::progress::ProgressMode;
use mdsync::queue::sqlite::SqliteJobQueue;
use mdsync::queue::{JobQueue, RetryPolicy};
use mdsync::{db, logging, migrate, scan, watcher};

/// mdsync: differential Markdown-to-index sync.
#[derive(Parser)]
#[command(name = "mdsync", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/mdsync.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal,
    /// `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file (if it doesn't exist) and runs
    /// all migrations. Safe to run multiple times.
    Init,

    /// Diff the documents root against the manifest and index the changes.
    ///
    /// Waits until every job has succeeded or exhausted its retries. Exits
    /// non-zero if any file could not be synced.
    Sync {
        /// Ignore the manifest and re-index every document.
        #[arg(long)]
        force: bool,

        /// Print what would change without enqueueing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Sync once, then watch the documents root and sync each change.
    ///
    /// A full diff also runs every `[watch].full_sync_interval_secs`.
    /// Runs until interrupted with Ctrl-C.
    Watch,

    /// Show manifest, queue and index counts.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List jobs that exhausted their retries.
    Failures {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
            println!("ok");
        }
        Commands::Sync { force, dry_run } => {
            if dry_run {
                run_dry_run(&cfg).await?;
            } else {
                run_sync(&cfg, force, progress).await?;
            }
        }
        Commands::Watch => {
            run_watch(&cfg, progress).await?;
        }
        Commands::Status { json } => {
            run_status(&cfg, json).await?;
        }
        Commands::Failures { json } => {
            run_failures(&cfg, json).await?;
        }
    }

    Ok(())
}

/// Scan and diff without touching the database or the queue.
async fn run_dry_run(cfg: &Config) -> Result<()> {
    let documents = cfg.documents.clone();
    let files = tokio::task::spawn_blocking(move || scan::scan_documents(&documents)).await??;
    let snapshot = hash_scan(files, cfg.documents.scan_parallelism).await;
    let manifest = ManifestStore::new(cfg.manifest_path()).load().await;
    let diff = compute_diff(&snapshot, &manifest);

    println!("sync (dry-run)");
    println!("  total files: {}", snapshot.total_files());
    println!("  added: {}", diff.added.len());
    println!("  modified: {}", diff.modified.len());
    println!("  deleted: {}", diff.deleted.len());
    println!("  unchanged: {}", diff.unchanged.len());
    println!("  unreadable: {}", diff.unreadable.len());
    for path in &diff.added {
        println!("  + {}", path);
    }
    for path in &diff.modified {
        println!("  ~ {}", path);
    }
    for path in &diff.deleted {
        println!("  - {}", path);
    }
    for path in &diff.unreadable {
        println!("  ! {}", path);
    }
    println!("ok");
    Ok(())
}

async fn run_sync(cfg: &Config, force: bool, progress: ProgressMode) -> Result<()> {
    let ctx = SyncContext::from_config(cfg).await?;
    let orchestrator = SyncOrchestrator::start_with_progress(ctx, progress.reporter());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing in-flight jobs");
            interrupt.cancel();
        }
    });

    let run = match orchestrator.run_bulk_sync(force, &cancel).await {
        Ok(run) => run,
        Err(e) => {
            orchestrator.shutdown().await;
            return Err(e.into());
        }
    };

    tokio::select! {
        _ = run.wait() => {}
        _ = cancel.cancelled() => {}
    }
    orchestrator.shutdown().await;

    let summary = run.summary();
    print_summary(&summary, force);

    // Every failed job also records an error; unreadable files only do the latter.
    let problems = summary.errors.len().max(summary.failed);
    if summary.cancelled {
        anyhow::bail!("sync interrupted before all jobs settled");
    }
    if problems > 0 {
        anyhow::bail!("sync finished with {} file error(s)", problems);
    }
    println!("ok");
    Ok(())
}

fn print_summary(summary: &SyncSummary, force: bool) {
    println!("sync{}", if force { " (force)" } else { "" });
    println!("  total files: {}", summary.total_files);
    println!("  added: {}", summary.added);
    println!("  modified: {}", summary.modified);
    println!("  deleted: {}", summary.deleted);
    println!("  unchanged: {}", summary.unchanged);
    println!("  unreadable: {}", summary.unreadable);
    println!("  jobs enqueued: {}", summary.jobs_enqueued);
    println!("  succeeded: {}", summary.succeeded);
    println!("  failed: {}", summary.failed);
    println!("  superseded: {}", summary.superseded);
    println!("  chunks processed: {}", summary.chunks_processed);
    for error in &summary.errors {
        println!("  error [{}] {}: {}", error.kind, error.path, error.message);
    }
}

async fn run_watch(cfg: &Config, progress: ProgressMode) -> Result<()> {
    if !cfg.watch.enabled {
        anyhow::bail!("watching is disabled ([watch].enabled = false)");
    }

    let ctx = SyncContext::from_config(cfg).await?;
    let orchestrator = SyncOrchestrator::start_with_progress(ctx, progress.reporter());

    // Watch before the initial scan so edits made during it are not missed.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let root = orchestrator.context().root().to_path_buf();
    let _handle = watcher::watch(&root, Duration::from_millis(cfg.watch.debounce_ms), tx)?;

    let cancel = CancellationToken::new();
    match orchestrator.run_bulk_sync(false, &cancel).await {
        Ok(run) => log_when_settled(run, "initial sync settled"),
        Err(e) => tracing::error!(error = %e, "initial sync failed"),
    }

    let mut full_sync = cfg.watch.full_sync_interval().map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutting down watcher");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = orchestrator.handle_event(event).await {
                    tracing::warn!(error = %e, "failed to handle file event");
                }
            }
            _ = next_tick(&mut full_sync) => {
                match orchestrator.resync_if_idle(&cancel).await {
                    Ok(Some(run)) => log_when_settled(run, "periodic sync settled"),
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "periodic sync failed"),
                }
            }
        }
    }

    cancel.cancel();
    orchestrator.shutdown().await;
    println!("ok");
    Ok(())
}

/// Resolves on the next tick, or never when periodic syncs are off.
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_when_settled(run: SyncRun, message: &'static str) {
    tokio::spawn(async move {
        let summary = run.wait().await;
        tracing::info!(
            jobs = summary.jobs_enqueued,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "{}",
            message
        );
        for error in &summary.errors {
            tracing::warn!(path = %error.path, kind = %error.kind, "{}", error.message);
        }
    });
}

async fn run_status(cfg: &Config, json: bool) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;

    let manifest = ManifestStore::new(cfg.manifest_path()).stats().await;
    let index = SqliteIndex::new(pool.clone(), cfg.chunking.max_tokens, None, 1)
        .stats()
        .await?;
    // An in-memory queue lives and dies with its process.
    let queue = match cfg.queue.backend.as_str() {
        "memory" => None,
        _ => Some(
            SqliteJobQueue::new(pool.clone(), RetryPolicy::from_config(&cfg.queue))
                .stats()
                .await?,
        ),
    };
    pool.close().await;

    if json {
        let out = serde_json::json!({
            "manifest": manifest,
            "queue": queue,
            "index": index,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("manifest: {}", cfg.manifest_path().display());
    println!("  files: {}", manifest.total_files);
    match manifest.last_updated {
        Some(ts) => println!("  last updated: {}", ts.to_rfc3339()),
        None => println!("  last updated: never"),
    }
    println!("  size: {} bytes", manifest.manifest_size);
    match queue {
        Some(q) => {
            println!("queue: sqlite");
            println!("  pending: {}", q.pending);
            println!("  in flight: {}", q.in_flight);
            println!("  failed: {}", q.failed);
        }
        None => println!("queue: memory (not persisted)"),
    }
    println!("index: {}", cfg.db.path.display());
    println!("  documents: {}", index.documents);
    println!("  chunks: {}", index.chunks);
    println!("  embedded chunks: {}", index.embedded);
    Ok(())
}

async fn run_failures(cfg: &Config, json: bool) -> Result<()> {
    if cfg.queue.backend == "memory" {
        anyhow::bail!("the memory queue backend keeps no failures between runs");
    }
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    let queue = SqliteJobQueue::new(pool.clone(), RetryPolicy::from_config(&cfg.queue));
    let dead = queue
        .dead_letters()
        .await
        .context("Failed to read dead-letter jobs")?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&dead)?);
        return Ok(());
    }

    if dead.is_empty() {
        println!("No failed jobs.");
        return Ok(());
    }
    for d in &dead {
        println!(
            "{} {} {} after {} attempt(s) [{}]: {}",
            d.failed_at.to_rfc3339(),
            d.job.kind(),
            d.job.path(),
            d.attempts,
            d.error_kind,
            d.last_error
        );
        if !d.delays_ms.is_empty() {
            let delays: Vec<String> = d.delays_ms.iter().map(|ms| format!("{}ms", ms)).collect();
            println!("  backoff: {}", delays.join(", "));
        }
    }
    Ok(())
}
