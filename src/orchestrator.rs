//! Bulk and incremental sync orchestration.
//!
//! The [`SyncOrchestrator`] owns the worker pool and a consumer task that
//! folds every [`JobReport`] into the run it belongs to.
//!
//! ```text
//!  run_bulk_sync ─▶ scan ─▶ hash_scan ─▶ compute_diff ─▶ enqueue ─┐
//!                                                                 ▼
//!  handle_event ──▶ plan_file ─────────────────────────▶ enqueue ─▶ JobQueue
//!                                                                 │
//!            SyncRun ◀── consumer ◀── WorkerEvent ◀── WorkerPool ◀─┘
//! ```
//!
//! A run is active from the moment it starts scanning until every job it
//! enqueued has settled. Only one bulk run can be active at a time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::SyncContext;
use crate::diff::{compute_diff, hash_scan, plan_file, ScanSnapshot, SyncDiff};
use crate::error::{Result, SyncError};
use crate::hasher;
use crate::job::{JobId, SyncJob};
use crate::manifest::Manifest;
use crate::models::{FileChangeEvent, FileChangeKind};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::scan;
use crate::worker::{JobOutcome, JobReport, WorkerEvent, WorkerPool};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFileError {
    pub path: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub total_files: usize,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub unreadable: usize,
    pub jobs_enqueued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub superseded: usize,
    pub chunks_processed: usize,
    pub cancelled: bool,
    pub errors: Vec<SyncFileError>,
}

impl SyncSummary {
    pub fn settled(&self) -> usize {
        self.succeeded + self.failed + self.superseded
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_running: bool,
    pub current: usize,
    pub total: usize,
    pub current_file: Option<String>,
}

/// Diff computed without enqueueing anything.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPreview {
    pub total_files: usize,
    pub diff: SyncDiff,
}

struct RunProgress {
    summary: SyncSummary,
    outstanding: HashSet<JobId>,
    enqueue_done: bool,
}

struct RunState {
    progress: Mutex<RunProgress>,
    settled: watch::Sender<bool>,
}

impl RunState {
    fn new() -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            progress: Mutex::new(RunProgress {
                summary: SyncSummary::default(),
                outstanding: HashSet::new(),
                enqueue_done: false,
            }),
            settled,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunProgress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }
}

/// Handle to one bulk sync.
#[derive(Clone)]
pub struct SyncRun {
    state: Arc<RunState>,
}

impl SyncRun {
    /// Snapshot of the run so far.
    pub fn summary(&self) -> SyncSummary {
        self.state.lock().summary.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }

    /// Wait until every job of the run has settled.
    pub async fn wait(&self) -> SyncSummary {
        let mut rx = self.state.settled.subscribe();
        let _ = rx.wait_for(|settled| *settled).await;
        self.summary()
    }
}

#[derive(Default)]
struct Tracking {
    active: Option<Arc<RunState>>,
    last: Option<Arc<RunState>>,
    jobs: HashMap<JobId, Arc<RunState>>,
    in_flight: HashMap<JobId, String>,
}

impl Tracking {
    /// Settle `run` if it is done enqueueing and nothing is outstanding.
    fn try_settle(&mut self, run: &Arc<RunState>, reporter: &dyn SyncProgressReporter) {
        let done = {
            let progress = run.lock();
            progress.enqueue_done && progress.outstanding.is_empty()
        };
        if !done || run.is_settled() {
            return;
        }
        run.settled.send_replace(true);
        if self
            .active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, run))
        {
            self.active = None;
        }
        self.last = Some(run.clone());
        let summary = run.lock().summary.clone();
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            superseded = summary.superseded,
            "bulk sync settled"
        );
        reporter.report(SyncProgressEvent::Settled {
            n: summary.settled(),
            total: summary.jobs_enqueued,
        });
    }

    /// Fold one finished execution into its run.
    fn apply(&mut self, report: JobReport, reporter: &dyn SyncProgressReporter) {
        self.in_flight.remove(&report.id);

        if !report.is_settled() {
            return;
        }
        let Some(run) = self.jobs.remove(&report.id) else {
            return;
        };

        {
            let mut progress = run.lock();
            progress.outstanding.remove(&report.id);
            let path = report.job.path().to_string();
            match report.outcome {
                JobOutcome::Succeeded { chunks } => {
                    progress.summary.succeeded += 1;
                    progress.summary.chunks_processed += chunks;
                }
                JobOutcome::Superseded { replacement } => {
                    progress.summary.superseded += 1;
                    if let Some(next) = replacement {
                        progress.outstanding.insert(next);
                        self.jobs.insert(next, run.clone());
                    }
                }
                JobOutcome::Failed(dead) => {
                    progress.summary.failed += 1;
                    progress.summary.errors.push(SyncFileError {
                        path,
                        kind: dead.to_error().kind().to_string(),
                        message: dead.to_error().to_string(),
                    });
                }
                JobOutcome::Unacknowledged { error } => {
                    progress.summary.failed += 1;
                    progress.summary.errors.push(SyncFileError {
                        path,
                        kind: error.kind,
                        message: error.message,
                    });
                }
                JobOutcome::Retrying { .. } | JobOutcome::Released { .. } => {}
            }
            let summary = &progress.summary;
            reporter.report(SyncProgressEvent::Settled {
                n: summary.settled(),
                total: summary.jobs_enqueued,
            });
        }

        self.try_settle(&run, reporter);
    }
}

pub struct SyncOrchestrator {
    ctx: Arc<SyncContext>,
    tracking: Arc<tokio::sync::Mutex<Tracking>>,
    reporter: Arc<dyn SyncProgressReporter>,
    pool: WorkerPool,
    consumer: JoinHandle<()>,
}

impl SyncOrchestrator {
    /// Start the worker pool and the report consumer.
    pub fn start(ctx: SyncContext) -> Self {
        Self::start_with_progress(ctx, Arc::new(NoProgress))
    }

    pub fn start_with_progress(ctx: SyncContext, reporter: Arc<dyn SyncProgressReporter>) -> Self {
        let ctx = Arc::new(ctx);
        let tracking = Arc::new(tokio::sync::Mutex::new(Tracking::default()));
        let (pool, events) = WorkerPool::spawn(ctx.clone(), CancellationToken::new());
        let consumer = tokio::spawn(consume(events, tracking.clone(), reporter.clone()));

        Self {
            ctx,
            tracking,
            reporter,
            pool,
            consumer,
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Stop the workers after their in-flight jobs finish. Runs that have
    /// not settled are marked cancelled and released.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
        if let Err(e) = self.consumer.await {
            tracing::error!(error = %e, "report consumer panicked");
        }
    }

    pub async fn status(&self) -> SyncStatus {
        let tracking = self.tracking.lock().await;
        let current_file = tracking.in_flight.values().min().cloned();
        let (is_running, run) = match (&tracking.active, &tracking.last) {
            (Some(active), _) => (true, Some(active)),
            (None, last) => (false, last.as_ref()),
        };
        let (current, total) = run.map_or((0, 0), |run| {
            let progress = run.lock();
            (progress.summary.settled(), progress.summary.jobs_enqueued)
        });
        SyncStatus {
            is_running,
            current,
            total,
            current_file,
        }
    }

    /// Scan and diff without enqueueing.
    pub async fn preview(&self) -> Result<SyncPreview> {
        let snapshot = self.scan().await?;
        let manifest = self.ctx.manifest.load().await;
        Ok(SyncPreview {
            total_files: snapshot.total_files(),
            diff: compute_diff(&snapshot, &manifest),
        })
    }

    /// Diff the documents root against the manifest and enqueue the jobs
    /// that reconcile them. With `force`, the manifest is cleared first and
    /// every document is re-indexed.
    ///
    /// Returns as soon as the jobs are enqueued; use [`SyncRun::wait`] for
    /// the final summary. Cancelling `cancel` stops further enqueueing.
    pub async fn run_bulk_sync(&self, force: bool, cancel: &CancellationToken) -> Result<SyncRun> {
        let run = {
            let mut tracking = self.tracking.lock().await;
            if tracking.active.is_some() {
                return Err(SyncError::SyncInProgress);
            }
            let run = Arc::new(RunState::new());
            tracking.active = Some(run.clone());
            run
        };

        match self.plan_and_enqueue(&run, force, cancel).await {
            Ok(()) => Ok(SyncRun { state: run }),
            Err(e) => {
                let mut tracking = self.tracking.lock().await;
                // Jobs already enqueued still report into the run.
                run.lock().enqueue_done = true;
                tracking.try_settle(&run, self.reporter.as_ref());
                if tracking
                    .active
                    .as_ref()
                    .is_some_and(|active| Arc::ptr_eq(active, &run))
                {
                    tracking.active = None;
                }
                Err(e)
            }
        }
    }

    /// Start a non-forced bulk sync unless one is already active.
    ///
    /// Called on a timer while watching, so files whose jobs were
    /// dead-lettered or whose events were missed are diffed again.
    pub async fn resync_if_idle(&self, cancel: &CancellationToken) -> Result<Option<SyncRun>> {
        match self.run_bulk_sync(false, cancel).await {
            Ok(run) => Ok(Some(run)),
            Err(SyncError::SyncInProgress) => {
                tracing::debug!("bulk sync still running, skipping periodic pass");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn plan_and_enqueue(
        &self,
        run: &Arc<RunState>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.reporter.report(SyncProgressEvent::Scanning {
            root: self.ctx.root().display().to_string(),
        });
        let snapshot = self.scan().await?;
        let manifest = self.ctx.manifest.load().await;

        let diff = if force {
            // Paths missing on disk still need their index rows removed.
            let deleted = compute_diff(&snapshot, &manifest).deleted;
            self.ctx.manifest.clear().await?;
            tracing::info!(deleted = deleted.len(), "manifest cleared for forced resync");
            SyncDiff {
                deleted,
                ..compute_diff(&snapshot, &Manifest::default())
            }
        } else {
            compute_diff(&snapshot, &manifest)
        };

        {
            let mut progress = run.lock();
            let summary = &mut progress.summary;
            summary.total_files = snapshot.total_files();
            summary.added = diff.added.len();
            summary.modified = diff.modified.len();
            summary.deleted = diff.deleted.len();
            summary.unchanged = diff.unchanged.len();
            summary.unreadable = diff.unreadable.len();
            summary.errors.extend(snapshot.unreadable.iter().map(|f| SyncFileError {
                path: f.path.clone(),
                kind: "io".to_string(),
                message: f.error.clone(),
            }));
        }
        self.reporter.report(SyncProgressEvent::Planned {
            total_files: snapshot.total_files(),
            added: diff.added.len(),
            modified: diff.modified.len(),
            deleted: diff.deleted.len(),
            unchanged: diff.unchanged.len(),
        });
        tracing::info!(
            total = snapshot.total_files(),
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            unchanged = diff.unchanged.len(),
            unreadable = diff.unreadable.len(),
            force,
            "diff computed"
        );

        for job in diff.jobs(&snapshot) {
            if cancel.is_cancelled() {
                tracing::info!("bulk sync cancelled, no further jobs enqueued");
                run.lock().summary.cancelled = true;
                break;
            }
            // Hold the tracking lock so a fast worker's report cannot
            // arrive before the job is registered.
            let mut tracking = self.tracking.lock().await;
            match self.ctx.queue.enqueue(job.clone()).await {
                Ok(id) => {
                    tracking.jobs.insert(id, run.clone());
                    let mut progress = run.lock();
                    progress.outstanding.insert(id);
                    progress.summary.jobs_enqueued += 1;
                }
                Err(e) => {
                    tracing::error!(job = %job, error = %e, "failed to enqueue job");
                    let mut progress = run.lock();
                    progress.summary.failed += 1;
                    progress.summary.errors.push(SyncFileError {
                        path: job.path().to_string(),
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut tracking = self.tracking.lock().await;
        run.lock().enqueue_done = true;
        tracking.try_settle(run, self.reporter.as_ref());
        Ok(())
    }

    async fn scan(&self) -> Result<ScanSnapshot> {
        let documents = self.ctx.documents.clone();
        let root = documents.root.clone();
        let files = tokio::task::spawn_blocking(move || scan::scan_documents(&documents))
            .await
            .map_err(|e| SyncError::Scan {
                root: root.clone(),
                source: e.into(),
            })?
            .map_err(|e| SyncError::Scan { root, source: e })?;
        Ok(hash_scan(files, self.ctx.documents.scan_parallelism).await)
    }

    /// Single-file incremental sync for one watcher notification.
    ///
    /// Returns the enqueued job's id, or `None` when the path is not a
    /// document or already matches the manifest.
    pub async fn handle_event(&self, event: FileChangeEvent) -> Result<Option<JobId>> {
        let Some(path) = self.ctx.document_path(&event.path) else {
            tracing::trace!(path = %event.path.display(), "ignoring event outside documents");
            return Ok(None);
        };

        let current_hash = match event.kind {
            FileChangeKind::Unlink => None,
            FileChangeKind::Add | FileChangeKind::Change => {
                match tokio::fs::read(self.ctx.root().join(&path)).await {
                    Ok(bytes) => Some(hasher::hash_bytes(&bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => return Err(SyncError::io(path, e)),
                }
            }
        };

        let manifest = self.ctx.manifest.load().await;
        let Some(job) = plan_file(&path, current_hash.as_deref(), &manifest) else {
            tracing::debug!(path = %path, "file already in sync");
            return Ok(None);
        };
        self.enqueue_untracked(job).await.map(Some)
    }

    async fn enqueue_untracked(&self, job: SyncJob) -> Result<JobId> {
        let id = self.ctx.queue.enqueue(job.clone()).await?;
        tracing::info!(job_id = %id, job = %job, "incremental job enqueued");
        Ok(id)
    }
}

async fn consume(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    tracking: Arc<tokio::sync::Mutex<Tracking>>,
    reporter: Arc<dyn SyncProgressReporter>,
) {
    while let Some(event) = events.recv().await {
        let mut tracking = tracking.lock().await;
        match event {
            WorkerEvent::Started { id, path } => {
                tracking.in_flight.insert(id, path);
            }
            WorkerEvent::Finished(report) => tracking.apply(report, reporter.as_ref()),
        }
    }

    // Workers are gone; nothing else will settle.
    let mut guard = tracking.lock().await;
    let tracking = &mut *guard;
    let runs: Vec<Arc<RunState>> = tracking
        .jobs
        .drain()
        .map(|(_, run)| run)
        .chain(tracking.active.clone())
        .collect();
    for run in runs {
        if !run.is_settled() {
            {
                let mut progress = run.lock();
                progress.summary.cancelled = true;
                progress.outstanding.clear();
                progress.enqueue_done = true;
            }
            tracking.try_settle(&run, reporter.as_ref());
        }
    }
}
