//! Sync worker pool.
//!
//! `concurrency` tokio tasks pull leases from the [`JobQueue`] and run
//! [`process_job`] on them:
//!
//! ```text
//!   reserve ──▶ path lock ──▶ process_job ──┬─ Ok ─────────▶ complete
//!                                           ├─ StaleJob ───▶ complete + re-plan
//!                                           └─ Err ────────▶ fail (queue decides
//!                                                            retry or dead letter)
//! ```
//!
//! Every execution is published as a [`JobReport`] on the pool's event
//! channel. Workers never retry a job themselves. Only the queue calls that
//! record its outcome are retried briefly. If those keep failing the lease
//! is released so the path is not held forever.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::SyncContext;
use crate::diff::plan_file;
use crate::error::{Result, SyncError};
use crate::hasher;
use crate::job::{JobError, JobId, JobLease, SyncJob, SyncJobResult};
use crate::manifest::ManifestEntry;
use crate::queue::{DeadLetter, Disposition};
use crate::scan;

/// How one execution of a job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded { chunks: usize },
    /// Failed; the queue will run it again after `delay`.
    Retrying { error: JobError, delay: Duration },
    /// Failed for the last time.
    Failed(DeadLetter),
    /// The file changed before the job ran. `replacement` is the job queued
    /// for the current content, if it needs one.
    Superseded { replacement: Option<JobId> },
    /// The queue could not record the result. The lease was handed back
    /// and the job will run again.
    Released { error: JobError },
    /// The queue could neither record the result nor take the job back; it
    /// stays claimed until the broker recovers it.
    Unacknowledged { error: JobError },
}

/// Queue calls that record an outcome are tried this many times.
const ACK_ATTEMPTS: u32 = 3;
const ACK_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: JobId,
    pub job: SyncJob,
    /// 1 for the first execution.
    pub attempt: u32,
    pub outcome: JobOutcome,
}

impl JobReport {
    /// Whether this job will not run again.
    pub fn is_settled(&self) -> bool {
        !matches!(
            self.outcome,
            JobOutcome::Retrying { .. } | JobOutcome::Released { .. }
        )
    }

    pub fn result(&self) -> SyncJobResult {
        match &self.outcome {
            JobOutcome::Succeeded { chunks } => SyncJobResult::succeeded(*chunks),
            JobOutcome::Superseded { .. } => SyncJobResult::succeeded(0),
            JobOutcome::Retrying { error, .. }
            | JobOutcome::Released { error }
            | JobOutcome::Unacknowledged { error } => {
                SyncJobResult {
                    success: false,
                    chunks_processed: 0,
                    error: Some(error.clone()),
                }
            }
            JobOutcome::Failed(dead) => SyncJobResult::failed(&dead.to_error()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started { id: JobId, path: String },
    Finished(JobReport),
}

/// Per-path mutual exclusion inside one process.
#[derive(Default)]
pub struct PathLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl PathLocks {
    pub async fn acquire(&self, path: &str) -> PathGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(path.to_string()).or_default().clone()
        };
        PathGuard {
            locks: self,
            path: path.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    pub fn held(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(&self.path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.path);
        }
    }
}

pub struct WorkerPool {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    /// Start `ctx.concurrency` workers. They stop taking new jobs once
    /// `shutdown` is cancelled.
    pub fn spawn(
        ctx: Arc<SyncContext>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let locks = Arc::new(PathLocks::default());
        let mut tasks = JoinSet::new();

        for worker_id in 0..ctx.concurrency.max(1) {
            let ctx = ctx.clone();
            let locks = locks.clone();
            let shutdown = shutdown.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                run_worker(worker_id, ctx, locks, shutdown, tx).await;
            });
        }
        tracing::info!(workers = ctx.concurrency.max(1), "worker pool started");

        (Self { shutdown, tasks }, rx)
    }

    /// Stop taking jobs and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<SyncContext>,
    locks: Arc<PathLocks>,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let lease = match ctx.queue.reserve().await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ctx.queue.wait_for_work(ctx.poll_interval) => continue,
                }
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "failed to reserve job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.poll_interval) => continue,
                }
            }
        };

        let _guard = locks.acquire(lease.job.path()).await;
        let _ = events.send(WorkerEvent::Started {
            id: lease.id,
            path: lease.job.path().to_string(),
        });
        let report = execute(&ctx, lease).await;
        let _ = events.send(WorkerEvent::Finished(report));
    }
    tracing::debug!(worker_id, "worker exiting");
}

/// Run one leased job and settle it with the queue.
pub async fn execute(ctx: &SyncContext, lease: JobLease) -> JobReport {
    let JobLease { id, job, attempt } = lease;
    let attempt = attempt + 1;
    let path = job.path().to_string();

    let outcome = match process_job(ctx, &job).await {
        Ok(chunks) => {
            tracing::info!(job_id = %id, job = %job, chunks, "job succeeded");
            match acknowledge(move || ctx.queue.complete(id)).await {
                Ok(()) => JobOutcome::Succeeded { chunks },
                Err(e) => unacknowledged(ctx, id, &e).await,
            }
        }
        Err(SyncError::StaleJob { .. }) => {
            tracing::info!(job_id = %id, job = %job, "job superseded by newer content");
            match acknowledge(move || ctx.queue.complete(id)).await {
                Ok(()) => JobOutcome::Superseded {
                    replacement: replan(ctx, &path).await,
                },
                Err(e) => unacknowledged(ctx, id, &e).await,
            }
        }
        Err(err) => {
            let failed = &err;
            match acknowledge(move || ctx.queue.fail(id, failed)).await {
                Ok(Disposition::Retry { attempt, delay }) => {
                    tracing::warn!(job_id = %id, job = %job, attempt, ?delay, error = %err, "job failed, will retry");
                    JobOutcome::Retrying {
                        error: (&err).into(),
                        delay,
                    }
                }
                Ok(Disposition::DeadLettered(dead)) => {
                    tracing::error!(job_id = %id, job = %job, attempts = dead.attempts, error = %err, "job permanently failed");
                    JobOutcome::Failed(dead)
                }
                Err(e) => unacknowledged(ctx, id, &e).await,
            }
        }
    };

    JobReport {
        id,
        job,
        attempt,
        outcome,
    }
}

/// Run a queue call, retrying with a short doubling backoff.
async fn acknowledge<T, F, Fut>(mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = ACK_BACKOFF;
    let mut tries = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if tries < ACK_ATTEMPTS => {
                tracing::warn!(tries, error = %e, "queue call failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                tries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The outcome of `id` could not be recorded. Give the lease back so later
/// jobs for the same path are not blocked behind it.
async fn unacknowledged(ctx: &SyncContext, id: JobId, err: &SyncError) -> JobOutcome {
    tracing::error!(job_id = %id, error = %err, "queue did not record job result");
    match acknowledge(move || ctx.queue.release(id)).await {
        Ok(()) => {
            tracing::warn!(job_id = %id, "lease released, job will run again");
            JobOutcome::Released { error: err.into() }
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "could not release lease");
            JobOutcome::Unacknowledged { error: err.into() }
        }
    }
}

/// Execute one job against the index and the manifest.
///
/// Returns the number of chunks written. [`SyncError::StaleJob`] means the
/// file no longer matches what the job was planned for; nothing was changed.
pub async fn process_job(ctx: &SyncContext, job: &SyncJob) -> Result<usize> {
    match job {
        SyncJob::Upsert {
            path,
            expected_hash,
        } => upsert(ctx, path, expected_hash).await,
        SyncJob::Delete { path } => delete(ctx, path).await.map(|()| 0),
    }
}

async fn upsert(ctx: &SyncContext, path: &str, expected_hash: &str) -> Result<usize> {
    let abs_path = ctx.root().join(path);
    let bytes = match tokio::fs::read(&abs_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SyncError::StaleJob {
                path: path.to_string(),
            })
        }
        Err(e) => return Err(SyncError::io(path, e)),
    };
    if hasher::hash_bytes(&bytes) != expected_hash {
        return Err(SyncError::StaleJob {
            path: path.to_string(),
        });
    }
    let metadata = tokio::fs::metadata(&abs_path)
        .await
        .map_err(|e| SyncError::io(path, e))?;

    let content = String::from_utf8_lossy(&bytes);
    let chunks = with_timeout(ctx, path, ctx.pipeline.index(path, &content)).await?;

    ctx.manifest
        .upsert_entry(
            path,
            ManifestEntry {
                content_hash: expected_hash.to_string(),
                size: bytes.len() as u64,
                last_modified: scan::modified_time(&metadata),
                last_processed: Utc::now(),
            },
        )
        .await?;
    Ok(chunks)
}

async fn delete(ctx: &SyncContext, path: &str) -> Result<()> {
    let abs_path = ctx.root().join(path);
    // A file that came back (and is still a document) must not be removed.
    if ctx.filter.matches(path) && file_exists(&abs_path).await? {
        return Err(SyncError::StaleJob {
            path: path.to_string(),
        });
    }

    with_timeout(ctx, path, ctx.pipeline.deindex(path)).await?;
    ctx.manifest.remove_entry(path).await?;
    Ok(())
}

async fn file_exists(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(m.is_file()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::io(path.display().to_string(), e)),
    }
}

async fn with_timeout<T>(
    ctx: &SyncContext,
    path: &str,
    call: impl std::future::Future<Output = std::result::Result<T, crate::index::IndexError>>,
) -> Result<T> {
    match tokio::time::timeout(ctx.job_timeout, call).await {
        Ok(result) => result.map_err(|e| e.into_sync_error(path)),
        Err(_) => Err(SyncError::Timeout {
            path: path.to_string(),
            timeout: ctx.job_timeout,
        }),
    }
}

/// Single-file re-diff after a stale job: queue whatever the file's current
/// state needs.
pub async fn replan(ctx: &SyncContext, path: &str) -> Option<JobId> {
    let current_hash = match tokio::fs::read(ctx.root().join(path)).await {
        Ok(bytes) if ctx.filter.matches(path) => Some(hasher::hash_bytes(&bytes)),
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path, error = %e, "cannot re-read file; leaving it for the next diff");
            return None;
        }
    };

    let manifest = ctx.manifest.load().await;
    let job = plan_file(path, current_hash.as_deref(), &manifest)?;
    match ctx.queue.enqueue(job).await {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::error!(path, error = %e, "failed to enqueue replacement job");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocumentsConfig;
    use crate::index::{IndexError, IndexingPipeline};
    use crate::manifest::ManifestStore;
    use crate::queue::memory::MemoryJobQueue;
    use crate::queue::{JobQueue, QueueStats, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Memory queue whose first `failing_completes` completions report a
    /// broker error without doing anything.
    struct FlakyQueue {
        inner: MemoryJobQueue,
        failing_completes: AtomicUsize,
    }

    impl FlakyQueue {
        fn new(failing_completes: usize) -> Self {
            Self {
                inner: MemoryJobQueue::new(RetryPolicy::default()),
                failing_completes: AtomicUsize::new(failing_completes),
            }
        }
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn enqueue(&self, job: SyncJob) -> Result<JobId> {
            self.inner.enqueue(job).await
        }
        async fn reserve(&self) -> Result<Option<JobLease>> {
            self.inner.reserve().await
        }
        async fn complete(&self, id: JobId) -> Result<()> {
            let failed = self
                .failing_completes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(SyncError::queue(anyhow::anyhow!("database is locked")));
            }
            self.inner.complete(id).await
        }
        async fn fail(&self, id: JobId, error: &SyncError) -> Result<Disposition> {
            self.inner.fail(id, error).await
        }
        async fn release(&self, id: JobId) -> Result<()> {
            self.inner.release(id).await
        }
        async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
            self.inner.dead_letters().await
        }
        async fn stats(&self) -> Result<QueueStats> {
            self.inner.stats().await
        }
    }

    #[derive(Default)]
    struct CountingPipeline {
        indexed: AtomicUsize,
        deindexed: AtomicUsize,
    }

    #[async_trait]
    impl IndexingPipeline for CountingPipeline {
        async fn index(&self, _path: &str, _content: &str) -> std::result::Result<usize, IndexError> {
            self.indexed.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }
        async fn deindex(&self, _path: &str) -> std::result::Result<(), IndexError> {
            self.deindexed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowPipeline;

    #[async_trait]
    impl IndexingPipeline for SlowPipeline {
        async fn index(&self, _path: &str, _content: &str) -> std::result::Result<usize, IndexError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }
        async fn deindex(&self, _path: &str) -> std::result::Result<(), IndexError> {
            Ok(())
        }
    }

    fn context(tmp: &TempDir, pipeline: Arc<dyn IndexingPipeline>) -> SyncContext {
        context_with(
            tmp,
            pipeline,
            Arc::new(MemoryJobQueue::new(RetryPolicy::default())),
            ManifestStore::new(tmp.path().join("manifest.json")),
        )
    }

    fn context_with(
        tmp: &TempDir,
        pipeline: Arc<dyn IndexingPipeline>,
        queue: Arc<dyn JobQueue>,
        manifest: ManifestStore,
    ) -> SyncContext {
        let root = tmp.path().join("docs");
        std::fs::create_dir_all(&root).unwrap();
        SyncContext::new(DocumentsConfig::new(&root), queue, pipeline, Arc::new(manifest)).unwrap()
    }

    fn write(ctx: &SyncContext, rel: &str, body: &str) -> String {
        std::fs::write(ctx.root().join(rel), body).unwrap();
        hasher::hash_bytes(body.as_bytes())
    }

    #[tokio::test]
    async fn test_upsert_records_manifest_entry() {
        let tmp = TempDir::new().unwrap();
        let pipeline = Arc::new(CountingPipeline::default());
        let ctx = context(&tmp, pipeline.clone());
        let hash = write(&ctx, "a.md", "# A\n");

        let chunks = process_job(&ctx, &SyncJob::upsert("a.md", hash.clone()))
            .await
            .unwrap();
        assert_eq!(chunks, 3);
        let manifest = ctx.manifest.load().await;
        assert_eq!(manifest.hash_of("a.md"), Some(hash.as_str()));
        assert_eq!(manifest.entries["a.md"].size, 4);
    }

    #[tokio::test]
    async fn test_upsert_with_outdated_hash_is_stale() {
        let tmp = TempDir::new().unwrap();
        let pipeline = Arc::new(CountingPipeline::default());
        let ctx = context(&tmp, pipeline.clone());
        let old = write(&ctx, "a.md", "v1");
        write(&ctx, "a.md", "v2");

        let err = process_job(&ctx, &SyncJob::upsert("a.md", old))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "stale_job");
        assert_eq!(pipeline.indexed.load(Ordering::SeqCst), 0);
        assert!(ctx.manifest.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_existing_file_is_stale() {
        let tmp = TempDir::new().unwrap();
        let pipeline = Arc::new(CountingPipeline::default());
        let ctx = context(&tmp, pipeline.clone());
        write(&ctx, "back.md", "returned");

        let err = process_job(&ctx, &SyncJob::delete("back.md"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "stale_job");
        assert_eq!(pipeline.deindexed.load(Ordering::SeqCst), 0);

        process_job(&ctx, &SyncJob::delete("gone.md")).await.unwrap();
        assert_eq!(pipeline.deindexed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_job_is_replanned() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, Arc::new(CountingPipeline::default()));
        let old = write(&ctx, "a.md", "v1");
        let new = write(&ctx, "a.md", "v2");

        let id = ctx.queue.enqueue(SyncJob::upsert("a.md", old)).await.unwrap();
        let lease = ctx.queue.reserve().await.unwrap().unwrap();
        let report = execute(&ctx, lease).await;
        assert_eq!(report.id, id);
        assert!(report.is_settled());
        let replacement = match &report.outcome {
            JobOutcome::Superseded {
                replacement: Some(replacement),
            } => *replacement,
            other => panic!("expected a replacement job, got {:?}", other),
        };

        let next = ctx.queue.reserve().await.unwrap().unwrap();
        assert_eq!(next.id, replacement);
        assert_eq!(next.job, SyncJob::upsert("a.md", new));
        // Superseding does not consume an attempt.
        assert_eq!(next.attempt, 0);
    }

    #[tokio::test]
    async fn test_pipeline_timeout_is_a_retryable_failure() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context(&tmp, Arc::new(SlowPipeline));
        ctx.job_timeout = Duration::from_millis(20);
        let hash = write(&ctx, "slow.md", "zzz");

        ctx.queue.enqueue(SyncJob::upsert("slow.md", hash)).await.unwrap();
        let lease = ctx.queue.reserve().await.unwrap().unwrap();
        let report = execute(&ctx, lease).await;
        match &report.outcome {
            JobOutcome::Retrying { error, .. } => assert_eq!(error.kind, "timeout"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!report.is_settled());
        assert!(ctx.manifest.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_manifest_write_is_not_success() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "a regular file").unwrap();
        let pipeline = Arc::new(CountingPipeline::default());
        let ctx = context_with(
            &tmp,
            pipeline.clone(),
            Arc::new(MemoryJobQueue::new(RetryPolicy::default())),
            ManifestStore::new(blocker.join("manifest.json")),
        );
        let hash = write(&ctx, "a.md", "# A\n");

        ctx.queue.enqueue(SyncJob::upsert("a.md", hash)).await.unwrap();
        let lease = ctx.queue.reserve().await.unwrap().unwrap();
        let report = execute(&ctx, lease).await;

        // The pipeline ran, but without a manifest entry the job failed.
        assert_eq!(pipeline.indexed.load(Ordering::SeqCst), 1);
        match &report.outcome {
            JobOutcome::Retrying { error, .. } => assert_eq!(error.kind, "io"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!report.result().success);
        assert_eq!(std::fs::read_to_string(&blocker).unwrap(), "a regular file");
    }

    #[tokio::test]
    async fn test_acknowledgement_is_retried() {
        let tmp = TempDir::new().unwrap();
        let queue = Arc::new(FlakyQueue::new(1));
        let ctx = context_with(
            &tmp,
            Arc::new(CountingPipeline::default()),
            queue.clone(),
            ManifestStore::new(tmp.path().join("manifest.json")),
        );
        let hash = write(&ctx, "a.md", "v1");

        ctx.queue.enqueue(SyncJob::upsert("a.md", hash)).await.unwrap();
        let lease = ctx.queue.reserve().await.unwrap().unwrap();
        let report = execute(&ctx, lease).await;
        assert!(matches!(report.outcome, JobOutcome::Succeeded { chunks: 3 }));
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_unrecorded_result_releases_the_path() {
        let tmp = TempDir::new().unwrap();
        let queue = Arc::new(FlakyQueue::new(usize::MAX));
        let ctx = context_with(
            &tmp,
            Arc::new(CountingPipeline::default()),
            queue.clone(),
            ManifestStore::new(tmp.path().join("manifest.json")),
        );
        let v1 = write(&ctx, "a.md", "v1");

        let id = ctx.queue.enqueue(SyncJob::upsert("a.md", v1)).await.unwrap();
        let lease = ctx.queue.reserve().await.unwrap().unwrap();
        let report = execute(&ctx, lease).await;
        assert!(matches!(report.outcome, JobOutcome::Released { .. }));
        assert!(!report.is_settled());

        let v2 = write(&ctx, "a.md", "v2");
        ctx.queue.enqueue(SyncJob::upsert("a.md", v2)).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.pending, stats.in_flight), (2, 0));
        // The released job comes back first, on the same attempt.
        let again = ctx.queue.reserve().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempt, 0);
    }

    #[tokio::test]
    async fn test_path_locks_are_released() {
        let locks = PathLocks::default();
        {
            let _a = locks.acquire("a.md").await;
            let _b = locks.acquire("b.md").await;
            assert_eq!(locks.held(), 2);
        }
        assert_eq!(locks.held(), 0);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let tmp = TempDir::new().unwrap();
        let pipeline = Arc::new(CountingPipeline::default());
        let ctx = Arc::new(context(&tmp, pipeline.clone()));
        for i in 0..6 {
            let hash = write(&ctx, &format!("{i}.md"), &format!("doc {i}"));
            ctx.queue
                .enqueue(SyncJob::upsert(format!("{i}.md"), hash))
                .await
                .unwrap();
        }

        let (pool, mut events) = WorkerPool::spawn(ctx.clone(), CancellationToken::new());
        let mut finished = 0;
        while finished < 6 {
            if let Some(WorkerEvent::Finished(report)) = events.recv().await {
                assert!(matches!(report.outcome, JobOutcome::Succeeded { chunks: 3 }));
                finished += 1;
            }
        }
        pool.shutdown().await;
        assert_eq!(pipeline.indexed.load(Ordering::SeqCst), 6);
        assert_eq!(ctx.manifest.load().await.len(), 6);
    }
}
