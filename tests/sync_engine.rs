//! Library-level tests of the sync engine: orchestrator, worker pool and
//! in-memory queue against a scripted indexing pipeline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mdsync::config::DocumentsConfig;
use mdsync::context::SyncContext;
use mdsync::error::SyncError;
use mdsync::hasher::hash_bytes;
use mdsync::index::{IndexError, IndexingPipeline};
use mdsync::job::SyncJob;
use mdsync::manifest::{ManifestEntry, ManifestStore};
use mdsync::models::{FileChangeEvent, FileChangeKind};
use mdsync::orchestrator::SyncOrchestrator;
use mdsync::queue::memory::MemoryJobQueue;
use mdsync::queue::{JobQueue, RetryPolicy};
use mdsync::worker::{WorkerEvent, WorkerPool};

#[derive(Default)]
struct ScriptedPipeline {
    indexed: Mutex<Vec<String>>,
    deindexed: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    delay: Duration,
    active: Mutex<HashMap<String, usize>>,
    max_per_path: AtomicUsize,
    /// `index` of this path blocks until `release` is notified.
    gate: Option<String>,
    started: Notify,
    release: Notify,
}

impl ScriptedPipeline {
    fn failing(paths: &[&str]) -> Self {
        Self {
            failing: Mutex::new(paths.iter().map(|p| p.to_string()).collect()),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn gated(path: &str) -> Self {
        Self {
            gate: Some(path.to_string()),
            ..Default::default()
        }
    }

    fn heal(&self, path: &str) {
        self.failing.lock().unwrap().remove(path);
    }

    fn indexed(&self) -> Vec<String> {
        self.indexed.lock().unwrap().clone()
    }

    fn deindexed(&self) -> Vec<String> {
        self.deindexed.lock().unwrap().clone()
    }

    fn enter(&self, path: &str) {
        let mut active = self.active.lock().unwrap();
        let n = active.entry(path.to_string()).or_default();
        *n += 1;
        self.max_per_path.fetch_max(*n, Ordering::SeqCst);
    }

    fn leave(&self, path: &str) {
        let mut active = self.active.lock().unwrap();
        if let Some(n) = active.get_mut(path) {
            *n -= 1;
        }
    }
}

#[async_trait]
impl IndexingPipeline for ScriptedPipeline {
    async fn index(&self, path: &str, _content: &str) -> Result<usize, IndexError> {
        self.enter(path);
        self.indexed.lock().unwrap().push(path.to_string());
        if self.gate.as_deref() == Some(path) {
            self.started.notify_one();
            self.release.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.leave(path);
        if self.failing.lock().unwrap().contains(path) {
            return Err(IndexError::Failed(anyhow::anyhow!("pipeline down")));
        }
        Ok(2)
    }

    async fn deindex(&self, path: &str) -> Result<(), IndexError> {
        self.enter(path);
        self.deindexed.lock().unwrap().push(path.to_string());
        self.leave(path);
        Ok(())
    }
}

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    manifest: Arc<ManifestStore>,
    queue: Arc<MemoryJobQueue>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("docs");
        std::fs::create_dir_all(&root).unwrap();
        let manifest = Arc::new(ManifestStore::new(tmp.path().join("manifest.json")));
        let queue = Arc::new(MemoryJobQueue::new(RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
            rate_limit_multiplier: 2,
        }));
        Self {
            _tmp: tmp,
            root,
            manifest,
            queue,
        }
    }

    fn context(&self, pipeline: Arc<dyn IndexingPipeline>, concurrency: usize) -> SyncContext {
        let mut ctx = SyncContext::new(
            DocumentsConfig::new(&self.root),
            self.queue.clone(),
            pipeline,
            self.manifest.clone(),
        )
        .unwrap();
        ctx.concurrency = concurrency;
        ctx.poll_interval = Duration::from_millis(20);
        ctx.job_timeout = Duration::from_secs(5);
        ctx
    }

    fn write(&self, rel: &str, body: &str) -> String {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
        hash_bytes(body.as_bytes())
    }

    fn remove(&self, rel: &str) {
        std::fs::remove_file(self.root.join(rel)).unwrap();
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    async fn manifest_hashes(&self) -> BTreeMap<String, String> {
        self.manifest
            .load()
            .await
            .entries
            .into_iter()
            .map(|(path, entry)| (path, entry.content_hash))
            .collect()
    }

    async fn seed_manifest(&self, path: &str, hash: &str) {
        self.manifest
            .upsert_entry(
                path,
                ManifestEntry {
                    content_hash: hash.to_string(),
                    size: 1,
                    last_modified: Utc::now(),
                    last_processed: Utc::now(),
                },
            )
            .await
            .unwrap();
    }
}

async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("timed out")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    within(async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

#[tokio::test]
async fn test_second_run_without_changes_enqueues_nothing() {
    let h = Harness::new();
    h.write("a.md", "# A\n");
    h.write("notes/b.md", "# B\n");
    let pipeline = Arc::new(ScriptedPipeline::default());
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 2));
    let cancel = CancellationToken::new();

    let first = within(orch.run_bulk_sync(false, &cancel).await.unwrap().wait()).await;
    assert_eq!(first.added, 2);
    assert_eq!(first.jobs_enqueued, 2);
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.chunks_processed, 4);
    assert!(first.errors.is_empty());

    let second = within(orch.run_bulk_sync(false, &cancel).await.unwrap().wait()).await;
    assert_eq!(second.jobs_enqueued, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(pipeline.indexed().len(), 2);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_rename_is_one_delete_and_one_add() {
    let h = Harness::new();
    h.write("old.md", "same body");
    let pipeline = Arc::new(ScriptedPipeline::default());
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 2));
    let cancel = CancellationToken::new();
    within(orch.run_bulk_sync(false, &cancel).await.unwrap().wait()).await;

    std::fs::rename(h.abs("old.md"), h.abs("new.md")).unwrap();
    let summary = within(orch.run_bulk_sync(false, &cancel).await.unwrap().wait()).await;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.modified, 0);
    assert_eq!(summary.succeeded, 2);

    let hashes = h.manifest_hashes().await;
    assert_eq!(hashes.keys().collect::<Vec<_>>(), vec!["new.md"]);
    assert_eq!(pipeline.deindexed(), vec!["old.md".to_string()]);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_rewritten_identical_bytes_are_unchanged() {
    let h = Harness::new();
    h.write("a.md", "stable");
    let orch = SyncOrchestrator::start(h.context(Arc::new(ScriptedPipeline::default()), 1));
    let cancel = CancellationToken::new();
    within(orch.run_bulk_sync(false, &cancel).await.unwrap().wait()).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.write("a.md", "stable");
    let summary = within(orch.run_bulk_sync(false, &cancel).await.unwrap().wait()).await;
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.jobs_enqueued, 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_preview_added_and_unchanged() {
    let h = Harness::new();
    let h1 = h.write("a.md", "first");
    h.write("b.md", "second");
    h.seed_manifest("a.md", &h1).await;
    let orch = SyncOrchestrator::start(h.context(Arc::new(ScriptedPipeline::default()), 1));

    let preview = orch.preview().await.unwrap();
    assert_eq!(preview.total_files, 2);
    assert_eq!(preview.diff.added, vec!["b.md".to_string()]);
    assert!(preview.diff.modified.is_empty());
    assert!(preview.diff.deleted.is_empty());
    assert_eq!(preview.diff.unchanged, vec!["a.md".to_string()]);
    // Nothing was queued.
    assert_eq!(h.queue.stats().await.unwrap().pending, 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_modified_and_deleted_settle_into_manifest() {
    let h = Harness::new();
    h.seed_manifest("a.md", &hash_bytes(b"v1")).await;
    h.seed_manifest("b.md", &hash_bytes(b"b")).await;
    let h3 = h.write("a.md", "v3");
    let pipeline = Arc::new(ScriptedPipeline::default());
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 2));

    let run = orch
        .run_bulk_sync(false, &CancellationToken::new())
        .await
        .unwrap();
    let summary = within(run.wait()).await;
    assert_eq!(summary.modified, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.succeeded, 2);

    let expected: BTreeMap<String, String> = [("a.md".to_string(), h3)].into_iter().collect();
    assert_eq!(h.manifest_hashes().await, expected);
    assert_eq!(pipeline.deindexed(), vec!["b.md".to_string()]);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_failing_pipeline_exhausts_five_attempts() {
    let h = Harness::new();
    let old = hash_bytes(b"old body");
    h.seed_manifest("broken.md", &old).await;
    h.write("broken.md", "new body");
    h.write("fine.md", "ok");
    let pipeline = Arc::new(ScriptedPipeline::failing(&["broken.md"]));
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 2));

    let run = orch
        .run_bulk_sync(false, &CancellationToken::new())
        .await
        .unwrap();
    let summary = within(run.wait()).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].path, "broken.md");
    assert_eq!(summary.errors[0].kind, "permanent_failure");

    let attempts = pipeline
        .indexed()
        .iter()
        .filter(|p| p.as_str() == "broken.md")
        .count();
    assert_eq!(attempts, 5);

    let dead = h.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 5);
    assert_eq!(dead[0].delays_ms.len(), 4);
    assert!(dead[0].delays_ms.windows(2).all(|w| w[0] < w[1]));
    assert!(matches!(dead[0].to_error(), SyncError::PermanentFailure { attempts: 5, .. }));

    // The entry from before the failed attempts is untouched.
    let hashes = h.manifest_hashes().await;
    assert_eq!(hashes.get("broken.md"), Some(&old));
    assert!(hashes.contains_key("fine.md"));

    orch.shutdown().await;
}

#[tokio::test]
async fn test_unwritable_manifest_never_counts_as_indexed() {
    let h = Harness::new();
    let blocker = h._tmp.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    h.write("a.md", "body");
    let pipeline = Arc::new(ScriptedPipeline::default());
    let manifest = Arc::new(ManifestStore::new(blocker.join("manifest.json")));
    let mut ctx = SyncContext::new(
        DocumentsConfig::new(&h.root),
        h.queue.clone(),
        pipeline.clone(),
        manifest.clone(),
    )
    .unwrap();
    ctx.poll_interval = Duration::from_millis(20);
    let orch = SyncOrchestrator::start(ctx);

    let run = orch
        .run_bulk_sync(false, &CancellationToken::new())
        .await
        .unwrap();
    let summary = within(run.wait()).await;
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors[0].kind, "permanent_failure");
    assert_eq!(pipeline.indexed().len(), 5);

    let dead = h.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 5);
    assert_eq!(dead[0].error_kind, "io");
    assert!(manifest.load().await.is_empty());
    assert_eq!(std::fs::read_to_string(&blocker).unwrap(), "not a directory");

    orch.shutdown().await;
}

#[tokio::test]
async fn test_periodic_pass_retries_dead_lettered_file() {
    let h = Harness::new();
    let hash = h.write("flaky.md", "body");
    let pipeline = Arc::new(ScriptedPipeline::failing(&["flaky.md"]));
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 1));
    let cancel = CancellationToken::new();

    let first = orch.resync_if_idle(&cancel).await.unwrap().unwrap();
    let summary = within(first.wait()).await;
    assert_eq!(summary.failed, 1);
    assert!(h.manifest.load().await.is_empty());

    // Nothing on disk changed, but the next full pass plans the file again.
    pipeline.heal("flaky.md");
    let second = orch.resync_if_idle(&cancel).await.unwrap().unwrap();
    let summary = within(second.wait()).await;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.manifest_hashes().await.get("flaky.md"), Some(&hash));

    orch.shutdown().await;
}

#[tokio::test]
async fn test_periodic_pass_skips_while_a_run_is_active() {
    let h = Harness::new();
    h.write("slow.md", "body");
    let pipeline = Arc::new(ScriptedPipeline::gated("slow.md"));
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 1));
    let cancel = CancellationToken::new();

    let run = orch.run_bulk_sync(false, &cancel).await.unwrap();
    within(pipeline.started.notified()).await;
    assert!(orch.resync_if_idle(&cancel).await.unwrap().is_none());

    pipeline.release.notify_one();
    within(run.wait()).await;
    let idle = orch.resync_if_idle(&cancel).await.unwrap().unwrap();
    assert_eq!(within(idle.wait()).await.jobs_enqueued, 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_one_job_in_flight_per_path() {
    let h = Harness::new();
    let hash = h.write("hot.md", "contended");
    for i in 0..4 {
        h.write(&format!("cold{i}.md"), "x");
    }
    let pipeline = Arc::new(ScriptedPipeline::slow(Duration::from_millis(15)));
    let ctx = Arc::new(h.context(pipeline.clone(), 4));
    let (pool, mut events) = WorkerPool::spawn(ctx.clone(), CancellationToken::new());

    let mut ids = HashSet::new();
    for round in 0..8 {
        ids.insert(ctx.queue.enqueue(SyncJob::upsert("hot.md", hash.clone())).await.unwrap());
        let rel = format!("cold{}.md", round % 4);
        ids.insert(
            ctx.queue
                .enqueue(SyncJob::upsert(rel, hash_bytes(b"x")))
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    within(async {
        let mut finished = HashSet::new();
        while finished.len() < ids.len() {
            if let Some(WorkerEvent::Finished(report)) = events.recv().await {
                let result = report.result();
                assert!(result.success, "{:?}", result.error);
                assert_eq!(result.chunks_processed, 2);
                finished.insert(report.id);
            }
        }
    })
    .await;
    pool.shutdown().await;

    assert!(pipeline.indexed().iter().filter(|p| *p == "hot.md").count() >= 2);
    assert_eq!(pipeline.max_per_path.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_file_changed_before_its_job_runs_is_superseded() {
    let h = Harness::new();
    h.write("a.md", "gate");
    h.write("b.md", "before");
    let pipeline = Arc::new(ScriptedPipeline::gated("a.md"));
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 1));

    let run = orch
        .run_bulk_sync(false, &CancellationToken::new())
        .await
        .unwrap();
    // The only worker is busy with a.md while b.md changes on disk.
    within(pipeline.started.notified()).await;
    let after = h.write("b.md", "after");
    pipeline.release.notify_one();

    let summary = within(run.wait()).await;
    assert_eq!(summary.jobs_enqueued, 2);
    assert_eq!(summary.superseded, 1);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(h.manifest_hashes().await.get("b.md"), Some(&after));
    // The stale job never reached the pipeline.
    assert_eq!(pipeline.indexed(), vec!["a.md".to_string(), "b.md".to_string()]);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_run_enqueues_nothing() {
    let h = Harness::new();
    for i in 0..5 {
        h.write(&format!("{i}.md"), "body");
    }
    let pipeline = Arc::new(ScriptedPipeline::default());
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 2));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = within(orch.run_bulk_sync(false, &cancel).await.unwrap().wait()).await;
    assert!(summary.cancelled);
    assert_eq!(summary.added, 5);
    assert_eq!(summary.jobs_enqueued, 0);
    assert!(pipeline.indexed().is_empty());
    assert!(h.manifest.load().await.is_empty());

    orch.shutdown().await;
}

#[tokio::test]
async fn test_second_bulk_sync_is_rejected_while_running() {
    let h = Harness::new();
    h.write("slow.md", "body");
    let pipeline = Arc::new(ScriptedPipeline::gated("slow.md"));
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 1));
    let cancel = CancellationToken::new();

    let run = orch.run_bulk_sync(false, &cancel).await.unwrap();
    within(pipeline.started.notified()).await;

    let orch_ref = &orch;
    eventually(|| async move {
        orch_ref.status().await.current_file.as_deref() == Some("slow.md")
    })
    .await;
    let status = orch.status().await;
    assert!(status.is_running);
    assert_eq!(status.total, 1);

    let err = orch.run_bulk_sync(false, &cancel).await.err().unwrap();
    assert!(matches!(err, SyncError::SyncInProgress));

    pipeline.release.notify_one();
    within(run.wait()).await;
    let status = orch.status().await;
    assert!(!status.is_running);
    assert_eq!((status.current, status.total), (1, 1));

    assert!(orch.run_bulk_sync(false, &cancel).await.is_ok());
    orch.shutdown().await;
}

#[tokio::test]
async fn test_force_reindexes_everything_and_drops_missing() {
    let h = Harness::new();
    h.write("keep.md", "keep");
    h.write("gone.md", "gone");
    let pipeline = Arc::new(ScriptedPipeline::default());
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 2));
    let cancel = CancellationToken::new();
    within(orch.run_bulk_sync(false, &cancel).await.unwrap().wait()).await;

    h.remove("gone.md");
    let summary = within(orch.run_bulk_sync(true, &cancel).await.unwrap().wait()).await;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.unchanged, 0);
    assert_eq!(summary.succeeded, 2);

    let keep_runs = pipeline.indexed().iter().filter(|p| *p == "keep.md").count();
    assert_eq!(keep_runs, 2);
    assert_eq!(pipeline.deindexed(), vec!["gone.md".to_string()]);
    assert_eq!(
        h.manifest_hashes().await.keys().collect::<Vec<_>>(),
        vec!["keep.md"]
    );

    orch.shutdown().await;
}

#[tokio::test]
async fn test_file_events_sync_single_files() {
    let h = Harness::new();
    let pipeline = Arc::new(ScriptedPipeline::default());
    let orch = SyncOrchestrator::start(h.context(pipeline.clone(), 2));

    let hash = h.write("live.md", "hello");
    let event = |kind, path: &Path| FileChangeEvent {
        kind,
        path: path.to_path_buf(),
    };
    let id = orch
        .handle_event(event(FileChangeKind::Add, &h.abs("live.md")))
        .await
        .unwrap();
    assert!(id.is_some());
    let (harness, hash) = (&h, &hash);
    eventually(|| async move { harness.manifest_hashes().await.get("live.md") == Some(hash) })
        .await;

    // Already indexed, and not a document.
    assert!(orch
        .handle_event(event(FileChangeKind::Change, &h.abs("live.md")))
        .await
        .unwrap()
        .is_none());
    h.write("notes.txt", "ignored");
    assert!(orch
        .handle_event(event(FileChangeKind::Change, &h.abs("notes.txt")))
        .await
        .unwrap()
        .is_none());

    h.remove("live.md");
    assert!(orch
        .handle_event(event(FileChangeKind::Unlink, &h.abs("live.md")))
        .await
        .unwrap()
        .is_some());
    eventually(|| async move { harness.manifest.load().await.is_empty() }).await;
    assert_eq!(pipeline.deindexed(), vec!["live.md".to_string()]);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_unreadable_root_fails_the_run() {
    let h = Harness::new();
    h.write("not-a-dir.md", "x");
    let mut ctx = h.context(Arc::new(ScriptedPipeline::default()), 1);
    ctx.documents.root = h.abs("not-a-dir.md");
    let orch = SyncOrchestrator::start(ctx);

    let err = orch
        .run_bulk_sync(false, &CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), "scan");
    // The failed run does not block the next one.
    assert!(!orch.status().await.is_running);

    orch.shutdown().await;
}
