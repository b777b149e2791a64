//! Wiring shared by the worker pool and the orchestrator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::{Config, DocumentsConfig, QueueConfig};
use crate::db;
use crate::embedding;
use crate::index::sqlite::SqliteIndex;
use crate::index::IndexingPipeline;
use crate::manifest::ManifestStore;
use crate::migrate;
use crate::queue::memory::MemoryJobQueue;
use crate::queue::sqlite::SqliteJobQueue;
use crate::queue::{JobQueue, RetryPolicy};
use crate::scan::{self, DocumentFilter};

pub struct SyncContext {
    pub documents: DocumentsConfig,
    pub filter: DocumentFilter,
    pub queue: Arc<dyn JobQueue>,
    pub pipeline: Arc<dyn IndexingPipeline>,
    pub manifest: Arc<ManifestStore>,
    /// Number of workers.
    pub concurrency: usize,
    /// Upper bound on one pipeline call.
    pub job_timeout: Duration,
    /// Longest an idle worker sleeps before polling the queue again.
    pub poll_interval: Duration,
}

impl SyncContext {
    /// Context over explicit collaborators, with queue defaults for the
    /// worker settings.
    pub fn new(
        documents: DocumentsConfig,
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<dyn IndexingPipeline>,
        manifest: Arc<ManifestStore>,
    ) -> Result<Self> {
        let defaults = QueueConfig::default();
        Ok(Self {
            filter: DocumentFilter::new(&documents)?,
            documents,
            queue,
            pipeline,
            manifest,
            concurrency: defaults.concurrency,
            job_timeout: defaults.job_timeout(),
            poll_interval: defaults.poll_interval(),
        })
    }

    /// Open the database, run migrations, and build the configured index,
    /// queue backend and manifest store. Jobs a crashed process left in
    /// flight are put back on the queue.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        let embedder = embedding::create_embedder(&config.embedding)?;
        let pipeline = Arc::new(SqliteIndex::new(
            pool.clone(),
            config.chunking.max_tokens,
            embedder,
            config.embedding.batch_size,
        ));

        let policy = RetryPolicy::from_config(&config.queue);
        let queue: Arc<dyn JobQueue> = match config.queue.backend.as_str() {
            "memory" => Arc::new(MemoryJobQueue::new(policy)),
            _ => {
                let queue = SqliteJobQueue::new(pool, policy);
                queue.recover().await?;
                Arc::new(queue)
            }
        };

        let manifest = Arc::new(ManifestStore::new(config.manifest_path()));

        Ok(Self {
            documents: config.documents.clone(),
            filter: DocumentFilter::new(&config.documents)?,
            queue,
            pipeline,
            manifest,
            concurrency: config.queue.concurrency,
            job_timeout: config.queue.job_timeout(),
            poll_interval: config.queue.poll_interval(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.documents.root
    }

    /// Root-relative path of `path` if it is a document we sync.
    pub fn document_path(&self, path: &Path) -> Option<String> {
        let rel = scan::relative_path(self.root(), path).or_else(|| {
            // Watchers report absolute paths even for a relative root.
            std::fs::canonicalize(self.root())
                .ok()
                .and_then(|root| scan::relative_path(&root, path))
        })?;
        self.filter.matches(&rel).then_some(rel)
    }
}
