//! Change detection against the manifest.
//!
//! The content hash is authoritative: a touched-but-identical file is
//! `unchanged`, and a rename shows up as one `deleted` plus one `added`.
//! Files that could not be read during the scan are set aside as
//! `unreadable` instead of being treated as deleted, so a transient read
//! error never removes a document from the index.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};

use crate::hasher;
use crate::job::SyncJob;
use crate::manifest::Manifest;
use crate::models::ScannedFile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFailure {
    pub path: String,
    pub error: String,
}

/// Hashes of every document found by one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanSnapshot {
    pub hashes: BTreeMap<String, String>,
    pub unreadable: Vec<ScanFailure>,
}

impl ScanSnapshot {
    pub fn from_hashes<I, P, H>(hashes: I) -> Self
    where
        I: IntoIterator<Item = (P, H)>,
        P: Into<String>,
        H: Into<String>,
    {
        Self {
            hashes: hashes
                .into_iter()
                .map(|(p, h)| (p.into(), h.into()))
                .collect(),
            unreadable: Vec::new(),
        }
    }

    pub fn total_files(&self) -> usize {
        self.hashes.len() + self.unreadable.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
    pub unreadable: Vec<String>,
}

impl SyncDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Jobs that bring the index in line with `snapshot`: deletes first,
    /// then one upsert per added or modified file.
    pub fn jobs(&self, snapshot: &ScanSnapshot) -> Vec<SyncJob> {
        let deletes = self.deleted.iter().map(SyncJob::delete);
        let upserts = self
            .added
            .iter()
            .chain(self.modified.iter())
            .filter_map(|path| {
                snapshot
                    .hashes
                    .get(path)
                    .map(|hash| SyncJob::upsert(path.clone(), hash.clone()))
            });
        deletes.chain(upserts).collect()
    }
}

/// Classify every path in `snapshot` and `manifest`.
pub fn compute_diff(snapshot: &ScanSnapshot, manifest: &Manifest) -> SyncDiff {
    let mut diff = SyncDiff::default();

    for (path, hash) in &snapshot.hashes {
        match manifest.hash_of(path) {
            None => diff.added.push(path.clone()),
            Some(stored) if stored != hash => diff.modified.push(path.clone()),
            Some(_) => diff.unchanged.push(path.clone()),
        }
    }

    diff.unreadable = snapshot.unreadable.iter().map(|f| f.path.clone()).collect();

    for path in manifest.entries.keys() {
        if !snapshot.hashes.contains_key(path) && !diff.unreadable.contains(path) {
            diff.deleted.push(path.clone());
        }
    }

    // BTreeMap iteration already yields sorted paths; unreadable comes from
    // a JoinSet and needs sorting.
    diff.unreadable.sort();
    diff
}

/// Single-file diff used by watcher events and stale-job re-checks.
///
/// `current_hash` is `None` when the file no longer exists.
pub fn plan_file(path: &str, current_hash: Option<&str>, manifest: &Manifest) -> Option<SyncJob> {
    match (current_hash, manifest.hash_of(path)) {
        (Some(current), Some(stored)) if current == stored => None,
        (Some(current), _) => Some(SyncJob::upsert(path, current)),
        (None, Some(_)) => Some(SyncJob::delete(path)),
        (None, None) => None,
    }
}

/// Read and hash every scanned file, at most `parallelism` at a time.
/// Returns only once every file has been processed.
pub async fn hash_scan(files: Vec<ScannedFile>, parallelism: usize) -> ScanSnapshot {
    hash_with(files, parallelism, |file| async move { file.read().await }).await
}

async fn hash_with<R, Fut>(files: Vec<ScannedFile>, parallelism: usize, read: R) -> ScanSnapshot
where
    R: Fn(ScannedFile) -> Fut,
    Fut: Future<Output = std::io::Result<Vec<u8>>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut set = JoinSet::new();
    // A task that panics takes its path with it; keep a copy to report.
    let mut paths: HashMap<task::Id, String> = HashMap::new();

    for file in files {
        let semaphore = semaphore.clone();
        let path = file.path.clone();
        let bytes = read(file);
        let handle = set.spawn({
            let path = path.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = bytes.await.map(|bytes| hasher::hash_bytes(&bytes));
                (path, result)
            }
        });
        paths.insert(handle.id(), path);
    }

    let mut snapshot = ScanSnapshot::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((path, Ok(hash))) => {
                snapshot.hashes.insert(path, hash);
            }
            Ok((path, Err(e))) => {
                tracing::warn!(path = %path, error = %e, "failed to hash file during scan");
                snapshot.unreadable.push(ScanFailure {
                    path,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                let Some(path) = paths.remove(&e.id()) else {
                    tracing::error!(error = %e, "hashing task failed");
                    continue;
                };
                tracing::error!(path = %path, error = %e, "hashing task failed");
                snapshot.unreadable.push(ScanFailure {
                    path,
                    error: format!("hashing task failed: {}", e),
                });
            }
        }
    }
    snapshot.unreadable.sort_by(|a, b| a.path.cmp(&b.path));
    snapshot
}
