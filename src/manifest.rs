//! Persistent record of the last synchronized content hash per file.
//!
//! The manifest is a single JSON document (by default
//! `<root>/.specmgr-manifest.json`):
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "lastUpdated": "2026-01-01T00:00:00Z",
//!   "entries": {
//!     "guide/intro.md": {
//!       "contentHash": "…",
//!       "size": 1024,
//!       "lastModified": "…",
//!       "lastProcessed": "…"
//!     }
//!   }
//! }
//! ```
//!
//! An entry is only ever written after the indexing work for exactly that
//! content hash has completed, so the manifest never claims more than the
//! index holds. Saves are atomic (temp file, fsync, rename): a crash leaves
//! either the previous or the new document on disk, never a torn one.
//!
//! All mutations go through [`ManifestStore`], which serializes
//! read-modify-write cycles behind a single async mutex.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::hasher;

pub const MANIFEST_VERSION: &str = "1.0";

/// Last successfully synchronized state of one file. Keyed by its path in
/// [`Manifest::entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub content_hash: String,
    /// Diagnostic only; change detection uses `content_hash`.
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub last_processed: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default = "current_version")]
    pub version: String,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
}

fn current_version() -> String {
    MANIFEST_VERSION.to_string()
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: current_version(),
            last_updated: None,
            entries: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(|e| e.content_hash.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStats {
    pub total_files: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub manifest_exists: bool,
    pub manifest_size: u64,
}

/// File-backed manifest with single-writer discipline.
pub struct ManifestStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest, falling back to an empty one when the file is
    /// missing, corrupt, or unreadable. Never fails.
    pub async fn load(&self) -> Manifest {
        match self.try_load().await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "manifest unreadable, starting fresh");
                Manifest::default()
            }
        }
    }

    /// Like [`load`](Self::load), but surfaces read errors other than
    /// "not found". Corruption is still recovered locally.
    pub async fn try_load(&self) -> Result<Manifest> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(e) => return Err(SyncError::io(self.path.display().to_string(), e)),
        };

        match parse_manifest(&raw) {
            Ok(manifest) => Ok(self.validated(manifest)),
            Err(reason) => {
                let err = SyncError::ManifestCorrupt {
                    path: self.path.clone(),
                    reason,
                };
                tracing::warn!(error = %err, "resetting to an empty manifest");
                Ok(Manifest::default())
            }
        }
    }

    /// Persist `manifest`, stamping `last_updated`.
    pub async fn save(&self, manifest: &mut Manifest) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_atomic(manifest).await
    }

    /// Record a successfully indexed file.
    pub async fn upsert_entry(&self, path: &str, entry: ManifestEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut manifest = self.try_load().await?;
        manifest.entries.insert(path.to_string(), entry);
        self.write_atomic(&mut manifest).await
    }

    /// Forget a file. Returns whether an entry existed.
    pub async fn remove_entry(&self, path: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut manifest = self.try_load().await?;
        let existed = manifest.entries.remove(path).is_some();
        if existed {
            self.write_atomic(&mut manifest).await?;
        }
        Ok(existed)
    }

    /// Reset to an empty manifest (forced full resync).
    pub async fn clear(&self) -> Result<()> {
        self.save(&mut Manifest::default()).await
    }

    pub async fn stats(&self) -> ManifestStats {
        let manifest = self.load().await;
        let size = tokio::fs::metadata(&self.path).await.ok().map(|m| m.len());
        ManifestStats {
            total_files: manifest.len(),
            last_updated: manifest.last_updated,
            manifest_exists: size.is_some(),
            manifest_size: size.unwrap_or(0),
        }
    }

    fn validated(&self, mut manifest: Manifest) -> Manifest {
        manifest.entries.retain(|path, entry| {
            let ok = hasher::is_valid_digest(&entry.content_hash);
            if !ok {
                tracing::warn!(
                    path = %path,
                    hash = %entry.content_hash,
                    "dropping manifest entry with invalid content hash"
                );
            }
            ok
        });
        manifest
    }

    async fn write_atomic(&self, manifest: &mut Manifest) -> Result<()> {
        manifest.last_updated = Some(Utc::now());
        let data = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| SyncError::io(self.display(), std::io::Error::other(e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::io(parent.display().to_string(), e))?;
            }
        }

        let tmp_path = temp_path(&self.path);
        let tmp_display = tmp_path.display().to_string();
        {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .map_err(|e| SyncError::io(tmp_display.clone(), e))?;
            file.write_all(&data)
                .await
                .map_err(|e| SyncError::io(tmp_display.clone(), e))?;
            file.sync_all()
                .await
                .map_err(|e| SyncError::io(tmp_display.clone(), e))?;
        }
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| SyncError::io(self.display(), e))?;
        fsync_parent(&self.path).await;

        tracing::debug!(path = %self.path.display(), entries = manifest.len(), "manifest saved");
        Ok(())
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}

fn parse_manifest(raw: &[u8]) -> std::result::Result<Manifest, String> {
    serde_json::from_slice::<Manifest>(raw).map_err(|e| e.to_string())
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "manifest".to_string());
    path.with_file_name(format!("{name}.tmp"))
}

#[cfg(unix)]
async fn fsync_parent(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
}

#[cfg(not(unix))]
async fn fsync_parent(_path: &Path) {}
