//! Core data models shared by the scanner, the index, and the watcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A document file found by the filesystem scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Path relative to the documents root, `/`-separated.
    pub path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl ScannedFile {
    /// Read the file's current bytes.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.abs_path).await
    }
}

/// A chunk of a document's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Add,
    Change,
    Unlink,
}

/// Notification from the file watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    #[serde(rename = "type")]
    pub kind: FileChangeKind,
    /// Absolute, or relative to the documents root.
    pub path: PathBuf,
}
