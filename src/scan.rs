//! Filesystem scan provider.
//!
//! Walks the documents root with `walkdir`, applies include/exclude globs,
//! and returns one [`ScannedFile`] per matching document, sorted by path.
//! The manifest file and its temp sibling are always excluded.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::{DocumentsConfig, MANIFEST_FILE_NAME};
use crate::models::ScannedFile;

/// Compiled include/exclude rules for a documents root.
pub struct DocumentFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl DocumentFilter {
    pub fn new(config: &DocumentsConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/node_modules/**".to_string(),
            format!("**/{}", MANIFEST_FILE_NAME),
            format!("**/{}.tmp", MANIFEST_FILE_NAME),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        Ok(Self { include, exclude })
    }

    /// `true` if the root-relative `path` is a document we sync.
    pub fn matches(&self, path: &str) -> bool {
        !self.exclude.is_match(path) && self.include.is_match(path)
    }
}

pub fn scan_documents(config: &DocumentsConfig) -> Result<Vec<ScannedFile>> {
    let root = &config.root;
    if !root.exists() {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create documents root: {}", root.display()))?;
        tracing::info!(root = %root.display(), "created missing documents root");
        return Ok(Vec::new());
    }
    if !root.is_dir() {
        anyhow::bail!("documents root is not a directory: {}", root.display());
    }

    let filter = DocumentFilter::new(config)?;
    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if !filter.matches(&rel) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "skipping file without metadata");
                continue;
            }
        };

        files.push(ScannedFile {
            path: rel,
            abs_path: entry.path().to_path_buf(),
            size: metadata.len(),
            modified: modified_time(&metadata),
        });
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(files)
}

/// Root-relative, `/`-separated form of `path`. Relative inputs are taken
/// as already relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) if path.is_relative() => path,
        Err(_) => return None,
    };
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
