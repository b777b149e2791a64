//! Filesystem change notifications.
//!
//! Wraps `notify-debouncer-mini`: bursts of raw events for a path collapse
//! into one debounced event, which is classified by looking at the path
//! afterwards. A file that still exists becomes
//! [`FileChangeKind::Change`] and a vanished one [`FileChangeKind::Unlink`].
//! A move therefore arrives as an unlink of the old path plus a change of
//! the new one.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind, Debouncer};
use tokio::sync::mpsc;

use crate::models::{FileChangeEvent, FileChangeKind};

/// Keeps the watcher alive; dropping it stops notifications.
pub struct WatchHandle {
    _debouncer: Debouncer<RecommendedWatcher>,
}

/// Watch `root` recursively and send one [`FileChangeEvent`] per debounced
/// file change.
pub fn watch(
    root: &Path,
    debounce: Duration,
    sender: mpsc::UnboundedSender<FileChangeEvent>,
) -> Result<WatchHandle> {
    if !root.is_dir() {
        anyhow::bail!("not a directory: {}", root.display());
    }

    let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| match result {
        Ok(events) => {
            for event in events {
                if !matches!(
                    event.kind,
                    DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                ) {
                    continue;
                }
                if let Some(change) = classify(&event.path) {
                    if sender.send(change).is_err() {
                        // Receiver gone; the handle is about to be dropped.
                        return;
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "file watcher error");
        }
    })
    .context("Failed to create file watcher")?;

    debouncer
        .watcher()
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;

    tracing::info!(root = %root.display(), debounce_ms = debounce.as_millis() as u64, "watching for changes");
    Ok(WatchHandle {
        _debouncer: debouncer,
    })
}

/// Directories are not documents and produce no event.
pub fn classify(path: &Path) -> Option<FileChangeEvent> {
    let kind = match std::fs::metadata(path) {
        Ok(m) if m.is_dir() => return None,
        Ok(_) => FileChangeKind::Change,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileChangeKind::Unlink,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "cannot stat changed path");
            FileChangeKind::Change
        }
    };
    Some(FileChangeEvent {
        kind,
        path: path.to_path_buf(),
    })
}
