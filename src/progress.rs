//! Sync progress reporting.
//!
//! Reports what a bulk sync is doing (scanning, the diff it planned, how
//! many jobs have settled) so users can tell when the index has caught up.
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a bulk sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Walking and hashing the documents root.
    Scanning { root: String },
    /// Diff computed.
    Planned {
        total_files: usize,
        added: usize,
        modified: usize,
        deleted: usize,
        unchanged: usize,
    },
    /// `n` of `total` jobs of the run have settled.
    Settled { n: usize, total: usize },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  settled  1,234 / 5,000 jobs".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Scanning { root } => format!("sync {}  scanning...\n", root),
            SyncProgressEvent::Planned {
                total_files,
                added,
                modified,
                deleted,
                unchanged,
            } => format!(
                "sync  planned  {} files: {} added, {} modified, {} deleted, {} unchanged\n",
                format_number(*total_files as u64),
                added,
                modified,
                deleted,
                unchanged
            ),
            SyncProgressEvent::Settled { n, total } => format!(
                "sync  settled  {} / {} jobs\n",
                format_number(*n as u64),
                format_number(*total as u64)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Scanning { root } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "root": root
            }),
            SyncProgressEvent::Planned {
                total_files,
                added,
                modified,
                deleted,
                unchanged,
            } => serde_json::json!({
                "event": "progress",
                "phase": "planned",
                "totalFiles": total_files,
                "added": added,
                "modified": modified,
                "deleted": deleted,
                "unchanged": unchanged
            }),
            SyncProgressEvent::Settled { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "settled",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
