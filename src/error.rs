//! Error taxonomy for the synchronization core.
//!
//! | Variant | Retried by the queue | Consumes an attempt |
//! |---------|----------------------|---------------------|
//! | [`SyncError::Io`] | yes | yes |
//! | [`SyncError::RateLimited`] | yes, longer backoff | yes |
//! | [`SyncError::Timeout`] | yes | yes |
//! | [`SyncError::Index`] | yes | yes |
//! | [`SyncError::StaleJob`] | no, resolved by re-diff | no |
//! | [`SyncError::ManifestCorrupt`] | no, reset to empty | no |
//! | [`SyncError::PermanentFailure`] | no, reported | n/a |
//! | [`SyncError::Scan`] | no, the bulk run fails | n/a |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rate limited by {service}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("stale job for {path}: content changed since it was enqueued")]
    StaleJob { path: String },

    #[error("manifest at {} is corrupt: {reason}", path.display())]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("{path}: gave up after {attempts} attempts ({last_error})")]
    PermanentFailure {
        path: String,
        attempts: u32,
        last_error: String,
    },

    #[error("job for {path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },

    #[error("indexing failed for {path}: {source:#}")]
    Index {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("scan of {} failed: {source:#}", root.display())]
    Scan {
        root: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("job queue error: {0:#}")]
    Queue(#[source] anyhow::Error),

    #[error("a bulk sync is already in progress")]
    SyncInProgress,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn queue(err: impl Into<anyhow::Error>) -> Self {
        SyncError::Queue(err.into())
    }

    /// Transient errors are retried by the job queue with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Io { .. }
                | SyncError::RateLimited { .. }
                | SyncError::Timeout { .. }
                | SyncError::Index { .. }
        )
    }

    /// Stable identifier stored in dead-letter records and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Io { .. } => "io",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::StaleJob { .. } => "stale_job",
            SyncError::ManifestCorrupt { .. } => "manifest_corrupt",
            SyncError::PermanentFailure { .. } => "permanent_failure",
            SyncError::Timeout { .. } => "timeout",
            SyncError::Index { .. } => "index",
            SyncError::Scan { .. } => "scan",
            SyncError::Queue(_) => "queue",
            SyncError::SyncInProgress => "sync_in_progress",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
