//! Units of queued sync work and their lifecycle.
//!
//! ```text
//!            reserve            complete
//! Pending ───────────▶ InFlight ─────────▶ Succeeded
//!    ▲                    │
//!    │   backoff elapsed  │ fail (attempts < max)
//!    └──── Retrying(n) ◀──┤
//!                         │ fail (attempts == max)
//!                         ▼
//!                  PermanentlyFailed
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// One file's worth of indexing work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncJob {
    /// Index the file, provided it still hashes to `expected_hash`.
    Upsert { path: String, expected_hash: String },
    /// Remove the file from the index and the manifest.
    Delete { path: String },
}

impl SyncJob {
    pub fn upsert(path: impl Into<String>, expected_hash: impl Into<String>) -> Self {
        SyncJob::Upsert {
            path: path.into(),
            expected_hash: expected_hash.into(),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        SyncJob::Delete { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            SyncJob::Upsert { path, .. } | SyncJob::Delete { path } => path,
        }
    }

    pub fn expected_hash(&self) -> Option<&str> {
        match self {
            SyncJob::Upsert { expected_hash, .. } => Some(expected_hash),
            SyncJob::Delete { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncJob::Upsert { .. } => "upsert",
            SyncJob::Delete { .. } => "delete",
        }
    }

    /// Rebuild a job from its stored `(kind, path, hash)` columns.
    pub fn from_parts(kind: &str, path: String, expected_hash: Option<String>) -> Option<Self> {
        match (kind, expected_hash) {
            ("upsert", Some(expected_hash)) => Some(SyncJob::Upsert {
                path,
                expected_hash,
            }),
            ("delete", _) => Some(SyncJob::Delete { path }),
            _ => None,
        }
    }
}

impl fmt::Display for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    /// Waiting out the backoff after `attempt` failed executions.
    Retrying { attempt: u32 },
    PermanentlyFailed,
}

impl JobState {
    /// A queued (or retrying) job was handed to a worker.
    pub fn reserve(self) -> JobState {
        match self {
            JobState::Pending | JobState::Retrying { .. } => JobState::InFlight,
            other => other,
        }
    }

    pub fn succeed(self) -> JobState {
        match self {
            JobState::InFlight => JobState::Succeeded,
            other => other,
        }
    }

    /// Outcome of a failed execution, given how many executions have now
    /// failed in total and whether the retry policy gives up.
    pub fn fail(self, failed_attempts: u32, exhausted: bool) -> JobState {
        match self {
            JobState::InFlight if exhausted => JobState::PermanentlyFailed,
            JobState::InFlight => JobState::Retrying {
                attempt: failed_attempts,
            },
            other => other,
        }
    }

    /// A claimed job goes back to the queue without its execution counting
    /// as an attempt.
    pub fn release(self, failed_attempts: u32) -> JobState {
        match self {
            JobState::InFlight if failed_attempts == 0 => JobState::Pending,
            JobState::InFlight => JobState::Retrying {
                attempt: failed_attempts,
            },
            other => other,
        }
    }
}

/// A job handed to a worker by [`JobQueue::reserve`](crate::queue::JobQueue::reserve).
#[derive(Debug, Clone)]
pub struct JobLease {
    pub id: JobId,
    pub job: SyncJob,
    /// Executions that already failed (0 on the first run).
    pub attempt: u32,
}

/// Structured error attached to a failed [`SyncJobResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl From<&SyncError> for JobError {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJobResult {
    pub success: bool,
    pub chunks_processed: usize,
    pub error: Option<JobError>,
}

impl SyncJobResult {
    pub fn succeeded(chunks_processed: usize) -> Self {
        Self {
            success: true,
            chunks_processed,
            error: None,
        }
    }

    pub fn failed(err: &SyncError) -> Self {
        Self {
            success: false,
            chunks_processed: 0,
            error: Some(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_state_machine() {
        let max = 5;
        let mut state = JobState::Pending;
        for failed in 1..max {
            state = state.reserve();
            assert_eq!(state, JobState::InFlight);
            state = state.fail(failed, failed >= max);
            assert_eq!(state, JobState::Retrying { attempt: failed });
        }
        state = state.reserve().fail(max, true);
        assert_eq!(state, JobState::PermanentlyFailed);
        // Terminal states do not move.
        assert_eq!(state.reserve(), JobState::PermanentlyFailed);
        assert_eq!(state.release(max), JobState::PermanentlyFailed);
    }

    #[test]
    fn test_release_keeps_attempt_count() {
        assert_eq!(JobState::InFlight.release(0), JobState::Pending);
        assert_eq!(
            JobState::InFlight.release(2),
            JobState::Retrying { attempt: 2 }
        );
        assert_eq!(JobState::Pending.release(0), JobState::Pending);
    }

    #[test]
    fn test_success_from_in_flight_only() {
        assert_eq!(JobState::Pending.succeed(), JobState::Pending);
        assert_eq!(JobState::InFlight.succeed(), JobState::Succeeded);
    }

    #[test]
    fn test_job_parts() {
        let job = SyncJob::upsert("a.md", "abc");
        assert_eq!(job.kind(), "upsert");
        assert_eq!(
            SyncJob::from_parts("upsert", "a.md".into(), Some("abc".into())),
            Some(job)
        );
        assert_eq!(
            SyncJob::from_parts("delete", "b.md".into(), None),
            Some(SyncJob::delete("b.md"))
        );
        assert_eq!(SyncJob::from_parts("upsert", "c.md".into(), None), None);
    }

    #[test]
    fn test_job_serializes_tagged() {
        let json = serde_json::to_value(SyncJob::delete("gone.md")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "delete", "path": "gone.md"}));
    }
}
