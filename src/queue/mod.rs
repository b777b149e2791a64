//! Durable, at-least-once job queue with bounded retries.
//!
//! The [`JobQueue`] trait is the boundary between the sync core and the
//! broker that holds pending work. Two backends ship with the crate:
//!
//! - [`MemoryJobQueue`](memory::MemoryJobQueue): in-process, for tests and
//!   single-shot runs.
//! - [`SqliteJobQueue`](sqlite::SqliteJobQueue): durable, survives restarts;
//!   jobs claimed by a crashed process are handed out again by
//!   [`recover`](sqlite::SqliteJobQueue::recover).
//!
//! Both backends guarantee:
//!
//! - a reserved job is held by exactly one worker until it is completed or
//!   failed;
//! - no job is handed out while another job for the same path is in flight;
//! - enqueuing a job identical to one still pending returns the pending
//!   job's id instead of queueing a duplicate;
//! - a job failing [`RetryPolicy::max_attempts`] times, or once with an
//!   error that is not [transient](SyncError::is_transient), is moved to
//!   the dead-letter report, never dropped;
//! - a released job goes back to the queue with its attempt count intact.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::QueueConfig;
use crate::error::{Result, SyncError};
use crate::job::{JobId, JobLease, SyncJob};

/// Exponential backoff with a cap and a rate-limit penalty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            rate_limit_multiplier: config.rate_limit_multiplier,
        }
    }

    /// Delay before the next execution, after `failed_attempts` (>= 1)
    /// executions have failed with `error`.
    ///
    /// Delays grow until they reach `max_delay` and stay there. A
    /// `Retry-After` hint is a floor, so a hint at or above `max_delay`
    /// pins every later delay to the cap.
    pub fn delay_for(&self, failed_attempts: u32, error: &SyncError) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        let base = self.initial_delay.saturating_mul(1u32 << exponent);
        let delay = match error {
            SyncError::RateLimited { .. } => {
                let penalized = base.saturating_mul(self.rate_limit_multiplier);
                error.retry_after().map_or(penalized, |ra| ra.max(penalized))
            }
            _ => base,
        };
        delay.min(self.max_delay)
    }

    /// Whether a job that has now failed `failed_attempts` times, the last
    /// time with `error`, should be dead-lettered.
    pub fn exhausted(&self, failed_attempts: u32, error: &SyncError) -> bool {
        !error.is_transient() || failed_attempts >= self.max_attempts
    }
}

/// A job that ran out of attempts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: JobId,
    pub job: SyncJob,
    pub attempts: u32,
    /// Backoff applied after each failed attempt but the last.
    pub delays_ms: Vec<u64>,
    pub error_kind: String,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn to_error(&self) -> SyncError {
        SyncError::PermanentFailure {
            path: self.job.path().to_string(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        }
    }
}

/// What the queue did with a failed execution.
#[derive(Debug, Clone)]
pub enum Disposition {
    Retry { attempt: u32, delay: Duration },
    DeadLettered(DeadLetter),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Ready or waiting out a backoff.
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job to the queue. Returns the id that will report its outcome.
    async fn enqueue(&self, job: SyncJob) -> Result<JobId>;

    /// Claim the next due job whose path is not already in flight, if any.
    /// Never blocks waiting for work.
    async fn reserve(&self) -> Result<Option<JobLease>>;

    /// Acknowledge a reserved job; it is removed from the queue.
    async fn complete(&self, id: JobId) -> Result<()>;

    /// Record a failed execution and apply the retry policy.
    async fn fail(&self, id: JobId, error: &SyncError) -> Result<Disposition>;

    /// Hand a reserved job back without recording an attempt. Used when
    /// the outcome of an execution could not be recorded; the job runs
    /// again.
    async fn release(&self, id: JobId) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Park until new work may be available, or at most `max_wait`.
    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}
