//! In-process [`JobQueue`] backend.
//!
//! Jobs are handed out in enqueue order, skipping any whose backoff has not
//! elapsed or whose path is already in flight. Nothing survives a restart;
//! the next full diff re-creates whatever was lost.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DeadLetter, Disposition, JobQueue, QueueStats, RetryPolicy};
use crate::error::{Result, SyncError};
use crate::job::{JobId, JobLease, JobState, SyncJob};

struct QueuedJob {
    job: SyncJob,
    attempt: u32,
    state: JobState,
    ready_at: Instant,
    delays_ms: Vec<u64>,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    jobs: BTreeMap<JobId, QueuedJob>,
    dead: Vec<DeadLetter>,
}

pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    policy: RetryPolicy,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A poisoned lock only means another worker panicked mid-update;
        // the map itself is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn unknown_job(id: JobId) -> SyncError {
    SyncError::queue(anyhow::anyhow!("unknown or unreserved {}", id))
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: SyncJob) -> Result<JobId> {
        let id = {
            let mut state = self.lock();
            let existing = state
                .jobs
                .iter()
                .find(|(_, q)| q.state == JobState::Pending && q.job == job)
                .map(|(id, _)| *id);
            if let Some(id) = existing {
                tracing::debug!(job_id = %id, job = %job, "coalesced with pending job");
                return Ok(id);
            }

            state.next_id += 1;
            let id = JobId(state.next_id);
            tracing::debug!(job_id = %id, job = %job, "enqueued");
            state.jobs.insert(
                id,
                QueuedJob {
                    job,
                    attempt: 0,
                    state: JobState::Pending,
                    ready_at: Instant::now(),
                    delays_ms: Vec::new(),
                },
            );
            id
        };
        self.notify.notify_one();
        Ok(id)
    }

    async fn reserve(&self) -> Result<Option<JobLease>> {
        let mut state = self.lock();
        let now = Instant::now();
        let busy: HashSet<String> = state
            .jobs
            .values()
            .filter(|q| q.state == JobState::InFlight)
            .map(|q| q.job.path().to_string())
            .collect();

        let next = state.jobs.iter_mut().find(|(_, q)| {
            matches!(q.state, JobState::Pending | JobState::Retrying { .. })
                && q.ready_at <= now
                && !busy.contains(q.job.path())
        });

        Ok(next.map(|(id, q)| {
            q.state = q.state.reserve();
            JobLease {
                id: *id,
                job: q.job.clone(),
                attempt: q.attempt,
            }
        }))
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        {
            let mut state = self.lock();
            match state.jobs.get(&id) {
                Some(q) if q.state == JobState::InFlight => {
                    state.jobs.remove(&id);
                }
                _ => return Err(unknown_job(id)),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &SyncError) -> Result<Disposition> {
        let disposition = {
            let mut state = self.lock();
            let q = match state.jobs.get_mut(&id) {
                Some(q) if q.state == JobState::InFlight => q,
                _ => return Err(unknown_job(id)),
            };

            q.attempt += 1;
            q.state = q
                .state
                .fail(q.attempt, self.policy.exhausted(q.attempt, error));

            if q.state == JobState::PermanentlyFailed {
                let dead = DeadLetter {
                    id,
                    job: q.job.clone(),
                    attempts: q.attempt,
                    delays_ms: q.delays_ms.clone(),
                    error_kind: error.kind().to_string(),
                    last_error: error.to_string(),
                    failed_at: Utc::now(),
                };
                state.jobs.remove(&id);
                state.dead.push(dead.clone());
                Disposition::DeadLettered(dead)
            } else {
                let delay = self.policy.delay_for(q.attempt, error);
                q.ready_at = Instant::now() + delay;
                q.delays_ms.push(delay.as_millis() as u64);
                Disposition::Retry {
                    attempt: q.attempt,
                    delay,
                }
            }
        };
        self.notify.notify_one();
        Ok(disposition)
    }

    async fn release(&self, id: JobId) -> Result<()> {
        {
            let mut state = self.lock();
            match state.jobs.get_mut(&id) {
                Some(q) if q.state == JobState::InFlight => {
                    q.state = q.state.release(q.attempt);
                    q.ready_at = Instant::now();
                }
                _ => return Err(unknown_job(id)),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.lock().dead.clone())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.lock();
        let in_flight = state
            .jobs
            .values()
            .filter(|q| q.state == JobState::InFlight)
            .count();
        Ok(QueueStats {
            pending: state.jobs.len() - in_flight,
            in_flight,
            failed: state.dead.len(),
        })
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        // Wake no later than the earliest pending backoff.
        let wait = {
            let state = self.lock();
            let now = Instant::now();
            state
                .jobs
                .values()
                .filter(|q| matches!(q.state, JobState::Retrying { .. }))
                .map(|q| q.ready_at.saturating_duration_since(now))
                .min()
                .map_or(max_wait, |d| d.min(max_wait))
        };
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
    }
}
