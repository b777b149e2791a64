//! Durable [`JobQueue`] backed by the same SQLite database as the index.
//!
//! Rows in `sync_jobs` move through the states `pending`, `in_flight` and
//! `retrying`; a row is deleted on completion or moved to `failed_jobs` once
//! its attempts are exhausted. `run_after` (epoch milliseconds) carries the
//! backoff.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;

use super::{DeadLetter, Disposition, JobQueue, QueueStats, RetryPolicy};
use crate::error::{Result, SyncError};
use crate::job::{JobId, JobLease, JobState, SyncJob};

pub struct SqliteJobQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
    notify: Notify,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn decode_job(kind: &str, path: String, expected_hash: Option<String>) -> Result<SyncJob> {
    SyncJob::from_parts(kind, path.clone(), expected_hash).ok_or_else(|| {
        SyncError::queue(anyhow::anyhow!(
            "malformed job row: kind '{}' for {}",
            kind,
            path
        ))
    })
}

fn state_label(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "pending",
        JobState::InFlight => "in_flight",
        JobState::Retrying { .. } => "retrying",
        JobState::Succeeded => "succeeded",
        JobState::PermanentlyFailed => "permanently_failed",
    }
}

impl SqliteJobQueue {
    /// Wrap a pool whose schema has been set up by
    /// [`run_migrations`](crate::migrate::run_migrations).
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            notify: Notify::new(),
        }
    }

    /// Return jobs a previous process left `in_flight` to `pending`.
    ///
    /// Call once at startup, before any worker reserves. Returns the number
    /// of jobs recovered.
    pub async fn recover(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE sync_jobs SET state = 'pending' WHERE state = 'in_flight'")
            .execute(&self.pool)
            .await
            .map_err(SyncError::queue)?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(recovered, "re-queued jobs abandoned by a previous run");
        }
        Ok(recovered)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: SyncJob) -> Result<JobId> {
        let now = now_ms();

        // Single statement: insert unless an identical job is still pending.
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO sync_jobs (kind, path, expected_hash, state, attempt, run_after, created_at)
            SELECT ?1, ?2, ?3, 'pending', 0, ?4, ?4
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_jobs
                WHERE state = 'pending' AND kind = ?1 AND path = ?2 AND expected_hash IS ?3
            )
            RETURNING id
            "#,
        )
        .bind(job.kind())
        .bind(job.path())
        .bind(job.expected_hash())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(SyncError::queue)?;

        let id = match inserted {
            Some(id) => {
                tracing::debug!(job_id = id, job = %job, "enqueued");
                id
            }
            None => {
                let existing: Option<i64> = sqlx::query_scalar(
                    r#"
                    SELECT id FROM sync_jobs
                    WHERE state = 'pending' AND kind = ? AND path = ? AND expected_hash IS ?
                    ORDER BY id LIMIT 1
                    "#,
                )
                .bind(job.kind())
                .bind(job.path())
                .bind(job.expected_hash())
                .fetch_optional(&self.pool)
                .await
                .map_err(SyncError::queue)?;

                match existing {
                    Some(id) => {
                        tracing::debug!(job_id = id, job = %job, "coalesced with pending job");
                        id
                    }
                    // The pending twin was claimed in between; queue ours.
                    None => sqlx::query_scalar(
                        r#"
                        INSERT INTO sync_jobs (kind, path, expected_hash, state, attempt, run_after, created_at)
                        VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)
                        RETURNING id
                        "#,
                    )
                    .bind(job.kind())
                    .bind(job.path())
                    .bind(job.expected_hash())
                    .bind(now)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(SyncError::queue)?,
                }
            }
        };

        self.notify.notify_one();
        Ok(JobId(id))
    }

    async fn reserve(&self) -> Result<Option<JobLease>> {
        let row = sqlx::query(
            r#"
            UPDATE sync_jobs SET state = 'in_flight'
            WHERE id = (
                SELECT id FROM sync_jobs
                WHERE state IN ('pending', 'retrying')
                  AND run_after <= ?1
                  AND path NOT IN (SELECT path FROM sync_jobs WHERE state = 'in_flight')
                ORDER BY run_after, id
                LIMIT 1
            )
            RETURNING id, kind, path, expected_hash, attempt
            "#,
        )
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(SyncError::queue)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.get("kind");
        let job = decode_job(&kind, row.get("path"), row.get("expected_hash"))?;
        let attempt: i64 = row.get("attempt");
        Ok(Some(JobLease {
            id: JobId(row.get("id")),
            job,
            attempt: attempt as u32,
        }))
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE id = ? AND state = 'in_flight'")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(SyncError::queue)?;
        if result.rows_affected() == 0 {
            return Err(SyncError::queue(anyhow::anyhow!(
                "unknown or unreserved {}",
                id
            )));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &SyncError) -> Result<Disposition> {
        let mut tx = self.pool.begin().await.map_err(SyncError::queue)?;

        let row = sqlx::query(
            r#"
            SELECT kind, path, expected_hash, attempt, delays_json
            FROM sync_jobs WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(SyncError::queue)?
        .ok_or_else(|| SyncError::queue(anyhow::anyhow!("unknown or unreserved {}", id)))?;

        let kind: String = row.get("kind");
        let job = decode_job(&kind, row.get("path"), row.get("expected_hash"))?;
        let previous: i64 = row.get("attempt");
        let delays_json: String = row.get("delays_json");
        let mut delays_ms: Vec<u64> = serde_json::from_str(&delays_json).unwrap_or_default();

        let attempt = previous as u32 + 1;
        let state = JobState::InFlight.fail(attempt, self.policy.exhausted(attempt, error));

        let disposition = if state == JobState::PermanentlyFailed {
            let failed_at = Utc::now();
            sqlx::query(
                r#"
                INSERT INTO failed_jobs
                    (id, kind, path, expected_hash, attempts, delays_json, error_kind, last_error, failed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id.0)
            .bind(job.kind())
            .bind(job.path())
            .bind(job.expected_hash())
            .bind(attempt as i64)
            .bind(&delays_json)
            .bind(error.kind())
            .bind(error.to_string())
            .bind(failed_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(SyncError::queue)?;

            sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
                .bind(id.0)
                .execute(&mut *tx)
                .await
                .map_err(SyncError::queue)?;

            Disposition::DeadLettered(DeadLetter {
                id,
                job,
                attempts: attempt,
                delays_ms,
                error_kind: error.kind().to_string(),
                last_error: error.to_string(),
                failed_at,
            })
        } else {
            let delay = self.policy.delay_for(attempt, error);
            delays_ms.push(delay.as_millis() as u64);
            let delays_json = serde_json::to_string(&delays_ms).map_err(SyncError::queue)?;

            sqlx::query(
                r#"
                UPDATE sync_jobs
                SET state = ?, attempt = ?, run_after = ?, last_error = ?, delays_json = ?
                WHERE id = ?
                "#,
            )
            .bind(state_label(state))
            .bind(attempt as i64)
            .bind(now_ms() + delay.as_millis() as i64)
            .bind(error.to_string())
            .bind(delays_json)
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(SyncError::queue)?;

            Disposition::Retry { attempt, delay }
        };

        tx.commit().await.map_err(SyncError::queue)?;
        self.notify.notify_one();
        Ok(disposition)
    }

    async fn release(&self, id: JobId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = CASE WHEN attempt = 0 THEN 'pending' ELSE 'retrying' END, run_after = ?
            WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(now_ms())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(SyncError::queue)?;
        if result.rows_affected() == 0 {
            return Err(SyncError::queue(anyhow::anyhow!(
                "unknown or unreserved {}",
                id
            )));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, path, expected_hash, attempts, delays_json, error_kind, last_error, failed_at
            FROM failed_jobs ORDER BY failed_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SyncError::queue)?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let attempts: i64 = row.get("attempts");
                let delays_json: String = row.get("delays_json");
                let failed_at: String = row.get("failed_at");
                Ok(DeadLetter {
                    id: JobId(row.get("id")),
                    job: decode_job(&kind, row.get("path"), row.get("expected_hash"))?,
                    attempts: attempts as u32,
                    delays_ms: serde_json::from_str(&delays_json).unwrap_or_default(),
                    error_kind: row.get("error_kind"),
                    last_error: row.get("last_error"),
                    failed_at: DateTime::parse_from_rfc3339(&failed_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM sync_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(SyncError::queue)?;
        let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failed_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(SyncError::queue)?;

        let mut stats = QueueStats {
            failed: failed as usize,
            ..QueueStats::default()
        };
        for row in &rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            if state == "in_flight" {
                stats.in_flight += n as usize;
            } else {
                stats.pending += n as usize;
            }
        }
        Ok(stats)
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}
