use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobStatus, QueueError};
use crate::clock::{from_millis, to_millis, ClockRef, SystemClock};
use crate::store::{uuid_column, Store};

const JOB_COLUMNS: &str =
    "id, job_type, payload, status, attempts, last_error, created_at, updated_at";

/// A job to be deferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackJob {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Live job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Outcome of returning expired `processing` jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StaleJobs {
    pub requeued: usize,
    /// Jobs whose interrupted attempt was their last.
    pub failed: usize,
}

/// Durable job queue backed by the shared store.
#[derive(Clone)]
pub struct FallbackQueue {
    store: Store,
    clock: ClockRef,
}

impl FallbackQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: ClockRef) -> Self {
        self.clock = clock;
        self
    }

    /// Durably append a job in `queued` state and return its id.
    pub async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        if job.job_type.trim().is_empty() {
            return Err(QueueError::EmptyType);
        }
        let id = Uuid::new_v4();
        let payload = serde_json::to_string(&job.payload)?;
        let now_ms = self.now_ms();
        let job_type = job.job_type.clone();

        self.store
            .call(move |conn| -> Result<(), QueueError> {
                conn.execute(
                    "INSERT INTO fallback_jobs
                        (id, job_type, payload, status, attempts, last_error, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, ?5)",
                    params![
                        id.to_string(),
                        job_type,
                        payload,
                        JobStatus::Queued.as_str(),
                        now_ms
                    ],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(job_id = %id, job_type = %job.job_type, "Enqueued fallback job");
        Ok(id)
    }

    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let counts = self
            .store
            .call(|conn| -> Result<Vec<(String, i64)>, QueueError> {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM fallback_jobs GROUP BY status")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut stats = QueueStats::default();
        for (status, count) in counts {
            let count = count.max(0) as u64;
            stats.total += count;
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => stats.queued += count,
                Some(JobStatus::Processing) => stats.processing += count,
                Some(JobStatus::Completed) => stats.completed += count,
                Some(JobStatus::Failed) => stats.failed += count,
                None => tracing::warn!(status = %status, count, "Unknown job status in queue"),
            }
        }
        Ok(stats)
    }

    /// Move a queued job to `processing` and count the attempt.
    ///
    /// Returns `None` if the job is not queued (another worker got it).
    pub async fn claim(&self, id: Uuid) -> Result<Option<FallbackJob>, QueueError> {
        let now_ms = self.now_ms();
        let job = self
            .store
            .call(move |conn| -> Result<Option<FallbackJob>, QueueError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE fallback_jobs
                     SET status = ?1, attempts = attempts + 1, updated_at = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![
                        JobStatus::Processing.as_str(),
                        now_ms,
                        id.to_string(),
                        JobStatus::Queued.as_str()
                    ],
                )?;
                let job = if changed == 1 { load_job(&tx, id)? } else { None };
                tx.commit()?;
                Ok(job)
            })
            .await?;

        if let Some(job) = &job {
            tracing::info!(job_id = %id, job_type = %job.job_type, attempt = job.attempts, "Claimed fallback job");
        }
        Ok(job)
    }

    /// Mark a processing job completed. Returns false if it was not processing.
    pub async fn complete(&self, id: Uuid) -> Result<bool, QueueError> {
        let now_ms = self.now_ms();
        let changed = self
            .store
            .call(move |conn| -> Result<bool, QueueError> {
                let changed = conn.execute(
                    "UPDATE fallback_jobs SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![
                        JobStatus::Completed.as_str(),
                        now_ms,
                        id.to_string(),
                        JobStatus::Processing.as_str()
                    ],
                )?;
                Ok(changed == 1)
            })
            .await?;
        if changed {
            tracing::info!(job_id = %id, "Fallback job completed");
        }
        Ok(changed)
    }

    /// Record a failed attempt. The job goes back to `queued` while
    /// `attempts < max_attempts` and is marked `failed` otherwise.
    ///
    /// Returns the job's new status, or `None` if it was not processing.
    pub async fn fail(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<Option<JobStatus>, QueueError> {
        let now_ms = self.now_ms();
        let error = error.to_string();
        let status = self
            .store
            .call(move |conn| -> Result<Option<JobStatus>, QueueError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let job = match load_job(&tx, id)? {
                    Some(job) if job.status == JobStatus::Processing => job,
                    _ => return Ok(None),
                };
                let next = if job.attempts >= max_attempts {
                    JobStatus::Failed
                } else {
                    JobStatus::Queued
                };
                tx.execute(
                    "UPDATE fallback_jobs SET status = ?1, last_error = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![next.as_str(), error, now_ms, id.to_string()],
                )?;
                tx.commit()?;
                Ok(Some(next))
            })
            .await?;

        match status {
            Some(JobStatus::Failed) => {
                tracing::error!(job_id = %id, "Fallback job failed permanently")
            }
            Some(_) => tracing::warn!(job_id = %id, "Fallback job attempt failed, requeued"),
            None => {}
        }
        Ok(status)
    }

    /// Return a processing job to `queued` without spending an attempt.
    ///
    /// Used when a gate refused the replay, so the job never actually ran.
    pub async fn defer(&self, id: Uuid, reason: &str) -> Result<bool, QueueError> {
        let now_ms = self.now_ms();
        let reason = reason.to_string();
        let changed = self
            .store
            .call(move |conn| -> Result<bool, QueueError> {
                let changed = conn.execute(
                    "UPDATE fallback_jobs
                     SET status = ?1, attempts = MAX(attempts - 1, 0), last_error = ?2, updated_at = ?3
                     WHERE id = ?4 AND status = ?5",
                    params![
                        JobStatus::Queued.as_str(),
                        reason,
                        now_ms,
                        id.to_string(),
                        JobStatus::Processing.as_str()
                    ],
                )?;
                Ok(changed == 1)
            })
            .await?;
        if changed {
            tracing::info!(job_id = %id, "Fallback job deferred");
        }
        Ok(changed)
    }

    /// Recover jobs stuck in `processing` longer than `lease`, e.g. after
    /// a drain process crashed. The interrupted attempt still counts, so a
    /// job that keeps crashing its worker ends up `failed` once it has used
    /// `max_attempts`.
    pub async fn requeue_stale(
        &self,
        lease: Duration,
        max_attempts: u32,
    ) -> Result<StaleJobs, QueueError> {
        let now_ms = self.now_ms();
        let cutoff = now_ms.saturating_sub(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
        let stale = self
            .store
            .call(move |conn| -> Result<StaleJobs, QueueError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let failed = tx.execute(
                    "UPDATE fallback_jobs
                     SET status = ?1, last_error = 'processing lease expired', updated_at = ?2
                     WHERE status = ?3 AND updated_at < ?4 AND attempts >= ?5",
                    params![
                        JobStatus::Failed.as_str(),
                        now_ms,
                        JobStatus::Processing.as_str(),
                        cutoff,
                        max_attempts
                    ],
                )?;
                let requeued = tx.execute(
                    "UPDATE fallback_jobs
                     SET status = ?1, last_error = 'processing lease expired', updated_at = ?2
                     WHERE status = ?3 AND updated_at < ?4",
                    params![
                        JobStatus::Queued.as_str(),
                        now_ms,
                        JobStatus::Processing.as_str(),
                        cutoff
                    ],
                )?;
                tx.commit()?;
                Ok(StaleJobs { requeued, failed })
            })
            .await?;
        if stale.requeued > 0 {
            tracing::warn!(count = stale.requeued, "Requeued stale processing jobs");
        }
        if stale.failed > 0 {
            tracing::error!(
                count = stale.failed,
                "Stale processing jobs out of attempts, marked failed"
            );
        }
        Ok(stale)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<FallbackJob>, QueueError> {
        self.store
            .call(move |conn| -> Result<Option<FallbackJob>, QueueError> {
                let tx = conn.transaction()?;
                let job = load_job(&tx, id)?;
                tx.commit()?;
                Ok(job)
            })
            .await
    }

    /// Jobs oldest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<FallbackJob>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.store
            .call(move |conn| -> Result<Vec<FallbackJob>, QueueError> {
                let sql = format!(
                    "SELECT {} FROM fallback_jobs
                     WHERE ?1 IS NULL OR status = ?1
                     ORDER BY created_at, rowid LIMIT ?2",
                    JOB_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![status.map(|s| s.as_str()), limit], job_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }

    /// Ids of queued jobs, oldest first.
    pub async fn queued_ids(&self, limit: usize) -> Result<Vec<Uuid>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.store
            .call(move |conn| -> Result<Vec<Uuid>, QueueError> {
                let mut stmt = conn.prepare(
                    "SELECT id FROM fallback_jobs WHERE status = ?1
                     ORDER BY created_at, rowid LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![JobStatus::Queued.as_str(), limit], |row| {
                    uuid_column(row, 0)
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }

    fn now_ms(&self) -> i64 {
        to_millis(self.clock.now())
    }
}

fn load_job(tx: &Transaction<'_>, id: Uuid) -> rusqlite::Result<Option<FallbackJob>> {
    let sql = format!("SELECT {} FROM fallback_jobs WHERE id = ?1", JOB_COLUMNS);
    tx.query_row(&sql, params![id.to_string()], job_from_row)
        .optional()
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FallbackJob> {
    let payload: String = row.get(2)?;
    let payload = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let raw_status: String = row.get(3)?;
    let status = JobStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown job status '{}'", raw_status).into(),
        )
    })?;
    Ok(FallbackJob {
        id: uuid_column(row, 0)?,
        job_type: row.get(1)?,
        payload,
        status,
        attempts: row.get::<_, i64>(4)?.clamp(0, i64::from(u32::MAX)) as u32,
        last_error: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        updated_at: from_millis(row.get(7)?),
    })
}
