use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{FallbackJob, FallbackQueue, JobStatus, QueueError};
use crate::config::QueueSettings;

/// Jobs looked at per drain pass.
const DEFAULT_BATCH_SIZE: usize = 50;

/// Why a replayed job did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// A gate refused the replay; the job never ran and keeps its attempt.
    #[error("deferred: {0}")]
    Deferred(String),

    /// The job ran and failed; counts toward `max_attempts`.
    #[error("{0}")]
    Failed(String),

    /// The job can never succeed as written (e.g. malformed payload).
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// Replays one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &FallbackJob) -> Result<(), JobError>;
}

/// Outcome counts of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    /// Failed attempts sent back to the queue.
    pub requeued: usize,
    /// Jobs that became terminally failed.
    pub failed: usize,
    /// Jobs a gate refused; they stay queued with no attempt spent.
    pub deferred: usize,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.completed + self.requeued + self.failed + self.deferred
    }
}

/// Pulls queued jobs and hands them to a [`JobHandler`].
pub struct DrainWorker {
    queue: FallbackQueue,
    handler: Arc<dyn JobHandler>,
    settings: QueueSettings,
    batch_size: usize,
}

impl DrainWorker {
    pub fn new(queue: FallbackQueue, handler: Arc<dyn JobHandler>, settings: QueueSettings) -> Self {
        Self {
            queue,
            handler,
            settings,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Process the jobs queued right now, once each.
    ///
    /// Jobs requeued during the pass are left for the next one, so a pass
    /// always terminates.
    pub async fn drain_once(&self) -> Result<DrainReport, QueueError> {
        let stale = self
            .queue
            .requeue_stale(self.settings.processing_lease(), self.settings.max_attempts)
            .await?;

        let mut report = DrainReport {
            failed: stale.failed,
            ..Default::default()
        };
        for id in self.queue.queued_ids(self.batch_size).await? {
            let Some(job) = self.queue.claim(id).await? else {
                continue;
            };

            match self.handler.handle(&job).await {
                Ok(()) => {
                    self.queue.complete(job.id).await?;
                    report.completed += 1;
                }
                Err(JobError::Deferred(reason)) => {
                    self.queue.defer(job.id, &reason).await?;
                    report.deferred += 1;
                }
                Err(JobError::Failed(error)) => {
                    match self
                        .queue
                        .fail(job.id, &error, self.settings.max_attempts)
                        .await?
                    {
                        Some(JobStatus::Failed) => report.failed += 1,
                        Some(_) => report.requeued += 1,
                        None => {}
                    }
                }
                Err(JobError::Permanent(error)) => {
                    if self.queue.fail(job.id, &error, 0).await?.is_some() {
                        report.failed += 1;
                    }
                }
            }
        }

        if report.processed() > 0 {
            tracing::info!(
                completed = report.completed,
                requeued = report.requeued,
                failed = report.failed,
                deferred = report.deferred,
                "Drain pass finished"
            );
        }
        Ok(report)
    }

    /// Drain repeatedly until `cancel` fires, sleeping `poll_interval`
    /// between passes. Queue errors are logged and retried on the next pass.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            poll_interval_secs = self.settings.poll_interval_secs,
            "Drain worker started"
        );
        loop {
            if let Err(e) = self.drain_once().await {
                tracing::error!(error = %e, "Drain pass failed");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Drain worker stopped");
                    return;
                }
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fallback::NewJob;
    use crate::store::Store;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers by job payload `{"result": "ok" | "fail" | "defer" | "bad"}`.
    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &FallbackJob) -> Result<(), JobError> {
            let result = job.payload["result"].as_str().unwrap_or("bad").to_string();
            self.seen.lock().unwrap().push(result.clone());
            match result.as_str() {
                "ok" => Ok(()),
                "fail" => Err(JobError::Failed("upstream 502".to_string())),
                "defer" => Err(JobError::Deferred("circuit open".to_string())),
                _ => Err(JobError::Permanent("unreadable payload".to_string())),
            }
        }
    }

    fn settings(max_attempts: u32) -> QueueSettings {
        QueueSettings {
            max_attempts,
            processing_lease_secs: 600,
            poll_interval_secs: 1,
        }
    }

    async fn worker(max_attempts: u32) -> (DrainWorker, FallbackQueue, Arc<ScriptedHandler>) {
        let queue = FallbackQueue::new(Store::open_in_memory().await.unwrap());
        let handler = Arc::new(ScriptedHandler::default());
        let worker = DrainWorker::new(queue.clone(), handler.clone(), settings(max_attempts));
        (worker, queue, handler)
    }

    #[tokio::test]
    async fn test_drain_once_routes_outcomes() {
        let (worker, queue, _handler) = worker(3).await;
        let ok = queue.enqueue(NewJob::new("render", json!({"result": "ok"}))).await.unwrap();
        let fail = queue.enqueue(NewJob::new("render", json!({"result": "fail"}))).await.unwrap();
        let defer = queue.enqueue(NewJob::new("render", json!({"result": "defer"}))).await.unwrap();
        let bad = queue.enqueue(NewJob::new("render", json!({"result": "bad"}))).await.unwrap();

        let report = worker.drain_once().await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                completed: 1,
                requeued: 1,
                failed: 1,
                deferred: 1
            }
        );

        let status = |id| {
            let queue = queue.clone();
            async move { queue.get(id).await.unwrap().unwrap() }
        };
        assert_eq!(status(ok).await.status, JobStatus::Completed);
        let failed_once = status(fail).await;
        assert_eq!(failed_once.status, JobStatus::Queued);
        assert_eq!(failed_once.attempts, 1);
        let deferred = status(defer).await;
        assert_eq!(deferred.status, JobStatus::Queued);
        assert_eq!(deferred.attempts, 0);
        assert_eq!(status(bad).await.status, JobStatus::Failed);

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_failing_job_exhausts_attempts() {
        let (worker, queue, handler) = worker(2).await;
        let id = queue.enqueue(NewJob::new("render", json!({"result": "fail"}))).await.unwrap();

        assert_eq!(worker.drain_once().await.unwrap().requeued, 1);
        assert_eq!(worker.drain_once().await.unwrap().failed, 1);
        assert_eq!(worker.drain_once().await.unwrap(), DrainReport::default());

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(handler.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_job_out_of_attempts_is_failed_not_replayed() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 14, 10, 0, 0).unwrap());
        let queue = FallbackQueue::new(Store::open_in_memory().await.unwrap())
            .with_clock(Arc::new(clock.clone()));
        let handler = Arc::new(ScriptedHandler::default());
        let worker = DrainWorker::new(queue.clone(), handler.clone(), settings(2));
        let id = queue.enqueue(NewJob::new("render", json!({"result": "ok"}))).await.unwrap();

        // Two workers died mid-job
        queue.claim(id).await.unwrap().unwrap();
        clock.advance(chrono::Duration::minutes(11));
        queue.requeue_stale(Duration::from_secs(600), 2).await.unwrap();
        queue.claim(id).await.unwrap().unwrap();
        clock.advance(chrono::Duration::minutes(11));

        let report = worker.drain_once().await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                failed: 1,
                ..Default::default()
            }
        );
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (worker, queue, _handler) = worker(3).await;
        let id = queue.enqueue(NewJob::new("render", json!({"result": "ok"}))).await.unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(cancel).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Completed);
    }
}
