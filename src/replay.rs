//! Replays deferred jobs by running an external command through the guard.
//!
//! Payload shape:
//! ```json
//! {
//!   "service": "image-gen",
//!   "operation": "generate",
//!   "estimated_cost_usd": 0.04,
//!   "command": ["gen-image", "--slot", "hero"],
//!   "input": {"prompt": "..."}
//! }
//! ```
//! `input`, when present, is written to the command's stdin as JSON. The
//! command may report what it actually cost by printing `{"cost_usd": x}`
//! as its last line of stdout; otherwise the estimate is recorded.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::budget::{BudgetError, CostMetadata};
use crate::fallback::{FallbackJob, JobError, JobHandler};
use crate::guard::{Charged, CostGuard, GuardError, PaidCall};

/// Longest stderr excerpt kept in a job's `last_error`.
const STDERR_EXCERPT: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayPayload {
    pub service: String,
    pub operation: String,
    #[serde(default)]
    pub estimated_cost_usd: Option<f64>,
    pub command: Vec<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: CostMetadata,
}

#[derive(Debug, Deserialize)]
struct CostReport {
    cost_usd: f64,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// [`JobHandler`] that replays command jobs through a [`CostGuard`].
pub struct CommandReplayer {
    guard: CostGuard,
}

impl CommandReplayer {
    pub fn new(guard: CostGuard) -> Self {
        Self { guard }
    }

    /// Run the payload's command once through the gated path.
    pub async fn replay(
        &self,
        job: &FallbackJob,
        payload: ReplayPayload,
    ) -> Result<Charged<String>, GuardError<ReplayError>> {
        let mut call = PaidCall::new(payload.service.clone(), payload.operation.clone())
            .with_metadata(payload.metadata.clone())
            .with_idempotency_key(format!("fallback-job:{}", job.id));
        if let Some(estimate) = payload.estimated_cost_usd {
            call = call.with_estimate(estimate);
        }
        let fallback_cost = payload
            .estimated_cost_usd
            .unwrap_or_else(|| {
                self.guard
                    .tracker()
                    .get_estimated_cost_or(&payload.service, &payload.operation, 0.0)
            });

        self.guard
            .run(call, || run_command(payload, fallback_cost))
            .await
    }
}

#[async_trait]
impl JobHandler for CommandReplayer {
    async fn handle(&self, job: &FallbackJob) -> Result<(), JobError> {
        let payload: ReplayPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::Permanent(format!("invalid replay payload: {}", e)))?;
        if payload.command.is_empty() {
            return Err(JobError::Permanent("replay command is empty".to_string()));
        }

        tracing::info!(
            job_id = %job.id,
            service = %payload.service,
            operation = %payload.operation,
            "Replaying fallback job"
        );

        match self.replay(job, payload).await {
            Ok(charged) => {
                tracing::debug!(job_id = %job.id, cost_usd = charged.cost_usd, "Replay succeeded");
                Ok(())
            }
            Err(e) if e.is_rejection() => Err(JobError::Deferred(e.to_string())),
            Err(GuardError::Ledger(
                e @ (BudgetError::UnknownCost { .. } | BudgetError::InvalidAmount { .. }),
            )) => {
                Err(JobError::Permanent(e.to_string()))
            }
            Err(e) => Err(JobError::Failed(e.to_string())),
        }
    }
}

async fn run_command(
    payload: ReplayPayload,
    fallback_cost: f64,
) -> Result<Charged<String>, ReplayError> {
    let program = payload.command[0].clone();
    let mut child = Command::new(&program)
        .args(&payload.command[1..])
        .stdin(if payload.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ReplayError::Spawn {
            program: program.clone(),
            source,
        })?;

    if let (Some(input), Some(mut stdin)) = (payload.input, child.stdin.take()) {
        let bytes = input.to_string().into_bytes();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&bytes).await {
                tracing::warn!("Failed to write replay input: {}", e);
            }
        });
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ReplayError::Spawn {
            program: program.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ReplayError::Exit {
            program,
            status: output.status,
            stderr: stderr.trim().chars().take(STDERR_EXCERPT).collect(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let cost = reported_cost(&stdout).unwrap_or(fallback_cost);
    Ok(Charged::new(stdout, cost))
}

/// Cost from a trailing `{"cost_usd": x}` line, if the command printed one.
fn reported_cost(stdout: &str) -> Option<f64> {
    let last = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    serde_json::from_str::<CostReport>(last.trim())
        .ok()
        .map(|report| report.cost_usd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerRegistry};
    use crate::budget::{BudgetCaps, CostTable, CostTracker};
    use crate::config::QueueSettings;
    use crate::fallback::{DrainReport, DrainWorker, FallbackQueue, JobStatus, NewJob};
    use crate::store::Store;
    use serde_json::json;
    use std::sync::Arc;

    async fn setup(daily_cap: f64) -> (DrainWorker, FallbackQueue, CostGuard) {
        let store = Store::open_in_memory().await.unwrap();
        let tracker = CostTracker::new(
            store.clone(),
            BudgetCaps {
                daily_usd: daily_cap,
                monthly_usd: 100.0,
            },
        )
        .with_cost_table(CostTable::new().with("doc-render", "render", 0.02));
        let breakers = Arc::new(BreakerRegistry::new(
            store.clone(),
            BreakerConfig::new(3, 10_000, 60_000),
        ));
        let queue = FallbackQueue::new(store);
        let guard = CostGuard::new(tracker, breakers, queue.clone());
        let worker = DrainWorker::new(
            queue.clone(),
            Arc::new(CommandReplayer::new(guard.clone())),
            QueueSettings::default(),
        );
        (worker, queue, guard)
    }

    fn shell_job(script: &str) -> NewJob {
        NewJob::new(
            "command",
            json!({
                "service": "doc-render",
                "operation": "render",
                "command": ["sh", "-c", script],
            }),
        )
    }

    #[test]
    fn test_reported_cost_reads_last_line() {
        assert_eq!(reported_cost("rendering\n{\"cost_usd\": 0.42}\n\n"), Some(0.42));
        assert_eq!(reported_cost("{\"cost_usd\": 0.42}\ndone\n"), None);
        assert_eq!(reported_cost(""), None);
    }

    #[tokio::test]
    async fn test_replay_records_reported_cost() {
        let (worker, queue, guard) = setup(10.0).await;
        let id = queue
            .enqueue(shell_job("echo rendered; echo '{\"cost_usd\": 0.42}'"))
            .await
            .unwrap();

        let report = worker.drain_once().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(guard.tracker().get_daily_spend().await.unwrap(), 0.42);
    }

    #[tokio::test]
    async fn test_replay_falls_back_to_estimate_and_feeds_stdin() {
        let (worker, queue, guard) = setup(10.0).await;
        queue
            .enqueue(NewJob::new(
                "command",
                json!({
                    "service": "doc-render",
                    "operation": "render",
                    "command": ["sh", "-c", "grep -q spring-flyer"],
                    "input": {"doc_slug": "spring-flyer"},
                }),
            ))
            .await
            .unwrap();

        assert_eq!(worker.drain_once().await.unwrap().completed, 1);
        assert_eq!(guard.tracker().get_daily_spend().await.unwrap(), 0.02);
    }

    #[tokio::test]
    async fn test_failing_command_is_requeued() {
        let (worker, queue, guard) = setup(10.0).await;
        let id = queue.enqueue(shell_job("echo boom >&2; exit 2")).await.unwrap();

        let report = worker.drain_once().await.unwrap();
        assert_eq!(report.requeued, 1);
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.last_error.unwrap().contains("boom"));
        assert_eq!(guard.tracker().get_daily_spend().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_over_budget_replay_is_deferred() {
        let (worker, queue, _guard) = setup(0.01).await;
        let id = queue.enqueue(shell_job("true")).await.unwrap();

        let report = worker.drain_once().await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                deferred: 1,
                ..Default::default()
            }
        );
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_permanently() {
        let (worker, queue, _guard) = setup(10.0).await;
        let id = queue
            .enqueue(NewJob::new("command", json!({"service": "doc-render"})))
            .await
            .unwrap();
        assert_eq!(worker.drain_once().await.unwrap().failed, 1);
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Failed);
    }
}
