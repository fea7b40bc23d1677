//! Fallback module - durable store of deferred paid work.
//!
//! # Key Concepts
//! - **Job**: a typed JSON payload the gates refused or that failed
//!   transiently; jobs are never deleted
//! - **Claim**: a drain worker moves a job `queued -> processing` with a
//!   compare-and-set, so two workers never run the same job
//! - **Drain**: replays claimed jobs through the same gated path as the
//!   original caller; no retry happens anywhere else
//!
//! # Lifecycle
//! ```text
//! queued -> processing -> completed
//!               |
//!               +-> queued  (attempts < max_attempts, or deferred by a gate)
//!               +-> failed  (terminal; also a stale job out of attempts)
//! ```

mod drain;
mod queue;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

pub use drain::{DrainReport, DrainWorker, JobError, JobHandler};
pub use queue::{FallbackJob, FallbackQueue, NewJob, QueueStats, StaleJobs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.to_ascii_lowercase()).ok_or_else(|| {
            format!(
                "unknown job status '{}' (expected queued, processing, completed or failed)",
                s
            )
        })
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job type must not be empty")]
    EmptyType,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!("FAILED".parse::<JobStatus>(), Ok(JobStatus::Failed));
        assert!("done".parse::<JobStatus>().is_err());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
