//! The gated call path every paid operation goes through.
//!
//! ```text
//! estimate -> check_budget -> breaker.execute(op) -> settle
//!                  |                  |
//!                  +---- rejected ----+--> release grant, enqueue fallback job
//! ```
//!
//! The budget check runs strictly outside the breaker, so a caller that is
//! over budget never counts as a failure of a healthy service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::breaker::{BreakerError, BreakerRegistry, CircuitOpenError};
use crate::budget::{BudgetError, BudgetGrant, CostEntry, CostExceededError, CostMetadata, CostTracker};
use crate::fallback::{FallbackQueue, NewJob};
use crate::store::StoreError;
use crate::{EXIT_BUDGET, EXIT_FAILURE, EXIT_UNAVAILABLE};

/// One paid call to make through the guard.
#[derive(Debug, Clone, Default)]
pub struct PaidCall {
    pub service: String,
    pub operation: String,
    /// Caller's own estimate; the cost table is used when absent.
    pub estimate: Option<f64>,
    pub metadata: CostMetadata,
    pub idempotency_key: Option<String>,
    /// Job to enqueue if the call is refused or fails.
    pub fallback: Option<NewJob>,
}

impl PaidCall {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_estimate(mut self, estimate_usd: f64) -> Self {
        self.estimate = Some(estimate_usd);
        self
    }

    pub fn with_metadata(mut self, metadata: CostMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_fallback(mut self, job: NewJob) -> Self {
        self.fallback = Some(job);
        self
    }
}

/// An operation's result together with what it actually cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Charged<T> {
    pub value: T,
    pub cost_usd: f64,
}

impl<T> Charged<T> {
    pub fn new(value: T, cost_usd: f64) -> Self {
        Self { value, cost_usd }
    }
}

/// Why a guarded call did not produce a value.
///
/// `deferred` holds the fallback job id when the call carried one and it
/// was enqueued.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error("{error}")]
    Budget {
        error: CostExceededError,
        deferred: Option<Uuid>,
    },

    #[error("{error}")]
    Unavailable {
        error: CircuitOpenError,
        deferred: Option<Uuid>,
    },

    #[error("Call to '{service}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        service: String,
        timeout: Duration,
        deferred: Option<Uuid>,
    },

    #[error("{error}")]
    Operation { error: E, deferred: Option<Uuid> },

    #[error(transparent)]
    Ledger(BudgetError),

    #[error("Breaker state unavailable: {0}")]
    Breaker(StoreError),
}

impl<E> GuardError<E> {
    /// Process exit code for CLIs: budget and availability rejections are
    /// distinct so operators can tell them apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Budget { .. } => EXIT_BUDGET,
            Self::Unavailable { .. } => EXIT_UNAVAILABLE,
            _ => EXIT_FAILURE,
        }
    }

    pub fn deferred(&self) -> Option<Uuid> {
        match self {
            Self::Budget { deferred, .. }
            | Self::Unavailable { deferred, .. }
            | Self::Timeout { deferred, .. }
            | Self::Operation { deferred, .. } => *deferred,
            Self::Ledger(_) | Self::Breaker(_) => None,
        }
    }

    /// True when a gate refused the call and the operation never ran.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Budget { .. } | Self::Unavailable { .. })
    }
}

/// Budget gate, per-service breakers and fallback queue wired together.
#[derive(Clone)]
pub struct CostGuard {
    tracker: CostTracker,
    breakers: Arc<BreakerRegistry>,
    queue: FallbackQueue,
}

impl CostGuard {
    pub fn new(tracker: CostTracker, breakers: Arc<BreakerRegistry>, queue: FallbackQueue) -> Self {
        Self {
            tracker,
            breakers,
            queue,
        }
    }

    pub fn tracker(&self) -> &CostTracker {
        &self.tracker
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn queue(&self) -> &FallbackQueue {
        &self.queue
    }

    /// Run `op` behind the budget gate and the service's breaker, then
    /// settle the reservation with the cost `op` reports.
    ///
    /// Nothing is retried. On rejection or failure the reservation is
    /// released and the call's fallback job, if any, is enqueued.
    pub async fn run<F, Fut, T, E>(
        &self,
        call: PaidCall,
        op: F,
    ) -> Result<Charged<T>, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Charged<T>, E>>,
    {
        let PaidCall {
            service,
            operation,
            estimate,
            metadata,
            idempotency_key,
            fallback,
        } = call;

        let estimate = match estimate {
            Some(estimate) => estimate,
            None => self
                .tracker
                .get_estimated_cost(&service, &operation)
                .map_err(GuardError::Ledger)?,
        };

        let grant = match self.tracker.check_budget(&service, &operation, estimate).await {
            Ok(grant) => grant,
            Err(BudgetError::Exceeded(error)) => {
                tracing::warn!(
                    service = %service,
                    operation = %operation,
                    window = %error.window,
                    current = error.current,
                    limit = error.limit,
                    attempted = error.attempted,
                    "Paid call blocked by budget"
                );
                let deferred = self.defer(fallback).await;
                return Err(GuardError::Budget { error, deferred });
            }
            Err(e) => return Err(GuardError::Ledger(e)),
        };

        let breaker = self.breakers.get(&service).await;
        match breaker.execute(op).await {
            Ok(charged) => {
                let mut entry = CostEntry::new(service.clone(), operation.clone(), charged.cost_usd)
                    .with_metadata(metadata)
                    .with_reservation(grant.reservation_id);
                if let Some(key) = idempotency_key {
                    entry = entry.with_idempotency_key(key);
                }
                if let Err(e) = self.tracker.record(entry).await {
                    // The call already happened; the reservation keeps the
                    // estimate counted until it expires.
                    tracing::error!(
                        service = %service,
                        operation = %operation,
                        amount_usd = charged.cost_usd,
                        error = %e,
                        "Failed to record cost of completed call"
                    );
                }
                Ok(charged)
            }
            Err(err) => {
                self.release(&grant).await;
                Err(match err {
                    BreakerError::Open(error) => {
                        tracing::warn!(
                            service = %service,
                            operation = %operation,
                            retry_in_ms = error.remaining_ms(),
                            "Paid call blocked by open circuit"
                        );
                        GuardError::Unavailable {
                            error,
                            deferred: self.defer(fallback).await,
                        }
                    }
                    BreakerError::Timeout { timeout, .. } => GuardError::Timeout {
                        service,
                        timeout,
                        deferred: self.defer(fallback).await,
                    },
                    BreakerError::Operation(error) => {
                        tracing::warn!(
                            service = %service,
                            operation = %operation,
                            "Paid call failed"
                        );
                        GuardError::Operation {
                            error,
                            deferred: self.defer(fallback).await,
                        }
                    }
                    BreakerError::Store(e) => GuardError::Breaker(e),
                })
            }
        }
    }

    async fn release(&self, grant: &BudgetGrant) {
        if let Err(e) = self.tracker.release(grant).await {
            tracing::warn!(
                reservation_id = %grant.reservation_id,
                error = %e,
                "Failed to release reservation; it will expire"
            );
        }
    }

    async fn defer(&self, fallback: Option<NewJob>) -> Option<Uuid> {
        let job = fallback?;
        let job_type = job.job_type.clone();
        match self.queue.enqueue(job).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(job_type = %job_type, error = %e, "Failed to enqueue fallback job");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::budget::{BudgetCaps, CostTable};
    use crate::clock::ManualClock;
    use crate::fallback::JobStatus;
    use crate::store::Store;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn guard(daily_cap: f64) -> CostGuard {
        let store = Store::open_in_memory().await.unwrap();
        let clock: crate::clock::ClockRef = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 14, 10, 0, 0).unwrap(),
        ));
        let tracker = CostTracker::new(
            store.clone(),
            BudgetCaps {
                daily_usd: daily_cap,
                monthly_usd: 500.0,
            },
        )
        .with_clock(Arc::clone(&clock))
        .with_cost_table(CostTable::new().with("image-gen", "generate", 0.04));
        let breakers = BreakerRegistry::new(store.clone(), BreakerConfig::new(1, 5_000, 60_000))
            .with_clock(Arc::clone(&clock));
        let queue = FallbackQueue::new(store).with_clock(clock);
        CostGuard::new(tracker, Arc::new(breakers), queue)
    }

    fn hero_image() -> NewJob {
        NewJob::new("image", json!({"doc_slug": "spring-flyer", "slot": "hero"}))
    }

    #[tokio::test]
    async fn test_success_settles_actual_cost() {
        let guard = guard(25.0).await;
        let charged = guard
            .run(PaidCall::new("image-gen", "generate"), || async {
                Ok::<_, String>(Charged::new("hero.png", 0.03))
            })
            .await
            .unwrap();
        assert_eq!(charged.value, "hero.png");

        let window = guard.tracker().get_window().await.unwrap();
        assert_eq!(window.daily_spend, 0.03);
        assert_eq!(window.reserved, 0.0);
    }

    #[tokio::test]
    async fn test_budget_rejection_defers_and_never_touches_breaker() {
        let guard = guard(1.0).await;
        let calls = AtomicUsize::new(0);

        let err = guard
            .run(
                PaidCall::new("image-gen", "generate")
                    .with_estimate(5.0)
                    .with_fallback(hero_image()),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Charged::new((), 5.0))
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GuardError::Budget { .. }));
        assert_eq!(err.exit_code(), EXIT_BUDGET);
        assert!(err.is_rejection());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let breaker = guard.breakers().get("image-gen").await;
        assert_eq!(breaker.failure_count().await.unwrap(), 0);
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);

        let job = guard.queue().get(err.deferred().unwrap()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.payload["slot"], "hero");
    }

    #[tokio::test]
    async fn test_failure_releases_grant_then_circuit_rejects() {
        let guard = guard(25.0).await;
        let calls = AtomicUsize::new(0);

        let err = guard
            .run(
                PaidCall::new("image-gen", "generate").with_fallback(hero_image()),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Charged<()>, _>("upstream 503".to_string())
                },
            )
            .await
            .unwrap_err();
        match &err {
            GuardError::Operation { error, deferred } => {
                assert_eq!(error, "upstream 503");
                assert!(deferred.is_some());
            }
            other => panic!("expected operation failure, got {}", other),
        }
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert_eq!(guard.tracker().get_window().await.unwrap().reserved, 0.0);

        let err = guard
            .run(PaidCall::new("image-gen", "generate"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(Charged::new((), 0.04))
            })
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), EXIT_UNAVAILABLE);
        assert_eq!(err.deferred(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.queue().get_stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn test_unknown_cost_is_refused_before_reserving() {
        let guard = guard(25.0).await;
        let err = guard
            .run(PaidCall::new("vision", "critique"), || async {
                Ok::<_, String>(Charged::new((), 0.01))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::Ledger(BudgetError::UnknownCost { .. })
        ));
        assert_eq!(guard.tracker().get_window().await.unwrap().reserved, 0.0);
    }

    #[tokio::test]
    async fn test_idempotency_key_records_once() {
        let guard = guard(25.0).await;
        for _ in 0..2 {
            guard
                .run(
                    PaidCall::new("image-gen", "generate").with_idempotency_key("run-7:hero"),
                    || async { Ok::<_, String>(Charged::new((), 0.04)) },
                )
                .await
                .unwrap();
        }
        let window = guard.tracker().get_window().await.unwrap();
        assert_eq!(window.daily_spend, 0.04);
        assert_eq!(window.reserved, 0.0);
    }
}
