use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;

use super::{BreakerConfig, BreakerError, CircuitOpenError, CircuitState};
use crate::clock::{from_millis, to_millis, ClockRef, SystemClock};
use crate::store::{Store, StoreError};

/// A probe still unsettled after this many call timeouts is abandoned and
/// the next caller may take it over.
const PROBE_LEASE_FACTOR: u32 = 2;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Cooldown left before a probe is admitted.
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub(super) struct BreakerRow {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<i64>,
    pub probe_started_at: Option<i64>,
}

/// How a call got through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    /// Single half-open trial; the token is the probe's start time.
    Probe(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

/// What a recorded outcome did to the circuit, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    Opened(u32),
    Reopened,
    Closed,
}

/// Circuit breaker guarding one external service.
///
/// # Thread Safety
/// Admission and outcome recording each run in a single write transaction
/// on the shared store, so concurrent callers (in this process or another)
/// can never both be admitted as the half-open probe.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    store: Store,
    clock: ClockRef,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, store: Store) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: ClockRef) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` if the circuit allows it.
    ///
    /// The operation is bounded by `call_timeout_ms`; a timeout counts as a
    /// failure. Operation errors are counted and handed back unchanged.
    /// Nothing is retried here.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = match self.admit().await? {
            Ok(admission) => admission,
            Err(open) => {
                tracing::debug!(
                    breaker = %self.name,
                    remaining_ms = open.remaining_ms(),
                    "Call rejected by open circuit"
                );
                return Err(BreakerError::Open(open));
            }
        };

        if let Admission::Probe(_) = admission {
            tracing::info!(breaker = %self.name, "Circuit half-open, admitting probe call");
        }

        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                self.settle(admission, Outcome::Success).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.settle(admission, Outcome::Failure).await;
                Err(BreakerError::Operation(e))
            }
            Err(_) => {
                tracing::warn!(
                    breaker = %self.name,
                    timeout_ms = self.config.call_timeout_ms,
                    "Call timed out"
                );
                self.settle(admission, Outcome::Failure).await;
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Persisted state. An OPEN circuit whose cooldown elapsed stays OPEN
    /// until the next call is admitted as the probe.
    pub async fn state(&self) -> Result<CircuitState, StoreError> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn failure_count(&self) -> Result<u32, StoreError> {
        Ok(self.snapshot().await?.failure_count)
    }

    /// `max(0, reset_timeout - (now - opened_at))` while OPEN, zero otherwise.
    pub async fn get_remaining_time(&self) -> Result<Duration, StoreError> {
        let snapshot = self.snapshot().await?;
        Ok(Duration::from_millis(snapshot.remaining_ms))
    }

    pub async fn snapshot(&self) -> Result<BreakerSnapshot, StoreError> {
        let name = self.name.clone();
        let row = self
            .store
            .call(move |conn| -> Result<Option<BreakerRow>, StoreError> {
                let tx = conn.transaction()?;
                let row = load_row(&tx, &name)?;
                tx.commit()?;
                Ok(row)
            })
            .await?
            .unwrap_or_default();
        Ok(snapshot_of(
            &self.name,
            &row,
            &self.config,
            to_millis(self.clock.now()),
        ))
    }

    /// Force the circuit closed (operator action).
    pub async fn reset(&self) -> Result<(), StoreError> {
        let name = self.name.clone();
        let now_ms = to_millis(self.clock.now());
        self.store
            .call(move |conn| -> Result<(), StoreError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                save_row(&tx, &name, &BreakerRow::default(), now_ms)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        tracing::info!(breaker = %self.name, "Circuit manually reset to CLOSED");
        Ok(())
    }

    /// Decide whether a call may proceed, claiming the probe slot if this
    /// call is the half-open trial.
    async fn admit(&self) -> Result<Result<Admission, CircuitOpenError>, StoreError> {
        let name = self.name.clone();
        let now_ms = to_millis(self.clock.now());
        let reset_ms = millis(self.config.reset_timeout());
        let lease_ms = millis(self.config.call_timeout() * PROBE_LEASE_FACTOR);

        let (decision, took_over) = self
            .store
            .call(
                move |conn| -> Result<(Result<Admission, CircuitOpenError>, bool), StoreError> {
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let Some(mut row) = load_row(&tx, &name)? else {
                        return Ok((Ok(Admission::Normal), false));
                    };

                    let mut took_over = false;
                    let decision = match row.state {
                        CircuitState::Closed => Ok(Admission::Normal),
                        CircuitState::Open => {
                            let elapsed = now_ms - row.opened_at.unwrap_or(now_ms);
                            if elapsed >= reset_ms {
                                Ok(Admission::Probe(now_ms))
                            } else {
                                Err(CircuitOpenError {
                                    name: name.clone(),
                                    remaining: Duration::from_millis((reset_ms - elapsed) as u64),
                                })
                            }
                        }
                        CircuitState::HalfOpen => {
                            let started = row.probe_started_at.unwrap_or(i64::MIN / 2);
                            let held_for = now_ms - started;
                            if held_for >= lease_ms {
                                took_over = true;
                                Ok(Admission::Probe(now_ms))
                            } else {
                                Err(CircuitOpenError {
                                    name: name.clone(),
                                    remaining: Duration::from_millis((lease_ms - held_for) as u64),
                                })
                            }
                        }
                    };

                    if let Ok(Admission::Probe(token)) = decision {
                        row.state = CircuitState::HalfOpen;
                        row.probe_started_at = Some(token);
                        save_row(&tx, &name, &row, now_ms)?;
                        tx.commit()?;
                    }
                    Ok((decision, took_over))
                },
            )
            .await?;

        if took_over {
            tracing::warn!(breaker = %self.name, "Previous probe abandoned, taking over");
        }
        Ok(decision)
    }

    /// Record a call's outcome. Storage failures are logged rather than
    /// returned so the caller still receives the operation's own result.
    async fn settle(&self, admission: Admission, outcome: Outcome) {
        match self.record(admission, outcome).await {
            Ok(Transition::Opened(failures)) => tracing::warn!(
                breaker = %self.name,
                failures,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Circuit opened"
            ),
            Ok(Transition::Reopened) => tracing::warn!(
                breaker = %self.name,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Probe failed, circuit re-opened"
            ),
            Ok(Transition::Closed) => {
                tracing::info!(breaker = %self.name, "Probe succeeded, circuit closed")
            }
            Ok(Transition::None) => {}
            Err(e) => tracing::error!(
                breaker = %self.name,
                error = %e,
                "Failed to persist circuit breaker outcome"
            ),
        }
    }

    async fn record(&self, admission: Admission, outcome: Outcome) -> Result<Transition, StoreError> {
        let name = self.name.clone();
        let now_ms = to_millis(self.clock.now());
        let threshold = self.config.failure_threshold;

        self.store
            .call(move |conn| -> Result<Transition, StoreError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut row = load_row(&tx, &name)?.unwrap_or_default();

                let is_live_probe = match admission {
                    Admission::Probe(token) => {
                        if row.state != CircuitState::HalfOpen || row.probe_started_at != Some(token) {
                            // Probe was taken over or the circuit was reset
                            return Ok(Transition::None);
                        }
                        true
                    }
                    Admission::Normal => false,
                };

                let transition = match (outcome, is_live_probe) {
                    (Outcome::Success, true) => {
                        row = BreakerRow::default();
                        Transition::Closed
                    }
                    (Outcome::Failure, true) => {
                        row.state = CircuitState::Open;
                        row.failure_count = row.failure_count.saturating_add(1);
                        row.opened_at = Some(now_ms);
                        row.probe_started_at = None;
                        Transition::Reopened
                    }
                    (Outcome::Success, false) => {
                        if row.state != CircuitState::Closed || row.failure_count == 0 {
                            // Late result from before the circuit opened, or nothing to reset
                            return Ok(Transition::None);
                        }
                        row.failure_count = 0;
                        Transition::None
                    }
                    (Outcome::Failure, false) => {
                        row.failure_count = row.failure_count.saturating_add(1);
                        if row.state == CircuitState::Closed && row.failure_count >= threshold {
                            row.state = CircuitState::Open;
                            row.opened_at = Some(now_ms);
                            Transition::Opened(row.failure_count)
                        } else {
                            Transition::None
                        }
                    }
                };

                save_row(&tx, &name, &row, now_ms)?;
                tx.commit()?;
                Ok(transition)
            })
            .await
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub(super) fn snapshot_of(
    name: &str,
    row: &BreakerRow,
    config: &BreakerConfig,
    now_ms: i64,
) -> BreakerSnapshot {
    let remaining_ms = match (row.state, row.opened_at) {
        (CircuitState::Open, Some(opened)) => {
            (millis(config.reset_timeout()) - (now_ms - opened)).max(0) as u64
        }
        _ => 0,
    };
    BreakerSnapshot {
        name: name.to_string(),
        state: row.state,
        failure_count: row.failure_count,
        opened_at: row.opened_at.map(from_millis),
        remaining_ms,
    }
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<BreakerRow> {
    let raw: String = row.get(0)?;
    let state = CircuitState::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown circuit state '{}'", raw).into(),
        )
    })?;
    Ok(BreakerRow {
        state,
        failure_count: row.get::<_, i64>(1)?.clamp(0, i64::from(u32::MAX)) as u32,
        opened_at: row.get(2)?,
        probe_started_at: row.get(3)?,
    })
}

pub(super) fn load_row(tx: &Transaction<'_>, name: &str) -> rusqlite::Result<Option<BreakerRow>> {
    tx.query_row(
        "SELECT state, failure_count, opened_at, probe_started_at
         FROM circuit_breakers WHERE name = ?1",
        params![name],
        row_from_sql,
    )
    .optional()
}

pub(super) fn load_all_rows(
    tx: &Transaction<'_>,
) -> rusqlite::Result<Vec<(String, BreakerRow)>> {
    let mut stmt = tx.prepare(
        "SELECT state, failure_count, opened_at, probe_started_at, name
         FROM circuit_breakers ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(4)?, row_from_sql(row)?)))?;
    rows.collect()
}

fn save_row(
    tx: &Transaction<'_>,
    name: &str,
    row: &BreakerRow,
    now_ms: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO circuit_breakers
            (name, state, failure_count, opened_at, probe_started_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(name) DO UPDATE SET
            state = excluded.state,
            failure_count = excluded.failure_count,
            opened_at = excluded.opened_at,
            probe_started_at = excluded.probe_started_at,
            updated_at = excluded.updated_at",
        params![
            name,
            row.state.as_str(),
            i64::from(row.failure_count),
            row.opened_at,
            row.probe_started_at,
            now_ms
        ],
    )?;
    Ok(())
}
