//! Cost tracker - the spend ledger and the cap gate in front of paid calls.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{BudgetError, CostExceededError, WindowKind};
use super::pricing::CostTable;
use super::window::{BudgetWindow, WindowBounds};
use super::{micros_to_usd, usd_to_micros, wide_micros_to_usd, MAX_AMOUNT_USD};
use crate::clock::{from_millis, to_millis, ClockRef, SystemClock};
use crate::config::{Config, ConfigError};
use crate::store::{opt_uuid_column, uuid_column, Store};

/// Fraction of a cap at which grants start logging warnings.
const WARN_FRACTION: f64 = 0.8;

const RECORD_COLUMNS: &str = "id, service, operation, amount_micros, occurred_at, \
     doc_slug, run_id, user_name, reservation_id, idempotency_key";

/// Spending caps in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCaps {
    pub daily_usd: f64,
    pub monthly_usd: f64,
}

/// Who and what a cost was incurred for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl CostMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_doc_slug(mut self, doc_slug: impl Into<String>) -> Self {
        self.doc_slug = Some(doc_slug.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: Uuid,
    pub service: String,
    pub operation: String,
    pub amount_usd: f64,
    pub occurred_at: DateTime<Utc>,
    pub metadata: CostMetadata,
    /// Reservation this record settled, if any.
    pub reservation_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
}

/// A cost to be appended to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct CostEntry {
    pub service: String,
    pub operation: String,
    pub amount_usd: f64,
    pub metadata: CostMetadata,
    pub reservation_id: Option<Uuid>,
    /// Retried writes carrying the same key are recorded once.
    pub idempotency_key: Option<String>,
}

impl CostEntry {
    pub fn new(service: impl Into<String>, operation: impl Into<String>, amount_usd: f64) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            amount_usd,
            metadata: CostMetadata::default(),
            reservation_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_metadata(mut self, metadata: CostMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_reservation(mut self, reservation_id: Uuid) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Budget left after a grant, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Remaining {
    pub daily: f64,
    pub monthly: f64,
}

/// Proof that `reserved_usd` was set aside for one paid call.
///
/// Settle it with the actual amount once the call succeeds, or release it.
/// A grant that is neither stops counting after it expires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetGrant {
    pub reservation_id: Uuid,
    pub service: String,
    pub operation: String,
    pub reserved_usd: f64,
    pub remaining: Remaining,
    pub expires_at: DateTime<Utc>,
}

/// Aggregated spend for one (service, operation).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSpend {
    pub service: String,
    pub operation: String,
    pub calls: u64,
    pub total_usd: f64,
}

enum CheckOutcome {
    Granted { daily: i128, monthly: i128 },
    Denied(CostExceededError),
}

/// Gate and ledger for all spend.
///
/// # Invariants
/// - Recorded spend is append-only; totals are always recomputed from the
///   ledger, so they are correct right after a restart
/// - A check and its reservation happen in one write transaction, so for any
///   interleaving of concurrent checks (across processes too) recorded spend
///   plus outstanding reservations never exceeds a cap
#[derive(Clone)]
pub struct CostTracker {
    store: Store,
    clock: ClockRef,
    caps: BudgetCaps,
    offset: FixedOffset,
    table: CostTable,
    reservation_ttl: std::time::Duration,
}

impl CostTracker {
    /// Create a tracker with UTC windows, an empty cost table and a
    /// 15 minute reservation TTL.
    pub fn new(store: Store, caps: BudgetCaps) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            caps,
            offset: Utc.fix(),
            table: CostTable::new(),
            reservation_ttl: std::time::Duration::from_secs(15 * 60),
        }
    }

    pub fn from_config(store: Store, config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            store,
            BudgetCaps {
                daily_usd: config.daily_cap_usd,
                monthly_usd: config.monthly_cap_usd,
            },
        )
        .with_offset(config.offset()?)
        .with_cost_table(config.cost_table())
        .with_reservation_ttl(config.reservation_ttl()))
    }

    pub fn with_clock(mut self, clock: ClockRef) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_cost_table(mut self, table: CostTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_reservation_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn caps(&self) -> BudgetCaps {
        self.caps
    }

    pub fn cost_table(&self) -> &CostTable {
        &self.table
    }

    /// Append a cost with no reservation attached.
    ///
    /// Recording never enforces caps; that is `check_budget`'s job and must
    /// happen before the paid call is issued.
    pub async fn record_cost(
        &self,
        service: &str,
        operation: &str,
        amount_usd: f64,
        metadata: CostMetadata,
    ) -> Result<CostRecord, BudgetError> {
        self.record(CostEntry::new(service, operation, amount_usd).with_metadata(metadata))
            .await
    }

    /// Replace a grant's reservation with the actual cost.
    pub async fn settle(
        &self,
        grant: &BudgetGrant,
        amount_usd: f64,
        metadata: CostMetadata,
    ) -> Result<CostRecord, BudgetError> {
        self.record(
            CostEntry::new(grant.service.clone(), grant.operation.clone(), amount_usd)
                .with_metadata(metadata)
                .with_reservation(grant.reservation_id),
        )
        .await
    }

    /// Append a cost to the ledger.
    ///
    /// If the entry names a reservation, the reservation is settled in the
    /// same transaction. An entry whose idempotency key was already recorded
    /// returns the original record and appends nothing.
    pub async fn record(&self, entry: CostEntry) -> Result<CostRecord, BudgetError> {
        let amount_micros = validate_amount(entry.amount_usd)?;
        let occurred_at = from_millis(to_millis(self.clock.now()));

        let record = CostRecord {
            id: Uuid::new_v4(),
            service: entry.service,
            operation: entry.operation,
            amount_usd: micros_to_usd(amount_micros),
            occurred_at,
            metadata: entry.metadata,
            reservation_id: entry.reservation_id,
            idempotency_key: entry.idempotency_key,
        };

        let (stored, inserted) = self
            .store
            .call(move |conn| -> Result<(CostRecord, bool), BudgetError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                if let Some(key) = record.idempotency_key.as_deref() {
                    if let Some(existing) = find_by_idempotency_key(&tx, key)? {
                        if let Some(reservation) = record.reservation_id {
                            set_reservation_status(&tx, reservation, "released")?;
                        }
                        tx.commit()?;
                        return Ok((existing, false));
                    }
                }

                insert_record(&tx, &record, amount_micros)?;
                if let Some(reservation) = record.reservation_id {
                    set_reservation_status(&tx, reservation, "settled")?;
                }
                tx.commit()?;
                Ok((record, true))
            })
            .await?;

        if inserted {
            tracing::info!(
                service = %stored.service,
                operation = %stored.operation,
                amount_usd = stored.amount_usd,
                record_id = %stored.id,
                "Recorded cost"
            );
        } else {
            tracing::info!(
                record_id = %stored.id,
                idempotency_key = stored.idempotency_key.as_deref().unwrap_or(""),
                "Cost already recorded, ignoring duplicate"
            );
        }
        Ok(stored)
    }

    /// Release an unused grant. Returns false if it was already settled,
    /// released or expired.
    pub async fn release(&self, grant: &BudgetGrant) -> Result<bool, BudgetError> {
        let id = grant.reservation_id;
        let released = self
            .store
            .call(move |conn| -> Result<bool, BudgetError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = set_reservation_status(&tx, id, "released")?;
                tx.commit()?;
                Ok(changed)
            })
            .await?;

        if released {
            tracing::debug!(
                reservation_id = %id,
                service = %grant.service,
                amount_usd = grant.reserved_usd,
                "Released budget reservation"
            );
        }
        Ok(released)
    }

    /// Reserve `estimated_cost` if both caps allow it.
    ///
    /// The daily cap is checked first; the first breached window is
    /// reported. On success the returned grant's `remaining` already
    /// accounts for this reservation.
    pub async fn check_budget(
        &self,
        service: &str,
        operation: &str,
        estimated_cost: f64,
    ) -> Result<BudgetGrant, BudgetError> {
        let estimate = validate_amount(estimated_cost)?;
        let now = self.clock.now();
        let now_ms = to_millis(now);
        let expires_at = Duration::from_std(self.reservation_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map(|at| from_millis(to_millis(at)))
            .ok_or(BudgetError::ReservationTtl {
                ttl_secs: self.reservation_ttl.as_secs(),
            })?;
        let day = WindowBounds::day(now, self.offset).millis();
        let month = WindowBounds::month(now, self.offset).millis();
        let daily_cap = i128::from(usd_to_micros(self.caps.daily_usd));
        let monthly_cap = i128::from(usd_to_micros(self.caps.monthly_usd));
        let reservation_id = Uuid::new_v4();

        let svc = service.to_string();
        let op = operation.to_string();
        let expires_ms = to_millis(expires_at);

        let (expired, outcome) = self
            .store
            .call(move |conn| -> Result<(usize, CheckOutcome), BudgetError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let expired = expire_reservations(&tx, now_ms)?;
                let reserved = i128::from(active_reserved(&tx)?);
                let daily = i128::from(recorded_between(&tx, day)?) + reserved;
                let monthly = i128::from(recorded_between(&tx, month)?) + reserved;
                let wanted = i128::from(estimate);

                let denied = if daily + wanted > daily_cap {
                    Some((WindowKind::Daily, daily, daily_cap))
                } else if monthly + wanted > monthly_cap {
                    Some((WindowKind::Monthly, monthly, monthly_cap))
                } else {
                    None
                };

                if let Some((window, current, limit)) = denied {
                    tx.commit()?;
                    return Ok((
                        expired,
                        CheckOutcome::Denied(CostExceededError {
                            window,
                            current: wide_micros_to_usd(current),
                            limit: wide_micros_to_usd(limit),
                            attempted: micros_to_usd(estimate),
                        }),
                    ));
                }

                tx.execute(
                    "INSERT INTO budget_reservations
                        (id, service, operation, amount_micros, created_at, expires_at, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active')",
                    params![reservation_id.to_string(), svc, op, estimate, now_ms, expires_ms],
                )?;
                tx.commit()?;
                Ok((
                    expired,
                    CheckOutcome::Granted {
                        daily: daily + wanted,
                        monthly: monthly + wanted,
                    },
                ))
            })
            .await?;

        if expired > 0 {
            tracing::warn!(count = expired, "Expired abandoned budget reservations");
        }

        match outcome {
            CheckOutcome::Denied(err) => {
                tracing::warn!(
                    service,
                    operation,
                    window = %err.window,
                    current = err.current,
                    limit = err.limit,
                    attempted = err.attempted,
                    "Budget check denied"
                );
                Err(err.into())
            }
            CheckOutcome::Granted { daily, monthly } => {
                let remaining = Remaining {
                    daily: wide_micros_to_usd(daily_cap - daily),
                    monthly: wide_micros_to_usd(monthly_cap - monthly),
                };
                if (daily as f64) >= daily_cap as f64 * WARN_FRACTION {
                    tracing::warn!(
                        committed = wide_micros_to_usd(daily),
                        cap = self.caps.daily_usd,
                        "Approaching daily budget cap"
                    );
                }
                if (monthly as f64) >= monthly_cap as f64 * WARN_FRACTION {
                    tracing::warn!(
                        committed = wide_micros_to_usd(monthly),
                        cap = self.caps.monthly_usd,
                        "Approaching monthly budget cap"
                    );
                }
                tracing::debug!(
                    service,
                    operation,
                    reserved_usd = micros_to_usd(estimate),
                    remaining_daily = remaining.daily,
                    remaining_monthly = remaining.monthly,
                    "Budget reserved"
                );
                Ok(BudgetGrant {
                    reservation_id,
                    service: service.to_string(),
                    operation: operation.to_string(),
                    reserved_usd: micros_to_usd(estimate),
                    remaining,
                    expires_at,
                })
            }
        }
    }

    /// `check_budget` using the cost table's estimate.
    pub async fn check_budget_estimated(
        &self,
        service: &str,
        operation: &str,
    ) -> Result<BudgetGrant, BudgetError> {
        let estimate = self.get_estimated_cost(service, operation)?;
        self.check_budget(service, operation, estimate).await
    }

    /// Cost table lookup. Unknown combinations are an error, never zero.
    pub fn get_estimated_cost(&self, service: &str, operation: &str) -> Result<f64, BudgetError> {
        self.table
            .get(service, operation)
            .ok_or_else(|| BudgetError::UnknownCost {
                service: service.to_string(),
                operation: operation.to_string(),
            })
    }

    pub fn get_estimated_cost_or(&self, service: &str, operation: &str, default: f64) -> f64 {
        self.table.get(service, operation).unwrap_or(default)
    }

    /// Recorded spend in the current calendar day.
    pub async fn get_daily_spend(&self) -> Result<f64, BudgetError> {
        let bounds = WindowBounds::day(self.clock.now(), self.offset);
        self.spend_in(bounds).await
    }

    /// Recorded spend in the current calendar month.
    pub async fn get_monthly_spend(&self) -> Result<f64, BudgetError> {
        let bounds = WindowBounds::month(self.clock.now(), self.offset);
        self.spend_in(bounds).await
    }

    /// Spend in an arbitrary window.
    pub async fn spend_in(&self, bounds: WindowBounds) -> Result<f64, BudgetError> {
        let range = bounds.millis();
        let micros = self
            .store
            .call(move |conn| -> Result<i64, BudgetError> {
                let tx = conn.transaction()?;
                let total = recorded_between(&tx, range)?;
                tx.commit()?;
                Ok(total)
            })
            .await?;
        Ok(micros_to_usd(micros))
    }

    /// Daily and monthly spend plus live reservations, in one snapshot.
    pub async fn get_window(&self) -> Result<BudgetWindow, BudgetError> {
        let now = self.clock.now();
        let now_ms = to_millis(now);
        let day = WindowBounds::day(now, self.offset).millis();
        let month = WindowBounds::month(now, self.offset).millis();

        let (daily, monthly, reserved) = self
            .store
            .call(move |conn| -> Result<(i64, i64, i64), BudgetError> {
                let tx = conn.transaction()?;
                let daily = recorded_between(&tx, day)?;
                let monthly = recorded_between(&tx, month)?;
                let reserved: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(amount_micros), 0) FROM budget_reservations
                     WHERE status = 'active' AND expires_at > ?1",
                    params![now_ms],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                Ok((daily, monthly, reserved))
            })
            .await?;

        Ok(BudgetWindow {
            daily_spend: micros_to_usd(daily),
            monthly_spend: micros_to_usd(monthly),
            reserved: micros_to_usd(reserved),
        })
    }

    /// Spend per (service, operation) since `since`, largest first.
    pub async fn spend_by_service(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ServiceSpend>, BudgetError> {
        let since_ms = to_millis(since);
        self.store
            .call(move |conn| -> Result<Vec<ServiceSpend>, BudgetError> {
                let mut stmt = conn.prepare(
                    "SELECT service, operation, COUNT(*), SUM(amount_micros)
                     FROM cost_records WHERE occurred_at >= ?1
                     GROUP BY service, operation
                     ORDER BY SUM(amount_micros) DESC, service, operation",
                )?;
                let rows = stmt.query_map(params![since_ms], |row| {
                    Ok(ServiceSpend {
                        service: row.get(0)?,
                        operation: row.get(1)?,
                        calls: row.get::<_, i64>(2)?.max(0) as u64,
                        total_usd: micros_to_usd(row.get(3)?),
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }

    /// Most recent ledger entries, newest first.
    pub async fn recent_records(&self, limit: usize) -> Result<Vec<CostRecord>, BudgetError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.store
            .call(move |conn| -> Result<Vec<CostRecord>, BudgetError> {
                let sql = format!(
                    "SELECT {} FROM cost_records ORDER BY occurred_at DESC, rowid DESC LIMIT ?1",
                    RECORD_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit], record_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }
}

fn validate_amount(amount: f64) -> Result<i64, BudgetError> {
    if !amount.is_finite() || !(0.0..=MAX_AMOUNT_USD).contains(&amount) {
        return Err(BudgetError::InvalidAmount { amount });
    }
    Ok(usd_to_micros(amount))
}

fn recorded_between(tx: &Transaction<'_>, (start, end): (i64, i64)) -> rusqlite::Result<i64> {
    tx.query_row(
        "SELECT COALESCE(SUM(amount_micros), 0) FROM cost_records
         WHERE occurred_at >= ?1 AND occurred_at < ?2",
        params![start, end],
        |row| row.get(0),
    )
}

fn active_reserved(tx: &Transaction<'_>) -> rusqlite::Result<i64> {
    tx.query_row(
        "SELECT COALESCE(SUM(amount_micros), 0) FROM budget_reservations WHERE status = 'active'",
        [],
        |row| row.get(0),
    )
}

fn expire_reservations(tx: &Transaction<'_>, now_ms: i64) -> rusqlite::Result<usize> {
    tx.execute(
        "UPDATE budget_reservations SET status = 'expired'
         WHERE status = 'active' AND expires_at <= ?1",
        params![now_ms],
    )
}

fn set_reservation_status(
    tx: &Transaction<'_>,
    id: Uuid,
    status: &str,
) -> rusqlite::Result<bool> {
    let changed = tx.execute(
        "UPDATE budget_reservations SET status = ?2 WHERE id = ?1 AND status = 'active'",
        params![id.to_string(), status],
    )?;
    Ok(changed > 0)
}

fn insert_record(
    tx: &Transaction<'_>,
    record: &CostRecord,
    amount_micros: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO cost_records
            (id, service, operation, amount_micros, occurred_at,
             doc_slug, run_id, user_name, reservation_id, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id.to_string(),
            record.service,
            record.operation,
            amount_micros,
            to_millis(record.occurred_at),
            record.metadata.doc_slug,
            record.metadata.run_id,
            record.metadata.user,
            record.reservation_id.map(|id| id.to_string()),
            record.idempotency_key,
        ],
    )?;
    Ok(())
}

fn find_by_idempotency_key(
    tx: &Transaction<'_>,
    key: &str,
) -> rusqlite::Result<Option<CostRecord>> {
    let sql = format!(
        "SELECT {} FROM cost_records WHERE idempotency_key = ?1",
        RECORD_COLUMNS
    );
    tx.query_row(&sql, params![key], record_from_row).optional()
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CostRecord> {
    Ok(CostRecord {
        id: uuid_column(row, 0)?,
        service: row.get(1)?,
        operation: row.get(2)?,
        amount_usd: micros_to_usd(row.get(3)?),
        occurred_at: from_millis(row.get(4)?),
        metadata: CostMetadata {
            doc_slug: row.get(5)?,
            run_id: row.get(6)?,
            user: row.get(7)?,
        },
        reservation_id: opt_uuid_column(row, 8)?,
        idempotency_key: row.get(9)?,
    })
}
