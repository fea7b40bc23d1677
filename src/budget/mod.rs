//! Budget module - spend ledger and cap enforcement.
//!
//! # Key Concepts
//! - Ledger: append-only `CostRecord`s, one per paid call
//! - Window: daily and monthly spend derived from the ledger, never cached
//! - Reservation: `check_budget` provisionally deducts the estimate so
//!   concurrent callers cannot jointly overshoot a cap; `settle` replaces it
//!   with the actual amount, `release` drops it, and stale ones expire
//! - Pricing: the cost table used when a caller has no estimate of its own

mod error;
mod pricing;
mod tracker;
mod window;

pub use error::{BudgetError, CostExceededError, WindowKind};
pub use pricing::CostTable;
pub use tracker::{
    BudgetCaps, BudgetGrant, CostEntry, CostMetadata, CostRecord, CostTracker, Remaining,
    ServiceSpend,
};
pub use window::{BudgetWindow, WindowBounds};

/// Amounts are persisted as integer micro-dollars so sums stay exact.
const MICROS_PER_USD: f64 = 1_000_000.0;

/// Largest single amount the ledger accepts. Keeps window sums far from
/// the i64 range SQLite's `SUM` can hold.
pub const MAX_AMOUNT_USD: f64 = 1_000_000.0;

pub(crate) fn usd_to_micros(usd: f64) -> i64 {
    (usd * MICROS_PER_USD).round() as i64
}

pub(crate) fn micros_to_usd(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// `micros_to_usd` for totals computed in i128.
pub(crate) fn wide_micros_to_usd(micros: i128) -> f64 {
    micros as f64 / MICROS_PER_USD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_conversion_is_exact_for_cents() {
        assert_eq!(usd_to_micros(18.36), 18_360_000);
        assert_eq!(usd_to_micros(0.1) + usd_to_micros(0.2), usd_to_micros(0.3));
        assert_eq!(micros_to_usd(640_000), 0.64);
    }
}
