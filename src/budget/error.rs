use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Which cap a check was evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Daily,
    Monthly,
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// A paid call would push committed spend over a cap.
///
/// `current` and `limit` describe the breached window; `current` includes
/// outstanding reservations held by other callers.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error(
    "{window} budget exceeded: ${current:.2} committed of ${limit:.2} cap, ${attempted:.2} requested"
)]
pub struct CostExceededError {
    pub window: WindowKind,
    pub current: f64,
    pub limit: f64,
    pub attempted: f64,
}

impl CostExceededError {
    /// Budget left in the breached window, never negative.
    pub fn available(&self) -> f64 {
        (self.limit - self.current).max(0.0)
    }
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error(transparent)]
    Exceeded(#[from] CostExceededError),

    #[error("Invalid amount ${amount}: must be between $0 and ${}", super::MAX_AMOUNT_USD)]
    InvalidAmount { amount: f64 },

    #[error("Reservation TTL of {ttl_secs}s is out of range")]
    ReservationTtl { ttl_secs: u64 },

    #[error("No cost estimate for {service}/{operation}")]
    UnknownCost { service: String, operation: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for BudgetError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.into())
    }
}

impl BudgetError {
    /// The structured cap rejection, if that is what this is.
    pub fn as_exceeded(&self) -> Option<&CostExceededError> {
        match self {
            Self::Exceeded(e) => Some(e),
            _ => None,
        }
    }
}
