//! Breaker module - per-service circuit breakers.
//!
//! # States
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls fail fast with `CircuitOpenError` and the service sees
//!   no traffic until the reset timeout elapses
//! - **HalfOpen**: exactly one probe call is in flight; its outcome closes
//!   or re-opens the circuit
//!
//! # Transitions
//! ```text
//! Closed   -> Open     : failure_count >= failure_threshold
//! Open     -> HalfOpen : reset timeout elapsed, next caller becomes the probe
//! HalfOpen -> Closed   : probe succeeded (failure_count = 0)
//! HalfOpen -> Open     : probe failed (cooldown restarts)
//! ```
//!
//! State lives in the shared store, one row per service name, so it is
//! shared by every process and survives restarts. Only failures of the
//! wrapped operation count; budget rejections never reach `execute`.

mod circuit;
mod registry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

pub use circuit::{BreakerSnapshot, CircuitBreaker};
pub use registry::BreakerRegistry;

/// Breaker tuning for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Upper bound on a wrapped call; slower calls count as failures.
    pub call_timeout_ms: u64,
    /// Cooldown before a probe is admitted.
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            call_timeout_ms: 30_000,
            reset_timeout_ms: 60_000,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, call_timeout_ms: u64, reset_timeout_ms: u64) -> Self {
        Self {
            failure_threshold,
            call_timeout_ms,
            reset_timeout_ms,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.call_timeout_ms == 0 {
            return Err("call_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CLOSED" => Some(Self::Closed),
            "OPEN" => Some(Self::Open),
            "HALF_OPEN" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call was refused because the named circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker '{name}' is open; retry in {}s", remaining.as_secs_f64().ceil() as u64)]
pub struct CircuitOpenError {
    pub name: String,
    /// Time until a probe may be admitted.
    pub remaining: Duration,
}

impl CircuitOpenError {
    pub fn remaining_ms(&self) -> u64 {
        u64::try_from(self.remaining.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Failure of a call made through a breaker.
///
/// `Operation` carries the wrapped operation's own error unchanged.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),

    #[error("Call to '{name}' timed out after {}ms", timeout.as_millis())]
    Timeout { name: String, timeout: Duration },

    #[error("{0}")]
    Operation(E),

    #[error("Breaker state unavailable: {0}")]
    Store(#[from] StoreError),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    /// The wrapped operation's error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_roundtrip() {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(CircuitState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CircuitState::parse("open"), None);
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
    }

    #[test]
    fn test_open_error_reports_whole_seconds() {
        let err = CircuitOpenError {
            name: "image-gen".to_string(),
            remaining: Duration::from_millis(4200),
        };
        assert_eq!(err.remaining_ms(), 4200);
        assert_eq!(
            err.to_string(),
            "Circuit breaker 'image-gen' is open; retry in 5s"
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(BreakerConfig::default().validate().is_ok());
        assert!(BreakerConfig::new(0, 1000, 1000).validate().is_err());
        assert!(BreakerConfig::new(3, 0, 1000).validate().is_err());
        // Zero cooldown is allowed: probe immediately
        assert!(BreakerConfig::new(3, 1000, 0).validate().is_ok());
    }
}
