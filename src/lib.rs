//! # costguard
//!
//! Cost governance and resilience for CLI tools that call paid,
//! rate-limited and occasionally unreliable external services.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   check / settle   ┌─────────────┐
//! │            │ ─────────────────▶ │ CostTracker │
//! │            │                    └─────────────┘
//! │ CostGuard  │   execute(op)      ┌────────────────┐
//! │            │ ─────────────────▶ │ CircuitBreaker │ (one per service)
//! │            │                    └────────────────┘
//! │            │   enqueue          ┌───────────────┐      ┌─────────────┐
//! │            │ ─────────────────▶ │ FallbackQueue │ ◀─── │ DrainWorker │
//! └────────────┘                    └───────────────┘      └─────────────┘
//! ```
//!
//! All three components persist to one SQLite database so every CLI
//! process sees the same spend, breaker state and backlog.

pub mod breaker;
pub mod budget;
pub mod clock;
pub mod config;
pub mod fallback;
pub mod guard;
pub mod replay;
pub mod store;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitOpenError, CircuitState};
pub use budget::{CostExceededError, CostTracker};
pub use config::Config;
pub use fallback::{DrainWorker, FallbackQueue};
pub use guard::{Charged, CostGuard, GuardError, PaidCall};
pub use store::Store;

/// Exit code for a call refused by a spending cap.
pub const EXIT_BUDGET: i32 = 3;

/// Exit code for a call refused by an open circuit.
pub const EXIT_UNAVAILABLE: i32 = 4;

/// Exit code for every other failure.
pub const EXIT_FAILURE: i32 = 1;
