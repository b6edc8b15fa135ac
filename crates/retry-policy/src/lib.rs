//! Retry decisions and circuit breaking for failed checks
//!
//! Each failure class has its own backoff schedule and attempt ceiling. A
//! shared circuit breaker counts consecutive backend failures across all
//! codes and, once tripped, refuses every retry for a fixed cool-down window.
//!
//! The orchestrator drives this crate with data, not exceptions: it turns each
//! `CheckResult` into a [`Disposition`] and branches on the variant.

pub mod breaker;
pub mod config;
pub mod policy;

pub use breaker::{BreakerSnapshot, CircuitBreaker};
pub use config::{BreakerConfig, ClassPolicy, RetryConfig};
pub use policy::{Disposition, MIN_DELAY, RetryPolicy, RetryStats, is_retryable_status};
