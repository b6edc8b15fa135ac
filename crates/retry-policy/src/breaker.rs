//! Consecutive-failure circuit breaker
//!
//! Trips once `threshold` failures accumulate without enough successes in
//! between. The open instant is fixed at trip time: further failures while
//! open do not extend the window. After `cooldown` the breaker closes on the
//! next read and the failure count starts over.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    opened_at: Option<Instant>,
}

/// Introspection view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub open: bool,
    pub failures: u32,
    pub threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reopens_in_secs: Option<u64>,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Count a failure. Returns true if this call tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.failures = state.failures.saturating_add(1);
        if state.failures >= self.threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            warn!(
                failures = state.failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker opened"
            );
            metrics::gauge!("checker_circuit_breaker_open").set(1.0);
            return true;
        }
        false
    }

    /// A success walks the failure count back by one.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.failures = state.failures.saturating_sub(1);
    }

    /// Whether the breaker is currently refusing work. Closes the breaker
    /// if its cool-down has elapsed.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            None => false,
            Some(at) if at.elapsed() >= self.cooldown => {
                *state = BreakerState::default();
                info!("circuit breaker closed after cool-down");
                metrics::gauge!("checker_circuit_breaker_open").set(0.0);
                false
            }
            Some(_) => true,
        }
    }

    /// Close the breaker and forget all failures.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::default();
        metrics::gauge!("checker_circuit_breaker_open").set(0.0);
        info!("circuit breaker manually reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let open = self.is_open();
        let state = self.state.lock();
        BreakerSnapshot {
            open,
            failures: state.failures,
            threshold: self.threshold,
            reopens_in_secs: state
                .opened_at
                .map(|at| self.cooldown.saturating_sub(at.elapsed()).as_secs()),
        }
    }
}
