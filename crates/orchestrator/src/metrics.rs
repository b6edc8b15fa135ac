//! Session metrics
//!
//! - `checker_results_total` (counter): label `outcome`
//! - `checker_pending_codes` (gauge)

use check_core::Outcome;

/// Record a finalized result.
pub fn record_result(outcome: Outcome) {
    metrics::counter!("checker_results_total", "outcome" => outcome.label()).increment(1);
}

pub fn set_pending(count: usize) {
    metrics::gauge!("checker_pending_codes").set(count as f64);
}
