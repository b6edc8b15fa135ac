//! Prometheus metrics exposition
//!
//! The library crates record through the `metrics` facade; this module
//! installs the exporter and adds the runner's own series:
//!
//! - `checker_requests_total` (counter): label `status`
//! - `checker_request_duration_seconds` (histogram): label `status`
//! - `checker_network_errors_total` (counter): label `error_type`
//! - `checker_results_total` (counter): label `outcome`
//! - `checker_retries_total` (counter): label `class`
//! - `checker_pending_codes`, `checker_circuit_breaker_open` (gauges)
//! - `checker_sessions_total` (counter): label `status`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use orchestrator::SessionStatus;

/// Request latency buckets, 10ms up to the 40s default connect+read budget.
const DURATION_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("checker_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `checker_request_duration_seconds` gets explicit buckets so it renders as
/// a Prometheus histogram rather than the default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record how a session ended.
pub fn record_session(status: SessionStatus) {
    metrics::counter!("checker_sessions_total", "status" => status.label()).increment(1);
}
