//! Request-level metrics
//!
//! - `checker_requests_total` (counter): label `status`
//! - `checker_request_duration_seconds` (histogram): label `status`
//! - `checker_network_errors_total` (counter): label `error_type`
//! - `checker_credential_unavailable_total` (counter): label `reason`

/// Record a completed request with its HTTP status.
pub fn record_request(status: u16, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("checker_requests_total", "status" => status.clone()).increment(1);
    metrics::histogram!("checker_request_duration_seconds", "status" => status)
        .record(duration_secs);
}

/// Record a request that failed before a response arrived.
pub fn record_network_error(error_type: &str) {
    metrics::counter!("checker_network_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a check that could not get a credential.
pub fn record_credential_unavailable(reason: &str) {
    metrics::counter!("checker_credential_unavailable_total", "reason" => reason.to_string())
        .increment(1);
}
