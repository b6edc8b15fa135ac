//! Immutable result of a single check

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::outcome::{FailureClass, Outcome};
use crate::sanitize::sanitize;

/// Transport or server failure metadata attached to an `Error` or
/// `RateLimited` result. The retry policy branches on this, not on the
/// human-readable detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub class: FailureClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Server-supplied minimum delay (`Retry-After`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl Failure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::from_status(status),
            status: Some(status),
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub code: String,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
    /// Sanitized snapshot of the response body, when one was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl CheckResult {
    pub fn new(code: impl Into<String>, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            outcome,
            timestamp: Utc::now(),
            detail: detail.into(),
            raw: None,
            failure: None,
        }
    }

    /// Attach the response body. Secrets are redacted and large fields
    /// truncated before the value is stored.
    pub fn with_raw(mut self, body: &serde_json::Value) -> Self {
        self.raw = Some(sanitize(body));
        self
    }

    pub fn with_failure(mut self, failure: Failure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Re-label a result with a new outcome and detail, keeping the rest.
    pub fn downgrade(mut self, outcome: Outcome, detail: impl Into<String>) -> Self {
        self.outcome = outcome;
        self.detail = detail.into();
        self.timestamp = Utc::now();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.failure.as_ref().and_then(|f| f.retry_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_raw_stores_sanitized_body() {
        let body = json!({"tokenState": "Active", "token": "EwAoA+secret"});
        let result = CheckResult::new("AAAAA-BBBBB-CCCCC-DDDDD-EEEEE", Outcome::Valid, "active")
            .with_raw(&body);
        let raw = result.raw.unwrap();
        assert_eq!(raw["token"], "[REDACTED]");
        assert_eq!(raw["tokenState"], "Active");
    }

    #[test]
    fn retry_after_reads_failure() {
        let result = CheckResult::new("X", Outcome::RateLimited, "slow down").with_failure(
            Failure::http(429, "rate limited").with_retry_after(Some(Duration::from_secs(10))),
        );
        assert_eq!(result.retry_after(), Some(Duration::from_secs(10)));
        assert_eq!(
            result.failure.as_ref().map(|f| f.class),
            Some(FailureClass::RateLimited)
        );
    }

    #[test]
    fn downgrade_keeps_code_and_failure() {
        let result = CheckResult::new("X", Outcome::CredentialError, "401")
            .with_failure(Failure::http(401, "unauthorized"));
        let skipped = result.downgrade(Outcome::Skipped, "credential retries exhausted");
        assert_eq!(skipped.code, "X");
        assert_eq!(skipped.outcome, Outcome::Skipped);
        assert!(skipped.is_terminal());
        assert!(skipped.failure.is_some());
    }

    #[test]
    fn serializes_without_empty_optionals() {
        let result = CheckResult::new("X", Outcome::Invalid, "not found");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["outcome"], "invalid");
        assert!(value.get("raw").is_none());
        assert!(value.get("failure").is_none());
    }
}
