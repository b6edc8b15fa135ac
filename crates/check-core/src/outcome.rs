//! Outcome taxonomy and failure classes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified result of one check.
///
/// `RateLimited`, `CredentialError` and `Pending` are non-terminal: the
/// orchestrator retries them internally and they never reach progress
/// counts. Every other variant finalizes the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Valid,
    Used,
    Invalid,
    Expired,
    RateLimited,
    CredentialError,
    Error,
    Skipped,
    Pending,
}

impl Outcome {
    pub const TERMINAL: [Outcome; 6] = [
        Outcome::Valid,
        Outcome::Used,
        Outcome::Invalid,
        Outcome::Expired,
        Outcome::Error,
        Outcome::Skipped,
    ];

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Outcome::RateLimited | Outcome::CredentialError | Outcome::Pending
        )
    }

    /// Stable label for metrics and logs.
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Valid => "valid",
            Outcome::Used => "used",
            Outcome::Invalid => "invalid",
            Outcome::Expired => "expired",
            Outcome::RateLimited => "rate_limited",
            Outcome::CredentialError => "credential_error",
            Outcome::Error => "error",
            Outcome::Skipped => "skipped",
            Outcome::Pending => "pending",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failure category used to pick a retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimited,
    Network,
    Server,
    Timeout,
    Connection,
    Unknown,
}

impl FailureClass {
    pub fn label(self) -> &'static str {
        match self {
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Network => "network",
            FailureClass::Server => "server",
            FailureClass::Timeout => "timeout",
            FailureClass::Connection => "connection",
            FailureClass::Unknown => "unknown",
        }
    }

    /// Map an HTTP status to a class. 429 is rate limiting, 5xx is a
    /// server fault, everything else is unknown.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => FailureClass::RateLimited,
            500..=599 => FailureClass::Server,
            _ => FailureClass::Unknown,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_terminal_outcomes() {
        assert!(!Outcome::RateLimited.is_terminal());
        assert!(!Outcome::CredentialError.is_terminal());
        assert!(!Outcome::Pending.is_terminal());
        for outcome in Outcome::TERMINAL {
            assert!(outcome.is_terminal(), "{outcome} should be terminal");
        }
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&Outcome::CredentialError).unwrap();
        assert_eq!(json, "\"credential_error\"");
        let back: Outcome = serde_json::from_str("\"rate_limited\"").unwrap();
        assert_eq!(back, Outcome::RateLimited);
    }

    #[test]
    fn failure_class_from_status() {
        assert_eq!(FailureClass::from_status(429), FailureClass::RateLimited);
        assert_eq!(FailureClass::from_status(503), FailureClass::Server);
        assert_eq!(FailureClass::from_status(403), FailureClass::Unknown);
    }
}
