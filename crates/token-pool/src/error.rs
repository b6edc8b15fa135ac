//! Error types for credential acquisition

use std::time::Duration;

/// Why no credential could be handed out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no credentials configured")]
    NoCredentials,

    #[error("all {total} credentials are invalid")]
    AllInvalid { total: usize },

    #[error("all valid credentials are rate limited, next available in {}s", retry_in.as_secs())]
    AllRateLimited { retry_in: Duration },

    #[error("no credential at index {0}")]
    IndexOutOfRange(usize),
}

impl Error {
    /// Short label for metrics and the `CredentialError` detail prefix.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NoCredentials => "none_configured",
            Error::AllInvalid { .. } => "all_invalid",
            Error::AllRateLimited { .. } => "all_rate_limited",
            Error::IndexOutOfRange(_) => "index_out_of_range",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
