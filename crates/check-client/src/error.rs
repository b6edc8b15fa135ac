//! Client construction errors

/// Errors raised while building the client. Per-request failures are
/// reported through `CheckResult`, never through this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
