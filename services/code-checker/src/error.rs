//! Runner-specific error types

use std::path::PathBuf;

use thiserror::Error;

/// Input and output failures at startup. Per-code failures never surface
/// here; they are recorded in each `CheckResult`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read codes file {path}: {source}")]
    CodesFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open results file {path}: {source}")]
    ResultsFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result alias using runner Error
pub type Result<T> = std::result::Result<T, Error>;
