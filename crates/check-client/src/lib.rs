//! HTTP check client for redemption codes
//!
//! One `CheckClient::check` call:
//! 1. Rejects codes shorter than the canonical minimum without a request
//! 2. Waits for its inter-request slot
//! 3. Acquires a token from the pool
//! 4. Issues the GET with bounded connect/read timeouts
//! 5. Classifies status and body into a `CheckResult`
//! 6. Reports usage, rate limits and credential errors back to the pool
//!
//! `CheckClient::test_credentials` sends every token against a placeholder
//! code and updates token validity from the status alone.
//!
//! Transport failures never escape as errors. They come back as `Error`
//! results carrying `Failure` metadata for the retry policy.

pub mod classifier;
pub mod client;
pub mod constants;
pub mod error;
pub mod headers;
pub mod metrics;
pub mod spacer;

pub use classifier::{classify, classify_body, classify_status};
pub use client::{CheckClient, ClientConfig, CredentialTestReport, TestedCredential};
pub use error::{Error, Result};
pub use spacer::RequestSpacer;
