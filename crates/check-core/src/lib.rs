//! Core data model for redemption-code checks
//!
//! Defines the outcome taxonomy, the immutable `CheckResult` value, failure
//! metadata consumed by the retry policy, and the `Checker` trait that decouples
//! the orchestrator from the HTTP client. Every crate in the engine speaks
//! these types.

pub mod outcome;
pub mod result;
pub mod sanitize;

pub use outcome::{FailureClass, Outcome};
pub use result::{CheckResult, Failure};
pub use sanitize::sanitize;

use std::future::Future;
use std::pin::Pin;

/// Codes shorter than this are rejected as `Invalid` without a request.
pub const MIN_CODE_LEN: usize = 18;

/// Executes one check of one code.
///
/// Implementations never fail for remote-side problems: timeouts, transport
/// errors and unexpected bodies all come back as a `CheckResult` whose
/// outcome and [`Failure`] describe what went wrong. Dropping the returned
/// future abandons the in-flight request.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Checker>`).
pub trait Checker: Send + Sync {
    fn check<'a>(&'a self, code: &'a str) -> Pin<Box<dyn Future<Output = CheckResult> + Send + 'a>>;

    /// Credential-pool health summary for introspection snapshots.
    fn health(&self) -> Pin<Box<dyn Future<Output = serde_json::Value> + Send + '_>>;
}
