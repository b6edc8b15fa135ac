//! Concurrent validation engine
//!
//! Runs one check session at a time over a bounded pool of worker tasks.
//! Non-terminal outcomes (`RateLimited`, `CredentialError`) are requeued up to
//! `max_retries` times and then finalized as `Skipped`; transient failures
//! follow the retry policy's class schedule. While the circuit breaker is
//! open, dequeued codes finalize as `Error` without a request. Every input
//! code is finalized exactly once, and the session completes when the
//! pending set drains.
//!
//! # Control
//!
//! `start` / `pause` / `resume` / `stop` follow the state machine in
//! [`state`]. Commands that are not valid in the current status return
//! [`Error::InvalidTransition`] and change nothing.
//!
//! # Observation
//!
//! Register an [`Observer`] to receive results and status messages, or poll
//! the snapshot methods (`session_info`, `pending_info`, `worker_status`).
//! [`ProgressAggregator`] is an observer that republishes running counts and
//! throughput on a watch channel.

pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod session;
pub mod state;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use orchestrator::{
    Orchestrator, PendingCode, PendingInfo, RetryInfo, RetrySummary, SessionInfo, TaskStatus,
    WorkerStatus,
};
pub use progress::{Observer, ProgressAggregator, ProgressSnapshot, Throughput, format_duration};
pub use session::{Session, Stats};
pub use state::{Command, SessionStatus};
