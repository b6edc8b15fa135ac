//! Retry eligibility and backoff
//!
//! Delay for attempt `n` of a class is `min(base * multiplier^n, cap)`, plus
//! symmetric jitter of up to `jitter_factor` of that value, clamped back into
//! `[0.1s, cap]`. A server-supplied `Retry-After` raises the result to at least
//! that value.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use check_core::{CheckResult, Failure, FailureClass, Outcome};
use parking_lot::Mutex;
use rand::RngExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::RetryConfig;

/// No retry delay is ever shorter than this.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Statuses that describe the request itself, not the backend's health.
const NON_RETRYABLE_STATUSES: [u16; 4] = [400, 401, 403, 404];

pub fn is_retryable_status(status: u16) -> bool {
    !NON_RETRYABLE_STATUSES.contains(&status)
}

/// What the orchestrator should do with a check result.
#[derive(Debug, Clone)]
pub enum Disposition {
    /// The backend gave a definitive answer; finalize as-is.
    Success(CheckResult),
    /// The credential was rejected or none was available. Retry the code
    /// with a different credential; this never counts against the code.
    Reassign(CheckResult),
    /// Transient failure; retry per the class schedule if allowed.
    Retryable {
        result: CheckResult,
        class: FailureClass,
    },
    /// Failure that retrying cannot fix; finalize as an error.
    Fatal {
        result: CheckResult,
        class: FailureClass,
    },
}

/// Session retry counters for introspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    pub total_retries: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub by_class: BTreeMap<&'static str, u64>,
    /// Codes with at least one recorded attempt that are not yet finished.
    pub active_codes: usize,
    pub success_rate: f64,
    pub breaker: Option<BreakerSnapshot>,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    by_class: BTreeMap<&'static str, u64>,
}

pub struct RetryPolicy {
    config: RetryConfig,
    breaker: CircuitBreaker,
    attempts: Mutex<HashMap<String, u32>>,
    counters: Mutex<Counters>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.breaker.threshold,
            Duration::from_secs(config.breaker.timeout_secs),
        );
        Self {
            config,
            breaker,
            attempts: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Turn a check result into a decision the orchestrator can branch on.
    pub fn assess(&self, result: CheckResult) -> Disposition {
        match result.outcome {
            Outcome::CredentialError => Disposition::Reassign(result),
            Outcome::RateLimited => Disposition::Retryable {
                result,
                class: FailureClass::RateLimited,
            },
            Outcome::Error => match result.failure.as_ref() {
                None => Disposition::Success(result),
                Some(failure) => {
                    let class = failure.class;
                    if failure.status.is_some_and(|s| !is_retryable_status(s)) {
                        Disposition::Fatal { result, class }
                    } else {
                        Disposition::Retryable { result, class }
                    }
                }
            },
            _ => Disposition::Success(result),
        }
    }

    /// Attempts recorded so far for `code`.
    pub fn attempts(&self, code: &str) -> u32 {
        self.attempts.lock().get(code).copied().unwrap_or(0)
    }

    /// Whether `code` may be retried after `failure`.
    ///
    /// Always false while the breaker is open, for request-level statuses
    /// (400/401/403/404), and once the class attempt ceiling is reached.
    pub fn should_retry(&self, code: &str, failure: &Failure) -> bool {
        if self.breaker.is_open() {
            debug!(code, "circuit breaker open, not retrying");
            return false;
        }
        if failure.status.is_some_and(|s| !is_retryable_status(s)) {
            return false;
        }
        let ceiling = self.config.for_class(failure.class).max_attempts;
        let attempts = self.attempts(code);
        if attempts >= ceiling {
            debug!(code, attempts, ceiling, class = %failure.class, "retry ceiling reached");
            return false;
        }
        true
    }

    /// Jitter-free delay for `attempt` (0-based) of `class`, before the
    /// floor and `Retry-After` are applied.
    pub fn backoff(&self, class: FailureClass, attempt: u32) -> Duration {
        let policy = self.config.for_class(class);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = policy.base_delay_secs * policy.multiplier.powi(exponent);
        Duration::from_secs_f64(raw.min(policy.max_delay_secs))
    }

    /// Delay before the next attempt of `code`.
    pub fn delay_for(&self, code: &str, failure: &Failure) -> Duration {
        let cap = self.config.for_class(failure.class).max_delay();
        let base = self.backoff(failure.class, self.attempts(code));

        let jitter_span = base.as_secs_f64() * self.config.jitter_factor;
        let jittered = if jitter_span > 0.0 {
            base.as_secs_f64() + rand::rng().random_range(-jitter_span..=jitter_span)
        } else {
            base.as_secs_f64()
        };
        let delay = Duration::from_secs_f64(jittered.max(0.0)).min(cap).max(MIN_DELAY);

        match failure.retry_after {
            Some(after) if after > delay => after,
            _ => delay,
        }
    }

    /// Note that a retry of `code` is about to happen.
    pub fn record_attempt(&self, code: &str, class: FailureClass, delay: Duration) {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(code.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        {
            let mut counters = self.counters.lock();
            counters.total += 1;
            *counters.by_class.entry(class.label()).or_insert(0) += 1;
        }
        metrics::counter!("checker_retries_total", "class" => class.label()).increment(1);
        info!(
            code,
            attempt,
            class = %class,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
    }

    /// The backend answered. Walks the breaker back and closes out any retry
    /// sequence for `code` as successful.
    pub fn record_success(&self, code: &str) {
        self.breaker.record_success();
        if let Some(n) = self.attempts.lock().remove(code) {
            self.counters.lock().successful += 1;
            info!(code, attempts = n, "retry succeeded");
        }
    }

    /// The backend failed. Returns true if this tripped the breaker.
    pub fn record_failure(&self) -> bool {
        self.breaker.record_failure()
    }

    /// `code` is being finalized without a successful answer.
    pub fn record_exhausted(&self, code: &str) {
        if let Some(n) = self.attempts.lock().remove(code) {
            self.counters.lock().failed += 1;
            warn!(code, attempts = n, "all retry attempts failed");
        }
    }

    /// Forget `code` without touching counters.
    pub fn finish(&self, code: &str) {
        self.attempts.lock().remove(code);
    }

    /// Clear per-code attempts and counters for a new session. The breaker
    /// keeps its state; see `breaker().reset()`.
    pub fn reset_session(&self) {
        self.attempts.lock().clear();
        *self.counters.lock() = Counters::default();
    }

    pub fn stats(&self) -> RetryStats {
        let active_codes = self.attempts.lock().len();
        let counters = self.counters.lock();
        let finished = counters.successful + counters.failed;
        RetryStats {
            total_retries: counters.total,
            successful_retries: counters.successful,
            failed_retries: counters.failed,
            by_class: counters.by_class.clone(),
            active_codes,
            success_rate: if finished == 0 {
                0.0
            } else {
                counters.successful as f64 / finished as f64
            },
            breaker: Some(self.breaker.snapshot()),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
