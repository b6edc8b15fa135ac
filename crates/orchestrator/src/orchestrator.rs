//! Validation orchestrator
//!
//! Owns one session at a time. `start` fills a FIFO work queue and spawns
//! `min(max_workers, codes)` worker tasks plus one collector:
//!
//! - Workers pass the pause gate, pop a code, check it, and either requeue it
//!   (after the retry delay) or hand the final result to the collector.
//! - The collector removes each code from the pending set exactly once and
//!   declares the session `Completed` the moment that set is empty. A code
//!   being retried is pending but not queued, so "queue empty" is not
//!   completion.
//!
//! Every per-session structure lives in a `Run`. Tasks detached by a timed-out
//! stop keep their own `Run` and can never touch the next session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use check_core::{CheckResult, Checker, Failure, FailureClass, Outcome};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use retry_policy::{BreakerSnapshot, Disposition, RetryPolicy, RetryStats};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::progress::{Observer, Throughput};
use crate::queue::WorkQueue;
use crate::session::{Session, Stats};
use crate::state::{Action, Command, SessionStatus, handle_command};

/// Longest a worker blocks on an empty queue before rechecking the pending set.
const QUEUE_WAIT: Duration = Duration::from_secs(1);
/// Back-off while the queue is empty but other workers hold retrying codes.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// State scoped to one session.
struct Run {
    session_id: Uuid,
    queue: WorkQueue,
    pending: Mutex<HashSet<String>>,
    retries: Mutex<HashMap<String, RetryCount>>,
    stop: watch::Sender<bool>,
    /// `true` while paused.
    pause: watch::Sender<bool>,
    results: mpsc::UnboundedSender<CheckResult>,
}

/// Requeues of one code in the current session.
#[derive(Debug, Clone, Copy, Default)]
struct RetryCount {
    /// `RateLimited` and `CredentialError` requeues, capped by `max_retries`.
    requeues: u32,
    /// Transient-failure retries, capped by the retry policy's class ceiling.
    transient: u32,
}

impl RetryCount {
    fn total(self) -> u32 {
        self.requeues + self.transient
    }
}

impl Run {
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Remove `code` from the pending set. Returns the remaining count, or
    /// `None` if the code was not pending.
    fn finalize(&self, code: &str) -> Option<usize> {
        let mut pending = self.pending.lock();
        pending.remove(code).then(|| pending.len())
    }

    /// Count one more requeue for `code` unless it already reached `max`.
    fn bump_retry(&self, code: &str, max: u32) -> Option<u32> {
        let mut retries = self.retries.lock();
        let count = retries.entry(code.to_string()).or_default();
        if count.requeues >= max {
            return None;
        }
        count.requeues += 1;
        Some(count.requeues)
    }

    fn note_transient_retry(&self, code: &str) {
        self.retries
            .lock()
            .entry(code.to_string())
            .or_default()
            .transient += 1;
    }

    fn forget_retries(&self, code: &str) {
        self.retries.lock().remove(code);
    }

    /// Total requeues per code, every kind counted once.
    fn retry_counts(&self) -> HashMap<String, u32> {
        self.retries
            .lock()
            .iter()
            .map(|(code, count)| (code.clone(), count.total()))
            .collect()
    }
}

struct Task {
    name: String,
    handle: JoinHandle<()>,
}

enum Settled {
    Final(CheckResult),
    Requeue(Duration),
}

struct Inner {
    checker: Arc<dyn Checker>,
    policy: Arc<RetryPolicy>,
    config: EngineConfig,
    session: Mutex<Session>,
    run: Mutex<Option<Arc<Run>>>,
    tasks: Mutex<Vec<Task>>,
    throughput: Mutex<Throughput>,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    status: watch::Sender<SessionStatus>,
}

/// Retry backlog of the current session.
#[derive(Debug, Clone, Serialize)]
pub struct RetryInfo {
    pub codes_being_retried: usize,
    pub total_retries: u64,
    pub max_retries_per_code: u32,
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub progress_percentage: f64,
    pub codes_per_second: f64,
    pub statistics: Stats,
    pub pending_codes: usize,
    pub retry_info: RetryInfo,
    pub credentials: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCode {
    pub code: String,
    pub retry_count: u32,
    pub max_retries: u32,
    /// `pending` until the first retry, then `retrying`.
    pub state: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub total_pending: usize,
    pub codes_being_retried: usize,
    pub codes_awaiting_first_attempt: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PendingInfo {
    pub pending_codes: Vec<PendingCode>,
    pub retry_summary: RetrySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub stop_requested: bool,
    pub paused: bool,
    pub tasks: Vec<TaskStatus>,
}

/// Drives check sessions. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        checker: Arc<dyn Checker>,
        policy: Arc<RetryPolicy>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (status, _rx) = watch::channel(SessionStatus::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                checker,
                policy,
                config,
                session: Mutex::new(Session::default()),
                run: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                throughput: Mutex::new(Throughput::new()),
                observers: RwLock::new(Vec::new()),
                status,
            }),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.inner.observers.write().push(observer);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        &self.inner.policy
    }

    /// Start a session over `codes`. Blank entries are dropped and
    /// duplicates collapsed, keeping first-seen order. Returns the number of
    /// workers spawned; an empty list completes immediately with none.
    pub async fn start(&self, codes: Vec<String>) -> Result<usize> {
        let inner = &self.inner;
        let credentials = credential_total(&inner.checker.health().await);
        let codes = unique_codes(codes);
        let total = codes.len();
        let workers = inner.config.max_workers.min(total);

        let (run, results) = {
            let mut session = inner.session.lock();
            let (next, action) = handle_command(session.status, Command::Start);
            if action == Action::Reject {
                return Err(Error::InvalidTransition {
                    from: session.status,
                    command: Command::Start,
                });
            }

            // Anything left from a finished session is told to exit.
            if let Some(previous) = inner.run.lock().take() {
                previous.stop.send_replace(true);
            }
            inner.tasks.lock().clear();

            *session = Session::new(codes.clone(), credentials);
            inner.set_status(&mut session, next);

            let (stop, _) = watch::channel(false);
            let (pause, _) = watch::channel(false);
            let (tx, rx) = mpsc::unbounded_channel();
            let run = Arc::new(Run {
                session_id: session.id,
                pending: Mutex::new(codes.iter().cloned().collect()),
                retries: Mutex::new(HashMap::new()),
                queue: codes.into_iter().collect(),
                stop,
                pause,
                results: tx,
            });
            *inner.run.lock() = Some(run.clone());
            (run, rx)
        };

        inner.policy.reset_session();
        inner.throughput.lock().reset();
        metrics::set_pending(total);

        for observer in inner.observers() {
            observer.on_start(total);
        }

        if total == 0 {
            inner.complete(&run);
            return Ok(0);
        }

        let message = format!("Started checking {total} codes with {workers} workers");
        info!(total, workers, credentials, session_id = %run.session_id, "session started");
        inner.announce(SessionStatus::Running, &message);

        let mut tasks = Vec::with_capacity(workers + 1);
        for worker in 0..workers {
            tasks.push(Task {
                name: format!("worker-{worker}"),
                handle: tokio::spawn(work(inner.clone(), run.clone(), worker)),
            });
        }
        tasks.push(Task {
            name: "collector".into(),
            handle: tokio::spawn(collect(inner.clone(), run, results)),
        });
        inner.tasks.lock().extend(tasks);

        Ok(workers)
    }

    /// Close the pause gate. Workers finish their in-flight check and wait.
    pub fn pause(&self) -> Result<()> {
        self.toggle(Command::Pause, true, "Checking paused")
    }

    /// Open the pause gate for every waiting worker at once.
    pub fn resume(&self) -> Result<()> {
        self.toggle(Command::Resume, false, "Checking resumed")
    }

    fn toggle(&self, command: Command, paused: bool, message: &str) -> Result<()> {
        let inner = &self.inner;
        let next = {
            let mut session = inner.session.lock();
            let (next, action) = handle_command(session.status, command);
            if action == Action::Reject {
                return Err(Error::InvalidTransition {
                    from: session.status,
                    command,
                });
            }
            inner.set_status(&mut session, next);
            if let Some(run) = inner.run.lock().as_ref() {
                run.pause.send_replace(paused);
            }
            next
        };
        info!(status = %next, "{message}");
        inner.announce(next, message);
        Ok(())
    }

    /// Stop the session. Signals every task, waits for each within the
    /// join timeouts, then releases the pending set, retry counters and
    /// queue whether or not every task exited. Returns the final counts.
    pub async fn stop(&self) -> Result<Stats> {
        let inner = &self.inner;
        let run = {
            let mut session = inner.session.lock();
            let (next, action) = handle_command(session.status, Command::Stop);
            if action == Action::Reject {
                return Err(Error::InvalidTransition {
                    from: session.status,
                    command: Command::Stop,
                });
            }
            inner.set_status(&mut session, next);
            inner.run.lock().clone()
        };

        info!("stopping session");
        if let Some(run) = &run {
            run.stop.send_replace(true);
            // Paused workers must get past the gate to see the stop.
            run.pause.send_replace(false);
        }
        inner.join_tasks().await;
        if let Some(run) = &run {
            inner.release(run);
        }

        let stats = {
            let mut session = inner.session.lock();
            session.finish();
            session.stats()
        };
        let message = format!("Stopped. Checked {}/{} codes", stats.checked, stats.total);
        info!(checked = stats.checked, total = stats.total, "session stopped");
        inner.announce(SessionStatus::Stopped, &message);
        Ok(stats)
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.session.lock().status
    }

    pub fn is_checking(&self) -> bool {
        self.status().is_active()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until the current session is `Completed` or `Stopped`. Never
    /// returns while idle.
    pub async fn wait(&self) -> SessionStatus {
        let mut rx = self.inner.status.subscribe();
        let finished = rx.wait_for(|s| s.is_finished()).await.map(|s| *s);
        finished.unwrap_or_else(|_| self.status())
    }

    pub fn stats(&self) -> Stats {
        self.inner.session.lock().stats()
    }

    pub fn results(&self) -> Vec<CheckResult> {
        self.inner.session.lock().results().to_vec()
    }

    pub fn results_by_outcome(&self, outcome: Outcome) -> Vec<CheckResult> {
        self.inner.session.lock().results_by_outcome(outcome)
    }

    pub fn session_info(&self) -> SessionInfo {
        let inner = &self.inner;
        let (session_id, status, stats, credentials, started_at, ended_at, elapsed) = {
            let s = inner.session.lock();
            (
                s.id,
                s.status,
                s.stats(),
                s.credentials,
                s.started_at,
                s.ended_at,
                s.elapsed(),
            )
        };
        let run = inner.run.lock().clone();
        let pending = run.as_ref().map_or(0, |r| r.pending_count());
        let counts = run.as_ref().map(|r| r.retry_counts()).unwrap_or_default();
        let rate = inner.throughput.lock().rate();

        let done = if status.is_active() {
            stats.total.saturating_sub(pending)
        } else {
            stats.checked
        };
        let progress_percentage = if stats.total == 0 {
            0.0
        } else {
            done as f64 / stats.total as f64 * 100.0
        };

        SessionInfo {
            session_id,
            status,
            progress_percentage,
            codes_per_second: rate,
            statistics: stats,
            pending_codes: pending,
            retry_info: RetryInfo {
                codes_being_retried: counts.values().filter(|n| **n > 0).count(),
                total_retries: counts.values().map(|n| u64::from(*n)).sum(),
                max_retries_per_code: inner.config.max_retries,
            },
            credentials,
            started_at,
            ended_at,
            elapsed_secs: elapsed.as_secs_f64(),
            estimated_remaining_secs: (status == SessionStatus::Running
                && rate > 0.0
                && pending > 0)
                .then(|| pending as f64 / rate),
        }
    }

    /// Every pending code with its retry count, sorted by code.
    pub fn pending_info(&self) -> PendingInfo {
        let inner = &self.inner;
        let Some(run) = inner.run.lock().clone() else {
            return PendingInfo::default();
        };
        let mut pending: Vec<String> = run.pending.lock().iter().cloned().collect();
        pending.sort();
        let counts = run.retry_counts();
        let max_retries = inner.config.max_retries;

        let pending_codes: Vec<PendingCode> = pending
            .into_iter()
            .map(|code| {
                let retry_count = counts.get(&code).copied().unwrap_or(0);
                PendingCode {
                    state: if retry_count > 0 { "retrying" } else { "pending" },
                    code,
                    retry_count,
                    max_retries,
                }
            })
            .collect();
        let codes_being_retried = pending_codes.iter().filter(|p| p.retry_count > 0).count();

        PendingInfo {
            retry_summary: RetrySummary {
                total_pending: pending_codes.len(),
                codes_being_retried,
                codes_awaiting_first_attempt: pending_codes.len() - codes_being_retried,
            },
            pending_codes,
        }
    }

    pub fn worker_status(&self) -> WorkerStatus {
        let inner = &self.inner;
        let (stop_requested, paused) = inner
            .run
            .lock()
            .as_ref()
            .map_or((false, false), |r| (*r.stop.borrow(), *r.pause.borrow()));
        let tasks: Vec<TaskStatus> = inner
            .tasks
            .lock()
            .iter()
            .map(|t| TaskStatus {
                name: t.name.clone(),
                alive: !t.handle.is_finished(),
            })
            .collect();
        WorkerStatus {
            total_tasks: tasks.len(),
            active_tasks: tasks.iter().filter(|t| t.alive).count(),
            stop_requested,
            paused,
            tasks,
        }
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.inner.policy.stats()
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.inner.policy.breaker().snapshot()
    }

    pub fn reset_breaker(&self) {
        self.inner.policy.breaker().reset();
    }

    /// Credential-pool health as reported by the checker.
    pub async fn credential_health(&self) -> serde_json::Value {
        self.inner.checker.health().await
    }
}

impl Inner {
    fn observers(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.read().clone()
    }

    fn set_status(&self, session: &mut Session, status: SessionStatus) {
        session.status = status;
        self.status.send_replace(status);
    }

    fn announce(&self, status: SessionStatus, message: &str) {
        for observer in self.observers() {
            observer.on_status(status, message);
        }
    }

    /// Decide what happens to `code` after a check.
    fn settle(&self, run: &Run, code: &str, result: CheckResult) -> Settled {
        let max = self.config.max_retries;
        match self.policy.assess(result) {
            Disposition::Success(result) => {
                self.policy.record_success(code);
                Settled::Final(result)
            }

            // A different credential may already be free; no backoff unless
            // the pool said when one frees up.
            Disposition::Reassign(result) => match run.bump_retry(code, max) {
                Some(attempt) => {
                    info!(code, attempt, max_retries = max, detail = %result.detail, "credential unavailable, requeueing");
                    Settled::Requeue(result.retry_after().unwrap_or(Duration::ZERO))
                }
                None => {
                    warn!(code, max_retries = max, "no usable credential, skipping code");
                    self.policy.record_exhausted(code);
                    let detail = format!(
                        "skipped after {max} attempts without a usable credential: {}",
                        result.detail
                    );
                    Settled::Final(result.downgrade(Outcome::Skipped, detail))
                }
            },

            Disposition::Retryable {
                result,
                class: FailureClass::RateLimited,
            } => match run.bump_retry(code, max) {
                Some(attempt) => {
                    let failure = result.failure.clone().unwrap_or_else(|| {
                        Failure::new(FailureClass::RateLimited, result.detail.clone())
                    });
                    let delay = self.policy.delay_for(code, &failure);
                    self.policy
                        .record_attempt(code, FailureClass::RateLimited, delay);
                    debug!(code, attempt, max_retries = max, "rate limited, requeueing");
                    Settled::Requeue(delay)
                }
                None => {
                    info!(code, max_retries = max, "rate limited on every attempt, skipping code");
                    self.policy.record_exhausted(code);
                    let detail = format!("skipped after {max} rate-limited attempts");
                    Settled::Final(result.downgrade(Outcome::Skipped, detail))
                }
            },

            Disposition::Retryable { result, class } => {
                self.policy.record_failure();
                let Some(failure) = result.failure.clone() else {
                    return Settled::Final(result);
                };
                if self.policy.should_retry(code, &failure) {
                    let delay = self.policy.delay_for(code, &failure);
                    self.policy.record_attempt(code, class, delay);
                    run.note_transient_retry(code);
                    return Settled::Requeue(delay);
                }
                let attempts = self.policy.attempts(code);
                self.policy.record_exhausted(code);
                if attempts == 0 {
                    Settled::Final(result)
                } else {
                    let detail = format!("{} (gave up after {attempts} retries)", result.detail);
                    Settled::Final(result.downgrade(Outcome::Error, detail))
                }
            }

            Disposition::Fatal { result, class } => {
                debug!(code, class = %class, "failure is not retryable");
                self.policy.finish(code);
                Settled::Final(result)
            }
        }
    }

    /// While the breaker is open, finalize `code` as `Error` without a request.
    fn short_circuit(&self, code: &str) -> Option<CheckResult> {
        let breaker = self.policy.breaker().snapshot();
        if !breaker.open {
            return None;
        }
        self.policy.finish(code);
        let detail = match breaker.reopens_in_secs {
            Some(secs) => format!("circuit breaker open, backend unavailable (closes in {secs}s)"),
            None => "circuit breaker open, backend unavailable".to_string(),
        };
        debug!(code, "circuit breaker open, not checking");
        Some(CheckResult::new(code, Outcome::Error, detail))
    }

    fn record(&self, run: &Run, result: CheckResult, remaining: usize) {
        {
            let mut session = self.session.lock();
            if session.id != run.session_id {
                return;
            }
            session.record(result.clone());
        }
        self.throughput.lock().record();
        metrics::record_result(result.outcome);
        metrics::set_pending(remaining);
        debug!(code = %result.code, outcome = %result.outcome, remaining, "code finalized");
        for observer in self.observers() {
            observer.on_result(&result);
        }
    }

    fn complete(&self, run: &Run) {
        let message = {
            let mut session = self.session.lock();
            if session.id != run.session_id {
                return;
            }
            let (next, action) = handle_command(session.status, Command::Complete);
            if action == Action::Reject {
                return;
            }
            self.set_status(&mut session, next);
            session.finish();
            let stats = session.stats();
            format!(
                "Completed! Checked {}/{} codes in {:.1}s. Valid: {}, Used: {}, Invalid: {}, Expired: {}, Errors: {}, Skipped: {}",
                stats.checked,
                stats.total,
                session.elapsed().as_secs_f64(),
                stats.valid,
                stats.used,
                stats.invalid,
                stats.expired,
                stats.error,
                stats.skipped,
            )
        };
        run.stop.send_replace(true);
        info!(session_id = %run.session_id, "{message}");
        self.announce(SessionStatus::Completed, &message);
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        let per_task = self.config.worker_join_timeout();
        let deadline = Instant::now() + self.config.stop_timeout();
        info!(tasks = tasks.len(), "waiting for tasks to finish");

        let mut detached = Vec::new();
        for task in tasks {
            let wait = per_task.min(deadline.saturating_duration_since(Instant::now()));
            match tokio::time::timeout(wait, task.handle).await {
                Ok(Ok(())) => debug!(task = %task.name, "task finished"),
                Ok(Err(e)) => warn!(task = %task.name, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(task = %task.name, timeout_ms = wait.as_millis() as u64, "task did not finish in time, detaching");
                    detached.push(task.name);
                }
            }
        }
        if detached.is_empty() {
            info!("all tasks finished");
        } else {
            error!(tasks = ?detached, "tasks still running after stop");
        }
    }

    fn release(&self, run: &Run) {
        let pending: Vec<String> = run.pending.lock().drain().collect();
        for code in &pending {
            self.policy.finish(code);
        }
        let counters = {
            let mut retries = run.retries.lock();
            let n = retries.len();
            retries.clear();
            n
        };
        let queued = run.queue.clear();
        metrics::set_pending(0);
        info!(
            pending = pending.len(),
            retry_counters = counters,
            queued,
            "released session state"
        );
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn unpaused(pause: &mut watch::Receiver<bool>) {
    let _ = pause.wait_for(|p| !*p).await;
}

/// Sleep for `delay`. Returns true if the stop signal fired first.
async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stopped(stop) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn work(inner: Arc<Inner>, run: Arc<Run>, worker: usize) {
    let mut stop = run.stop.subscribe();
    let mut pause = run.pause.subscribe();
    debug!(worker, "worker started");

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = unpaused(&mut pause) => {}
        }

        let next = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            code = run.queue.pop(QUEUE_WAIT) => code,
        };
        let Some(code) = next else {
            // Other workers may still requeue codes they are retrying.
            if run.pending_count() == 0 || sleep_or_stop(&mut stop, IDLE_WAIT).await {
                break;
            }
            continue;
        };

        if let Some(result) = inner.short_circuit(&code) {
            run.forget_retries(&code);
            if run.results.send(result).is_err() {
                break;
            }
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            result = inner.checker.check(&code) => result,
        };

        match inner.settle(&run, &code, result) {
            Settled::Final(result) => {
                run.forget_retries(&code);
                if run.results.send(result).is_err() {
                    break;
                }
            }
            Settled::Requeue(delay) => {
                if !delay.is_zero() {
                    debug!(worker, code, delay_ms = delay.as_millis() as u64, "waiting before requeue");
                    if sleep_or_stop(&mut stop, delay).await {
                        break;
                    }
                }
                run.queue.push(code);
            }
        }
    }
    debug!(worker, "worker exiting");
}

async fn collect(
    inner: Arc<Inner>,
    run: Arc<Run>,
    mut results: mpsc::UnboundedReceiver<CheckResult>,
) {
    let mut stop = run.stop.subscribe();
    loop {
        let result = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            next = results.recv() => match next {
                Some(result) => result,
                None => break,
            },
        };
        let Some(remaining) = run.finalize(&result.code) else {
            warn!(code = %result.code, "result for a code that is not pending, dropping");
            continue;
        };
        inner.record(&run, result, remaining);
        if remaining == 0 {
            inner.complete(&run);
            break;
        }
    }
    debug!("collector exiting");
}

fn unique_codes(codes: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(codes.len());
    codes
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && seen.insert(c.clone()))
        .collect()
}

fn credential_total(health: &serde_json::Value) -> usize {
    health
        .get("total")
        .and_then(serde_json::Value::as_u64)
        .map_or(0, |n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressAggregator;
    use retry_policy::{BreakerConfig, RetryConfig};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Checker that replays scripted results per code, then answers `Valid`.
    #[derive(Default)]
    struct Scripted {
        scripts: Mutex<HashMap<String, VecDeque<CheckResult>>>,
        calls: Mutex<HashMap<String, u32>>,
        in_flight: Mutex<HashSet<String>>,
        overlap: AtomicBool,
        latency: Duration,
    }

    impl Scripted {
        fn new() -> Self {
            Self::default()
        }

        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        fn script(self, code: &str, results: Vec<CheckResult>) -> Self {
            self.scripts.lock().insert(code.to_string(), results.into());
            self
        }

        fn calls(&self, code: &str) -> u32 {
            self.calls.lock().get(code).copied().unwrap_or(0)
        }
    }

    impl Checker for Scripted {
        fn check<'a>(
            &'a self,
            code: &'a str,
        ) -> Pin<Box<dyn Future<Output = CheckResult> + Send + 'a>> {
            Box::pin(async move {
                if !self.in_flight.lock().insert(code.to_string()) {
                    self.overlap.store(true, Ordering::SeqCst);
                }
                *self.calls.lock().entry(code.to_string()).or_insert(0) += 1;
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                let next = self.scripts.lock().get_mut(code).and_then(VecDeque::pop_front);
                self.in_flight.lock().remove(code);
                next.unwrap_or_else(|| CheckResult::new(code, Outcome::Valid, "active"))
            })
        }

        fn health(&self) -> Pin<Box<dyn Future<Output = serde_json::Value> + Send + '_>> {
            Box::pin(async { serde_json::json!({"status": "healthy", "total": 2}) })
        }
    }

    fn codes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("CODE-{i:02}-AAAAA-BBBBB")).collect()
    }

    fn engine(checker: Arc<Scripted>, max_workers: usize) -> Orchestrator {
        engine_with(checker, max_workers, RetryConfig::default())
    }

    fn engine_with(checker: Arc<Scripted>, max_workers: usize, retry: RetryConfig) -> Orchestrator {
        Orchestrator::new(
            checker,
            Arc::new(RetryPolicy::new(retry)),
            EngineConfig {
                max_workers,
                ..EngineConfig::default()
            },
        )
        .unwrap()
    }

    fn rate_limited(code: &str) -> CheckResult {
        CheckResult::new(code, Outcome::RateLimited, "rate limited").with_failure(
            Failure::http(429, "too many requests").with_retry_after(Some(Duration::from_secs(10))),
        )
    }

    fn credential_error(code: &str) -> CheckResult {
        CheckResult::new(code, Outcome::CredentialError, "credential rejected")
    }

    fn timed_out(code: &str) -> CheckResult {
        CheckResult::new(code, Outcome::Error, "request timed out")
            .with_failure(Failure::new(FailureClass::Timeout, "request timed out"))
    }

    #[tokio::test(start_paused = true)]
    async fn all_valid_session_completes() {
        let checker = Arc::new(Scripted::new());
        let engine = engine(checker.clone(), 2);

        assert_eq!(engine.start(codes(5)).await.unwrap(), 2);
        assert_eq!(engine.wait().await, SessionStatus::Completed);

        let stats = engine.stats();
        assert_eq!(stats.checked, 5);
        assert_eq!(stats.valid, 5);
        assert_eq!(stats.remaining, 0);
        let info = engine.session_info();
        assert_eq!(info.pending_codes, 0);
        assert!((info.progress_percentage - 100.0).abs() < 1e-9);
        assert_eq!(info.credentials, 2);
        assert!(info.ended_at.is_some());
        assert!(!checker.overlap.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn workers_capped_by_code_count() {
        let engine = engine(Arc::new(Scripted::new()), 5);
        assert_eq!(engine.start(codes(3)).await.unwrap(), 3);
        engine.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_completes_immediately() {
        let engine = engine(Arc::new(Scripted::new()), 5);
        assert_eq!(engine.start(Vec::new()).await.unwrap(), 0);
        assert_eq!(engine.status(), SessionStatus::Completed);
        assert_eq!(engine.worker_status().total_tasks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_codes_finalize_once() {
        let checker = Arc::new(Scripted::new());
        let engine = engine(checker.clone(), 3);
        let input = vec!["DUP-AAAAA-BBBBB-CCCCC".to_string(), " DUP-AAAAA-BBBBB-CCCCC ".into(), "".into()];
        engine.start(input).await.unwrap();
        engine.wait().await;
        assert_eq!(engine.stats().total, 1);
        assert_eq!(engine.results().len(), 1);
        assert_eq!(checker.calls("DUP-AAAAA-BBBBB-CCCCC"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_code_waits_retry_after_then_succeeds() {
        let code = "LIMIT-AAAAA-BBBBB-CCCCC";
        let checker = Arc::new(Scripted::new().script(code, vec![rate_limited(code)]));
        let engine = engine(checker.clone(), 1);

        engine.start(vec![code.into()]).await.unwrap();
        assert_eq!(engine.wait().await, SessionStatus::Completed);

        assert_eq!(checker.calls(code), 2);
        assert_eq!(engine.results()[0].outcome, Outcome::Valid);
        assert!(engine.session_info().elapsed_secs >= 10.0);
        let retries = engine.retry_stats();
        assert_eq!(retries.total_retries, 1);
        assert_eq!(retries.successful_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limit_is_skipped_not_error() {
        let code = "LIMIT-AAAAA-BBBBB-CCCCC";
        let checker = Arc::new(Scripted::new().script(code, vec![rate_limited(code); 10]));
        let engine = engine(checker.clone(), 1);

        engine.start(vec![code.into()]).await.unwrap();
        engine.wait().await;

        // One initial check plus max_retries requeues.
        assert_eq!(checker.calls(code), 4);
        let result = &engine.results()[0];
        assert_eq!(result.outcome, Outcome::Skipped);
        assert!(result.detail.contains("rate-limited"), "got: {}", result.detail);
        assert_eq!(engine.stats().skipped, 1);
        assert_eq!(engine.stats().error, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_errors_requeue_then_skip() {
        let code = "CREDS-AAAAA-BBBBB-CCCCC";
        let checker = Arc::new(Scripted::new().script(code, vec![credential_error(code); 10]));
        let engine = engine(checker.clone(), 2);

        engine.start(vec![code.into(), "OTHER-AAAAA-BBBBB-CCCCC".into()]).await.unwrap();
        engine.wait().await;

        assert_eq!(checker.calls(code), 4);
        let skipped = engine.results_by_outcome(Outcome::Skipped);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].code, code);
        assert_eq!(engine.results_by_outcome(Outcome::Valid).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_error_recovers_with_next_credential() {
        let code = "CREDS-AAAAA-BBBBB-CCCCC";
        let checker = Arc::new(Scripted::new().script(code, vec![credential_error(code)]));
        let engine = engine(checker.clone(), 1);

        engine.start(vec![code.into()]).await.unwrap();
        engine.wait().await;
        assert_eq!(checker.calls(code), 2);
        assert_eq!(engine.results()[0].outcome, Outcome::Valid);
        // Credential requeues never touch the backoff counters.
        assert_eq!(engine.retry_stats().total_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_requeue_waits_for_rate_limited_pool() {
        let code = "CREDS-AAAAA-BBBBB-CCCCC";
        let pool_busy = CheckResult::new(code, Outcome::CredentialError, "all tokens rate limited")
            .with_failure(
                Failure::new(FailureClass::RateLimited, "all tokens rate limited")
                    .with_retry_after(Some(Duration::from_secs(30))),
            );
        let checker = Arc::new(
            Scripted::new().script(code, vec![pool_busy, credential_error(code)]),
        );
        let engine = engine(checker.clone(), 1);

        engine.start(vec![code.into()]).await.unwrap();
        assert_eq!(engine.wait().await, SessionStatus::Completed);

        // Waits for the pool once, then requeues the plain credential error at once.
        assert_eq!(checker.calls(code), 3);
        let elapsed = engine.session_info().elapsed_secs;
        assert!((30.0..31.0).contains(&elapsed), "elapsed {elapsed}");
        assert_eq!(engine.results()[0].outcome, Outcome::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_into_error() {
        let code = "SLOWW-AAAAA-BBBBB-CCCCC";
        let checker = Arc::new(Scripted::new().script(code, vec![timed_out(code); 10]));
        let engine = engine(checker.clone(), 1);

        engine.start(vec![code.into()]).await.unwrap();
        engine.wait().await;

        // Timeouts use the general schedule: 3 retries after the first try.
        assert_eq!(checker.calls(code), 4);
        let result = &engine.results()[0];
        assert_eq!(result.outcome, Outcome::Error);
        assert!(result.detail.contains("gave up after 3 retries"), "got: {}", result.detail);
        assert_eq!(engine.retry_stats().failed_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_is_final_without_retry() {
        let code = "DENY-AAAAA-BBBBB-CCCCC";
        let forbidden = CheckResult::new(code, Outcome::Error, "access denied")
            .with_failure(Failure::http(403, "forbidden"));
        let checker = Arc::new(Scripted::new().script(code, vec![forbidden]));
        let engine = engine(checker.clone(), 1);

        engine.start(vec![code.into()]).await.unwrap();
        engine.wait().await;
        assert_eq!(checker.calls(code), 1);
        assert_eq!(engine.results()[0].outcome, Outcome::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_remaining_codes() {
        let code = "DOWN-AAAAA-BBBBB-CCCCC";
        let later = "LATER-AAAAA-BBBBB-CCCCC";
        let unavailable = CheckResult::new(code, Outcome::Error, "service unavailable")
            .with_failure(Failure::http(503, "service unavailable"));
        let checker = Arc::new(Scripted::new().script(code, vec![unavailable; 5]));
        let retry = RetryConfig {
            breaker: BreakerConfig {
                threshold: 1,
                timeout_secs: 300,
            },
            ..RetryConfig::default()
        };
        let engine = engine_with(checker.clone(), 1, retry);

        engine.start(vec![code.into(), later.into()]).await.unwrap();
        engine.wait().await;
        assert_eq!(checker.calls(code), 1);
        assert_eq!(checker.calls(later), 0);
        assert!(engine.breaker().open);

        let skipped = engine
            .results()
            .into_iter()
            .find(|r| r.code == later)
            .unwrap();
        assert_eq!(skipped.outcome, Outcome::Error);
        assert!(skipped.detail.contains("circuit breaker open"), "got: {}", skipped.detail);

        engine.reset_breaker();
        assert!(!engine.breaker().open);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_workers_until_resume() {
        let checker = Arc::new(Scripted::with_latency(Duration::from_secs(1)));
        let engine = engine(checker, 1);

        engine.start(codes(6)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        engine.pause().unwrap();
        assert_eq!(engine.status(), SessionStatus::Paused);
        assert!(engine.worker_status().paused);

        tokio::time::sleep(Duration::from_secs(30)).await;
        // The check in flight at pause time still lands.
        assert_eq!(engine.stats().checked, 2);

        engine.resume().unwrap();
        assert_eq!(engine.wait().await, SessionStatus::Completed);
        assert_eq!(engine.stats().checked, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_run_releases_everything() {
        let checker = Arc::new(Scripted::with_latency(Duration::from_secs(5)));
        let engine = engine(checker, 2);

        engine.start(codes(10)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let began = Instant::now();
        let stats = engine.stop().await.unwrap();
        assert!(began.elapsed() <= engine.config().stop_timeout());

        assert_eq!(engine.status(), SessionStatus::Stopped);
        assert_eq!(stats.checked, 0);
        assert_eq!(engine.pending_info().retry_summary.total_pending, 0);
        assert_eq!(engine.session_info().retry_info.total_retries, 0);
        assert_eq!(engine.worker_status().total_tasks, 0);
        assert_eq!(engine.wait().await, SessionStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_paused() {
        let engine = engine(Arc::new(Scripted::with_latency(Duration::from_secs(1))), 2);
        engine.start(codes(4)).await.unwrap();
        engine.pause().unwrap();
        engine.stop().await.unwrap();
        assert_eq!(engine.status(), SessionStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commands_are_rejected() {
        let engine = engine(Arc::new(Scripted::with_latency(Duration::from_secs(1))), 2);
        assert!(matches!(
            engine.pause(),
            Err(Error::InvalidTransition { from: SessionStatus::Idle, command: Command::Pause })
        ));
        assert!(engine.stop().await.is_err());

        engine.start(codes(2)).await.unwrap();
        assert!(matches!(
            engine.start(codes(2)).await,
            Err(Error::InvalidTransition { command: Command::Start, .. })
        ));
        assert!(engine.resume().is_err());
        engine.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pending_info_reports_retrying_codes() {
        let code = "LIMIT-AAAAA-BBBBB-CCCCC";
        let checker = Arc::new(Scripted::new().script(code, vec![rate_limited(code)]));
        let engine = engine(checker, 1);

        engine.start(vec![code.into()]).await.unwrap();
        // First check is immediate; the retry waits 10s.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let info = engine.pending_info();
        assert_eq!(info.retry_summary.total_pending, 1);
        assert_eq!(info.retry_summary.codes_being_retried, 1);
        assert_eq!(info.pending_codes[0].state, "retrying");
        assert_eq!(info.pending_codes[0].retry_count, 1);
        let retry_info = engine.session_info().retry_info;
        assert_eq!(retry_info.codes_being_retried, 1);
        assert_eq!(retry_info.total_retries, 1);

        engine.wait().await;
        assert_eq!(engine.pending_info().pending_codes, Vec::new());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_retries_counted_once_in_snapshots() {
        let code = "SLOWW-AAAAA-BBBBB-CCCCC";
        let checker = Arc::new(Scripted::new().script(code, vec![timed_out(code)]));
        let engine = engine(checker, 1);

        engine.start(vec![code.into()]).await.unwrap();
        // The general schedule waits at least 0.7s before the first retry.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let info = engine.pending_info();
        assert_eq!(info.pending_codes[0].retry_count, 1);
        assert_eq!(info.pending_codes[0].state, "retrying");
        assert_eq!(engine.session_info().retry_info.total_retries, 1);

        assert_eq!(engine.wait().await, SessionStatus::Completed);
        assert_eq!(engine.results()[0].outcome, Outcome::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_skip_after_rate_limit_clears_retry_state() {
        let code = "MIXED-AAAAA-BBBBB-CCCCC";
        let mut script = vec![rate_limited(code)];
        script.extend(vec![credential_error(code); 5]);
        let checker = Arc::new(Scripted::new().script(code, script));
        let engine = engine(checker.clone(), 1);

        engine.start(vec![code.into()]).await.unwrap();
        engine.wait().await;

        // One rate-limited try plus three credential requeues share the ceiling.
        assert_eq!(checker.calls(code), 4);
        assert_eq!(engine.results()[0].outcome, Outcome::Skipped);
        let stats = engine.retry_stats();
        assert_eq!(stats.active_codes, 0);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.failed_retries, 1);
        assert_eq!(engine.policy().attempts(code), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_results_and_summary() {
        let code = "LIMIT-AAAAA-BBBBB-CCCCC";
        let checker = Arc::new(Scripted::new().script(code, vec![rate_limited(code); 10]));
        let engine = engine(checker, 2);
        let progress = Arc::new(ProgressAggregator::new());
        engine.add_observer(progress.clone());

        let mut input = codes(3);
        input.push(code.into());
        engine.start(input).await.unwrap();
        engine.wait().await;

        let snap = progress.snapshot();
        assert_eq!(snap.status, SessionStatus::Completed);
        assert_eq!(snap.stats.checked, 4);
        assert_eq!(snap.stats.valid, 3);
        assert_eq!(snap.stats.skipped, 1);
        assert!(
            snap.message.starts_with("Completed! Checked 4/4 codes in"),
            "got: {}",
            snap.message
        );
        assert!(snap.message.ends_with("Valid: 3, Used: 0, Invalid: 0, Expired: 0, Errors: 0, Skipped: 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_completion_resets_session() {
        let checker = Arc::new(Scripted::new());
        let engine = engine(checker, 2);

        engine.start(codes(3)).await.unwrap();
        engine.wait().await;
        let first = engine.session_info().session_id;

        engine.start(codes(2)).await.unwrap();
        engine.wait().await;
        let info = engine.session_info();
        assert_ne!(info.session_id, first);
        assert_eq!(info.statistics.total, 2);
        assert_eq!(engine.results().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn many_retries_never_overlap_on_one_code() {
        let mut checker = Scripted::new();
        let input = codes(8);
        for code in &input {
            checker = checker.script(code, vec![credential_error(code), rate_limited(code)]);
        }
        let checker = Arc::new(checker);
        let engine = engine(checker.clone(), 4);

        engine.start(input.clone()).await.unwrap();
        engine.wait().await;
        assert!(!checker.overlap.load(Ordering::SeqCst));
        assert_eq!(engine.stats().valid, 8);
        for code in &input {
            assert_eq!(checker.calls(code), 3);
        }
    }

    #[test]
    fn zero_workers_rejected_at_construction() {
        let result = Orchestrator::new(
            Arc::new(Scripted::new()),
            Arc::new(RetryPolicy::default()),
            EngineConfig {
                max_workers: 0,
                ..EngineConfig::default()
            },
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
