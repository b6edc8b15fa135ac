//! Progress aggregation
//!
//! [`ProgressAggregator`] consumes finalized results through the
//! [`Observer`] hooks, keeps its own running counts and throughput, and
//! republishes a [`ProgressSnapshot`] on a watch channel after every change.
//! Subscribers always see the latest snapshot; intermediate ones may be
//! skipped.

use std::collections::VecDeque;
use std::time::Duration;

use check_core::CheckResult;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::session::Stats;
use crate::state::SessionStatus;

/// Re-measure throughput at least this often...
const SPEED_INTERVAL: Duration = Duration::from_secs(2);
/// ...or after this many finalized codes, whichever comes first.
const SPEED_BATCH: u32 = 5;
/// Measurements averaged into the reported rate.
const SPEED_WINDOW: usize = 10;

/// Receives session events from the orchestrator. Hooks run on the
/// collector task and must not block.
pub trait Observer: Send + Sync {
    fn on_start(&self, _total: usize) {}

    /// A code was finalized.
    fn on_result(&self, _result: &CheckResult) {}

    /// Status transition with a human-readable message.
    fn on_status(&self, _status: SessionStatus, _message: &str) {}
}

/// Smoothed codes-per-second estimate.
#[derive(Debug)]
pub struct Throughput {
    last: Instant,
    since_last: u32,
    history: VecDeque<f64>,
    rate: f64,
}

impl Default for Throughput {
    fn default() -> Self {
        Self {
            last: Instant::now(),
            since_last: 0,
            history: VecDeque::with_capacity(SPEED_WINDOW),
            rate: 0.0,
        }
    }
}

impl Throughput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Count one finalized code and return the current rate.
    pub fn record(&mut self) -> f64 {
        self.since_last += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        if elapsed >= SPEED_INTERVAL || self.since_last >= SPEED_BATCH {
            let secs = elapsed.as_secs_f64();
            if secs > 0.0 {
                if self.history.len() == SPEED_WINDOW {
                    self.history.pop_front();
                }
                self.history.push_back(f64::from(self.since_last) / secs);
                self.rate = self.history.iter().sum::<f64>() / self.history.len() as f64;
            }
            self.last = now;
            self.since_last = 0;
        }
        self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// Render seconds as `42s`, `3.5m` or `1.2h`.
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.0}s")
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub status: SessionStatus,
    pub message: String,
    pub stats: Stats,
    pub progress_percentage: f64,
    pub codes_per_second: f64,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_secs: Option<f64>,
    pub elapsed: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining: Option<String>,
}

#[derive(Debug, Default)]
struct ProgressState {
    status: SessionStatus,
    message: String,
    stats: Stats,
    started: Option<Instant>,
    throughput: Throughput,
}

impl ProgressState {
    fn snapshot(&self) -> ProgressSnapshot {
        let stats = self.stats;
        let elapsed_secs = self.started.map_or(0.0, |s| s.elapsed().as_secs_f64());
        let rate = self.throughput.rate();
        let estimated_remaining_secs = (self.status == SessionStatus::Running
            && rate > 0.0
            && stats.remaining > 0)
            .then(|| stats.remaining as f64 / rate);

        ProgressSnapshot {
            status: self.status,
            message: self.message.clone(),
            stats,
            progress_percentage: if stats.total == 0 {
                0.0
            } else {
                stats.checked as f64 / stats.total as f64 * 100.0
            },
            codes_per_second: rate,
            elapsed_secs,
            estimated_remaining_secs,
            elapsed: format_duration(elapsed_secs),
            estimated_remaining: estimated_remaining_secs.map(format_duration),
        }
    }
}

pub struct ProgressAggregator {
    state: Mutex<ProgressState>,
    tx: watch::Sender<ProgressSnapshot>,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressAggregator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self {
            state: Mutex::new(ProgressState::default()),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().snapshot()
    }

    fn publish(&self, state: &ProgressState) {
        self.tx.send_replace(state.snapshot());
    }
}

impl Observer for ProgressAggregator {
    fn on_start(&self, total: usize) {
        let mut state = self.state.lock();
        *state = ProgressState {
            status: SessionStatus::Running,
            stats: Stats::new(total),
            started: Some(Instant::now()),
            ..ProgressState::default()
        };
        self.publish(&state);
    }

    fn on_result(&self, result: &CheckResult) {
        let mut state = self.state.lock();
        state.stats.tally(result.outcome);
        state.throughput.record();
        self.publish(&state);
    }

    fn on_status(&self, status: SessionStatus, message: &str) {
        let mut state = self.state.lock();
        state.status = status;
        state.message = message.to_string();
        self.publish(&state);
    }
}
