//! One check batch: its codes, timing, status and accumulated results

use std::time::Duration;

use check_core::{CheckResult, Outcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::state::SessionStatus;

/// Per-outcome counts over finalized results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: usize,
    pub checked: usize,
    pub valid: usize,
    pub used: usize,
    pub invalid: usize,
    pub expired: usize,
    pub error: usize,
    pub skipped: usize,
    pub remaining: usize,
}

impl Stats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            remaining: total,
            ..Self::default()
        }
    }

    /// Count one finalized outcome. Non-terminal outcomes are ignored.
    pub fn tally(&mut self, outcome: Outcome) {
        let slot = match outcome {
            Outcome::Valid => &mut self.valid,
            Outcome::Used => &mut self.used,
            Outcome::Invalid => &mut self.invalid,
            Outcome::Expired => &mut self.expired,
            Outcome::Error => &mut self.error,
            Outcome::Skipped => &mut self.skipped,
            Outcome::RateLimited | Outcome::CredentialError | Outcome::Pending => return,
        };
        *slot += 1;
        self.checked += 1;
        self.remaining = self.total.saturating_sub(self.checked);
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub codes: Vec<String>,
    /// Credentials configured when the session started.
    pub credentials: usize,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    ended: Option<Instant>,
    results: Vec<CheckResult>,
    stats: Stats,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            codes: Vec::new(),
            credentials: 0,
            status: SessionStatus::Idle,
            started_at: None,
            ended_at: None,
            started: None,
            ended: None,
            results: Vec::new(),
            stats: Stats::default(),
        }
    }
}

impl Session {
    pub fn new(codes: Vec<String>, credentials: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            stats: Stats::new(codes.len()),
            codes,
            credentials,
            status: SessionStatus::Running,
            started_at: Some(Utc::now()),
            started: Some(Instant::now()),
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: CheckResult) {
        self.stats.tally(result.outcome);
        self.results.push(result);
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
        self.ended = Some(Instant::now());
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    pub fn results_by_outcome(&self, outcome: Outcome) -> Vec<CheckResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == outcome)
            .cloned()
            .collect()
    }

    /// Time since start, frozen once the session has ended.
    pub fn elapsed(&self) -> Duration {
        match (self.started, self.ended) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(code: &str, outcome: Outcome) -> CheckResult {
        CheckResult::new(code, outcome, "test")
    }

    #[test]
    fn tally_counts_terminal_outcomes_only() {
        let mut stats = Stats::new(4);
        stats.tally(Outcome::Valid);
        stats.tally(Outcome::Skipped);
        stats.tally(Outcome::RateLimited);
        stats.tally(Outcome::CredentialError);
        assert_eq!(stats.checked, 2);
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.remaining, 2);
    }

    #[test]
    fn results_filter_by_outcome() {
        let mut session = Session::new(vec!["A".into(), "B".into(), "C".into()], 1);
        session.record(result("A", Outcome::Valid));
        session.record(result("B", Outcome::Used));
        session.record(result("C", Outcome::Valid));
        let valid: Vec<_> = session
            .results_by_outcome(Outcome::Valid)
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(valid, ["A", "C"]);
        assert_eq!(session.stats().remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_freezes_at_finish() {
        let mut session = Session::new(vec!["A".into()], 1);
        tokio::time::advance(Duration::from_secs(4)).await;
        session.finish();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(session.elapsed(), Duration::from_secs(4));
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn idle_session_is_empty() {
        let session = Session::default();
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.id.is_nil());
        assert_eq!(session.elapsed(), Duration::ZERO);
    }
}
