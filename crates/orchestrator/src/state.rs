//! Session state machine
//!
//! Pure state machine: receives a control command, returns (new_status, action).
//! The orchestrator executes the side effects implied by each action.
//!
//! ```text
//! Idle ──start──▶ Running ◀──resume── Paused
//!                  │  └──────pause──────▲
//!                  ├──stop──▶ Stopped   (also from Paused)
//!                  └──complete──▶ Completed
//! Stopped / Completed ──start──▶ Running
//! ```

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl SessionStatus {
    pub fn label(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
        }
    }

    /// Running or paused: workers exist and the pending set is live.
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Paused)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Completed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Control commands. `Complete` is raised internally by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Stop,
    Complete,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
            Command::Complete => "complete",
        })
    }
}

/// Side effect the orchestrator performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Reset the session, fill the queue, spawn workers and the collector.
    Launch,
    /// Close the pause gate.
    Hold,
    /// Open the pause gate.
    Release,
    /// Raise the stop signal, join workers, release resources.
    Halt,
    /// Stamp the end time and announce the summary.
    Finish,
    /// Command not allowed in the current status; nothing changes.
    Reject,
}

/// Handle a control command. Pure function: no I/O.
pub fn handle_command(status: SessionStatus, command: Command) -> (SessionStatus, Action) {
    use SessionStatus::*;

    match (status, command) {
        (Idle | Stopped | Completed, Command::Start) => (Running, Action::Launch),
        (Running, Command::Pause) => (Paused, Action::Hold),
        (Paused, Command::Resume) => (Running, Action::Release),
        (Running | Paused, Command::Stop) => (Stopped, Action::Halt),
        (Running | Paused, Command::Complete) => (Completed, Action::Finish),
        (status, _) => (status, Action::Reject),
    }
}
