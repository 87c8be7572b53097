// src/lifecycle/state.rs

//! Shared state vocabulary for tasks and steps, plus the transition rules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DagflowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Unknown,
    Pending,
    Running,
    Paused,
    Stopped,
    Failed,
    Skipped,
}

impl State {
    /// Stopped, Failed and Skipped end an execution attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stopped | State::Failed | State::Skipped)
    }

    /// A new submission under the same name is only accepted from these.
    pub fn accepts_resubmit(self) -> bool {
        self == State::Unknown || self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "unknown",
            State::Pending => "pending",
            State::Running => "running",
            State::Paused => "paused",
            State::Stopped => "stopped",
            State::Failed => "failed",
            State::Skipped => "skipped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(State::Unknown),
            "pending" => Ok(State::Pending),
            "running" => Ok(State::Running),
            "paused" => Ok(State::Paused),
            "stopped" => Ok(State::Stopped),
            "failed" => Ok(State::Failed),
            "skipped" => Ok(State::Skipped),
            other => Err(format!("invalid state: {other}")),
        }
    }
}

/// Exit-code classes reported by executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecCode {
    Success,
    Failed,
    Skipped,
    Killed,
    Timeout,
    SystemErr,
}

impl ExecCode {
    pub const fn code(self) -> i64 {
        match self {
            ExecCode::Success => 0,
            ExecCode::Failed => -1,
            ExecCode::Skipped => -2,
            ExecCode::Killed => -997,
            ExecCode::Timeout => -998,
            ExecCode::SystemErr => -999,
        }
    }

    /// Classify a raw exit code. Positive codes are plain failures.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ExecCode::Success,
            -2 => ExecCode::Skipped,
            -997 => ExecCode::Killed,
            -998 => ExecCode::Timeout,
            -999 => ExecCode::SystemErr,
            _ => ExecCode::Failed,
        }
    }

    /// Terminal state reached by a unit finishing with this code.
    pub fn state(self) -> State {
        match self {
            ExecCode::Success => State::Stopped,
            ExecCode::Skipped => State::Skipped,
            _ => State::Failed,
        }
    }
}

/// Granularity a transition applies to. Pause rules differ between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Task,
    Step,
}

/// Events that move a task or step between states.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Picked up for execution.
    Dispatch,
    /// Execution finished with a raw exit code.
    Complete { code: i64, message: String },
    /// Disabled units finish without running.
    Skip,
    Pause,
    Resume,
    Kill,
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Transition::Dispatch => "dispatch",
            Transition::Complete { .. } => "complete",
            Transition::Skip => "skip",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Kill => "kill",
        }
    }
}

pub const MSG_PENDING: &str = "the task is waiting to be scheduled for execution";
pub const MSG_PAUSED: &str = "has been paused";
pub const MSG_RESUMED: &str = "has been resumed";
pub const MSG_KILLED: &str = "has been killed";
pub const MSG_TIMEOUT: &str = "forced termination by timeout";
pub const MSG_SKIPPED: &str = "disabled, skipped";
pub const MSG_SYSTEM_ERR: &str = "execution failed due to system error";

/// Persisted lifecycle fields shared by tasks and steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub state: State,
    pub old_state: State,
    pub code: i64,
    pub message: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Status {
    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            state: State::Pending,
            old_state: State::Pending,
            code: ExecCode::Success.code(),
            message: message.into(),
            start_time: None,
            end_time: None,
        }
    }

    /// Apply `transition` if the current state allows it.
    ///
    /// Returns `Ok(false)` for idempotent no-ops (pausing something already
    /// paused, resuming something not paused).
    pub fn apply(&mut self, entity: &str, scope: Scope, transition: &Transition) -> Result<bool> {
        let invalid = |from: State| DagflowError::InvalidTransition {
            entity: entity.to_string(),
            from,
            action: transition.action(),
        };
        let now = Utc::now();

        match transition {
            Transition::Dispatch => {
                if self.state != State::Pending {
                    return Err(invalid(self.state));
                }
                self.old_state = self.state;
                self.state = State::Running;
                self.message = "running".to_string();
                self.start_time = Some(now);
            }
            Transition::Complete { code, message } => {
                let allowed = match scope {
                    Scope::Task => matches!(self.state, State::Running | State::Paused),
                    Scope::Step => self.state == State::Running,
                };
                if !allowed {
                    return Err(invalid(self.state));
                }
                self.old_state = self.state;
                self.state = ExecCode::from_code(*code).state();
                self.code = *code;
                self.message = message.clone();
                self.end_time = Some(now);
            }
            Transition::Skip => {
                if !matches!(self.state, State::Pending | State::Running) {
                    return Err(invalid(self.state));
                }
                self.old_state = self.state;
                self.state = State::Skipped;
                self.code = ExecCode::Skipped.code();
                self.message = MSG_SKIPPED.to_string();
                self.end_time = Some(now);
            }
            Transition::Pause => match (scope, self.state) {
                (_, State::Paused) => return Ok(false),
                (Scope::Step, State::Running) => return Err(invalid(State::Running)),
                (_, State::Pending) | (Scope::Task, State::Running) => {
                    self.old_state = self.state;
                    self.state = State::Paused;
                    self.message = MSG_PAUSED.to_string();
                }
                (_, other) => return Err(invalid(other)),
            },
            Transition::Resume => {
                if self.state != State::Paused {
                    return Ok(false);
                }
                self.state = self.old_state;
                self.old_state = State::Paused;
                self.message = MSG_RESUMED.to_string();
            }
            Transition::Kill => {
                if self.state.is_terminal() {
                    return Err(invalid(self.state));
                }
                self.old_state = self.state;
                self.state = State::Failed;
                self.code = ExecCode::Killed.code();
                self.message = MSG_KILLED.to_string();
                self.end_time = Some(now);
            }
        }
        Ok(true)
    }
}
