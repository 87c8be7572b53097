// src/control.rs

//! Control-plane payloads: kill / pause / resume addressed to a task or step.
//!
//! Wire format: fields joined by U+001F (unit separator), which is rejected
//! in every field on encode.
//!
//! - `task SEP action SEP duration`
//! - `task SEP step SEP action SEP duration`
//!
//! `duration` is `0` when absent; for pause it bounds how long the pause lasts.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::duration::{format_duration, parse_duration};
use crate::errors::{DagflowError, Result};

pub const SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Kill,
    Pause,
    Resume,
}

impl FromStr for ControlAction {
    type Err = DagflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kill" => Ok(ControlAction::Kill),
            "pause" => Ok(ControlAction::Pause),
            "resume" => Ok(ControlAction::Resume),
            other => Err(DagflowError::InvalidControl(format!(
                "unknown action '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlAction::Kill => "kill",
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub task: String,
    pub step: Option<String>,
    pub action: ControlAction,
    /// Zero means no bound (pause until an explicit resume).
    pub duration: Duration,
}

impl ControlMessage {
    pub fn task(task: impl Into<String>, action: ControlAction, duration: Duration) -> Self {
        Self {
            task: task.into(),
            step: None,
            action,
            duration,
        }
    }

    pub fn step(
        task: impl Into<String>,
        step: impl Into<String>,
        action: ControlAction,
        duration: Duration,
    ) -> Self {
        Self {
            task: task.into(),
            step: Some(step.into()),
            action,
            duration,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let mut fields: Vec<String> = vec![self.task.clone()];
        if let Some(step) = &self.step {
            fields.push(step.clone());
        }
        fields.push(self.action.to_string());
        fields.push(format_duration(self.duration));

        for field in &fields {
            if field.is_empty() || field.contains(SEPARATOR) {
                return Err(DagflowError::InvalidControl(format!(
                    "field {field:?} is empty or contains the separator"
                )));
            }
        }
        Ok(fields.join(&SEPARATOR.to_string()))
    }

    pub fn parse(payload: &str) -> Result<Self> {
        if !payload.contains(SEPARATOR) {
            return Err(DagflowError::InvalidControl(
                "payload has no field separator".to_string(),
            ));
        }
        let fields: Vec<&str> = payload.split(SEPARATOR).collect();
        let (task, step, action, duration) = match fields.as_slice() {
            [task, action, duration] => (*task, None, *action, *duration),
            [task, step, action, duration] => (*task, Some(*step), *action, *duration),
            _ => {
                return Err(DagflowError::InvalidControl(format!(
                    "expected 3 or 4 fields, got {}",
                    fields.len()
                )));
            }
        };
        if task.is_empty() || step.is_some_and(str::is_empty) {
            return Err(DagflowError::InvalidControl("empty name".to_string()));
        }

        // An unparseable duration behaves like "no bound".
        let duration = parse_duration(duration).unwrap_or(Duration::ZERO);

        Ok(Self {
            task: task.to_string(),
            step: step.map(str::to_string),
            action: action.parse()?,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_and_step_payloads_round_trip() {
        let task = ControlMessage::task("build", ControlAction::Pause, Duration::from_secs(30));
        assert_eq!(ControlMessage::parse(&task.encode().unwrap()).unwrap(), task);

        let step = ControlMessage::step("build", "compile", ControlAction::Kill, Duration::ZERO);
        let wire = step.encode().unwrap();
        assert_eq!(wire.split(SEPARATOR).count(), 4);
        assert_eq!(ControlMessage::parse(&wire).unwrap(), step);
    }

    #[test]
    fn names_may_contain_ordinary_punctuation() {
        let msg = ControlMessage::step("a.b-c", "x/y z", ControlAction::Resume, Duration::ZERO);
        assert_eq!(ControlMessage::parse(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn separator_inside_field_is_rejected() {
        let msg = ControlMessage::task(format!("a{SEPARATOR}b"), ControlAction::Kill, Duration::ZERO);
        assert!(msg.encode().is_err());
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(ControlMessage::parse("no separators").is_err());
        let two = format!("t{SEPARATOR}kill");
        assert!(ControlMessage::parse(&two).is_err());
        let bad_action = format!("t{SEPARATOR}explode{SEPARATOR}0");
        assert!(ControlMessage::parse(&bad_action).is_err());
    }

    #[test]
    fn unparseable_duration_means_unbounded() {
        let raw = format!("t{SEPARATOR}pause{SEPARATOR}soon");
        assert_eq!(ControlMessage::parse(&raw).unwrap().duration, Duration::ZERO);
    }
}
