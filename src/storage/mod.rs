// src/storage/mod.rs

//! Persistence boundary for task and step records.
//!
//! The engine only talks to [`Storage`]. Every state change goes through
//! `update_task` / `update_step`, whose closure runs while the record is
//! locked, so a precondition check and the write it guards cannot be split
//! by a concurrent control message.

pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::dag::retry::RetryPolicy;
use crate::errors::Result;
use crate::lifecycle::{State, Status};
use crate::types::TaskKind;

pub use memory::MemoryStorage;

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub name: String,
    pub kind: TaskKind,
    /// Owning node; empty until a node claims an any-node task.
    pub node: String,
    pub timeout: Duration,
    pub retry: Option<RetryPolicy>,
    pub disable: bool,
    pub env: BTreeMap<String, String>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub task: String,
    pub name: String,
    /// Declaration order, starting at 1.
    pub seq: u32,
    /// Executor kind, optionally `kind@subcommand`.
    pub kind: String,
    pub content: String,
    pub timeout: Duration,
    pub retry: Option<RetryPolicy>,
    pub disable: bool,
    pub env: BTreeMap<String, String>,
    pub depends: Vec<String>,
    pub status: Status,
}

/// One line of a step's log sink.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub time: DateTime<Utc>,
    pub line: String,
}

pub type TaskUpdate<'a> = &'a mut dyn FnMut(&mut TaskRecord) -> Result<()>;
pub type StepUpdate<'a> = &'a mut dyn FnMut(&mut StepRecord) -> Result<()>;

pub trait Storage: Send + Sync {
    /// Insert a task and its steps, replacing any previous record of the same name.
    fn create_task(&self, task: TaskRecord, steps: Vec<StepRecord>) -> Result<()>;

    fn task(&self, name: &str) -> Result<TaskRecord>;

    fn tasks(&self) -> Vec<TaskRecord>;

    /// Tasks owned by `node`, including unclaimed ones.
    fn node_tasks(&self, node: &str) -> Vec<TaskRecord>;

    /// Apply `update` atomically. Nothing is written if it returns an error.
    fn update_task(&self, name: &str, update: TaskUpdate<'_>) -> Result<TaskRecord>;

    fn remove_task(&self, name: &str) -> Result<()>;

    fn step(&self, task: &str, step: &str) -> Result<StepRecord>;

    /// Steps of a task ordered by `seq`.
    fn steps(&self, task: &str) -> Result<Vec<StepRecord>>;

    fn step_states(&self, task: &str) -> Result<HashMap<String, State>> {
        Ok(self
            .steps(task)?
            .into_iter()
            .map(|s| (s.name, s.status.state))
            .collect())
    }

    fn update_step(&self, task: &str, step: &str, update: StepUpdate<'_>) -> Result<StepRecord>;

    fn append_log(&self, task: &str, step: &str, line: &str) -> Result<()>;

    fn step_log(&self, task: &str, step: &str) -> Result<Vec<LogLine>>;
}
