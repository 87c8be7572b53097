// src/errors.rs

//! Crate-wide error aliases and helpers.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::State;

#[derive(Error, Debug)]
pub enum DagflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("cycle detected: {0}")]
    DagCycle(String),

    #[error("unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("{unit} cancelled before attempt {attempt}")]
    Cancelled { unit: String, attempt: u32 },

    #[error("task {unit} failed after {attempts} attempts, last error: {source}")]
    RetryExhausted {
        unit: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Step not found: {task}/{step}")]
    StepNotFound { task: String, step: String },

    #[error("{entity} is {from}, cannot {action}")]
    InvalidTransition {
        entity: String,
        from: State,
        action: &'static str,
    },

    #[error("task {0} is running")]
    TaskBusy(String),

    #[error("task {0} is not running")]
    TaskNotRunning(String),

    #[error("invalid control message: {0}")]
    InvalidControl(String),

    #[error("executor kind not registered: {0}")]
    UnknownExecutor(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("broker is shut down")]
    BrokerClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stage of a unit's execution that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Execute,
    Post,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Pre => "pre execution",
            Stage::Execute => "execution",
            Stage::Post => "post execution",
        };
        f.write_str(s)
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DagflowError>;
