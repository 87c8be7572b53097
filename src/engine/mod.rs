// src/engine/mod.rs

//! Task orchestration on top of the DAG executor.
//!
//! - [`task_runner`] runs one dispatched task: it rebuilds the step graph
//!   from storage and drives it through a [`Dagcuter`](crate::dag::Dagcuter).
//! - [`controller`] applies kill / pause / resume messages to live handles.
//! - [`worker`] is a node: broker subscriptions, the task pool, startup
//!   recovery and event forwarding.
//! - [`service`] is the client side: submit, manage, delete, inspect.

pub mod controller;
pub mod service;
pub mod task_runner;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use crate::dag::RetryPolicy;
use crate::exec::ExecutorRegistry;
use crate::lifecycle::{HandleRegistry, Lifecycle};

pub use controller::Controller;
pub use service::{StepSpec, TaskDetail, TaskService, TaskSpec};
pub use task_runner::{register, run_registered, run_task};
pub use worker::Node;

/// Resources shared by everything running on one node.
#[derive(Clone)]
pub struct EngineContext {
    pub node: String,
    pub lifecycle: Lifecycle,
    pub handles: Arc<HandleRegistry>,
    pub executors: Arc<ExecutorRegistry>,
    /// Holds `scripts/<task>` and `workspace/<task>`.
    pub root_dir: PathBuf,
    /// Per-task Dagcuter pool size.
    pub dag_workers: i64,
    /// Retry policy for steps that declare none.
    pub default_retry: Option<RetryPolicy>,
}

impl EngineContext {
    pub fn new(node: impl Into<String>, lifecycle: Lifecycle, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            node: node.into(),
            lifecycle,
            handles: Arc::new(HandleRegistry::new()),
            executors: Arc::new(ExecutorRegistry::with_builtins()),
            root_dir: root_dir.into(),
            dag_workers: crate::dag::dagcuter::DEFAULT_WORKERS as i64,
            default_retry: None,
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    pub fn with_dag_workers(mut self, workers: i64) -> Self {
        self.dag_workers = workers;
        self
    }

    pub fn with_default_retry(mut self, retry: Option<RetryPolicy>) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn workspace_dir(&self, task: &str) -> PathBuf {
        self.root_dir.join("workspace").join(task)
    }

    pub fn script_dir(&self, task: &str) -> PathBuf {
        self.root_dir.join("scripts").join(task)
    }
}
