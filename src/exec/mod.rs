// src/exec/mod.rs

//! Step executors.
//!
//! A step's `type` selects a factory in the [`ExecutorRegistry`]; the factory
//! gets an [`ExecContext`] describing the step and returns a
//! [`StepExecutor`] with two operations:
//!
//! - `run` does the work and reports an exit code. It must stop soon after
//!   the cancellation token fires.
//! - `clear` removes whatever temporary resources `run` needed. It is called
//!   once per executor, whether `run` succeeded or not, and must be
//!   idempotent.
//!
//! Built-ins: [`command`] (`exec`, shell scripts), [`mkdir`] and [`touch`].

pub mod command;
pub mod mkdir;
pub mod registry;
pub mod touch;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dag::dagcuter::BoxFuture;
use crate::storage::Storage;

pub use registry::{ExecutorFactory, ExecutorRegistry, FALLBACK_KIND, split_kind};

pub trait StepExecutor: Send + Sync {
    /// Run the step. `Ok(code)` carries the exit code; `Err` means the
    /// executor itself broke and is reported as a system error.
    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<i64>>;

    fn clear(&self) -> anyhow::Result<()>;
}

/// Everything an executor factory needs to know about one step.
#[derive(Clone)]
pub struct ExecContext {
    pub task: String,
    pub step: String,
    /// Part after `@` in `type@subcommand`; the kind itself when absent.
    pub subcommand: String,
    pub content: String,
    /// Task env overlaid with step env.
    pub env: BTreeMap<String, String>,
    pub workspace: PathBuf,
    pub script_dir: PathBuf,
    pub log: StepLog,
}

impl ExecContext {
    /// Environment handed to child processes, including the `TASK_*` variables.
    pub fn envs(&self) -> Vec<(String, String)> {
        let mut envs: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        envs.push(("TASK_NAME".to_string(), self.task.clone()));
        envs.push(("TASK_STEP_NAME".to_string(), self.step.clone()));
        envs.push((
            "TASK_WORKSPACE".to_string(),
            self.workspace.display().to_string(),
        ));
        envs
    }
}

/// Append-only log sink of one step.
#[derive(Clone)]
pub struct StepLog {
    storage: Option<Arc<dyn Storage>>,
    task: String,
    step: String,
}

impl StepLog {
    pub fn new(storage: Arc<dyn Storage>, task: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            storage: Some(storage),
            task: task.into(),
            step: step.into(),
        }
    }

    /// Sink that only traces, for executors running outside a task.
    pub fn detached(task: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            storage: None,
            task: task.into(),
            step: step.into(),
        }
    }

    pub fn write(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        debug!(task = %self.task, step = %self.step, "{line}");
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(e) = storage.append_log(&self.task, &self.step, line) {
            warn!(task = %self.task, step = %self.step, error = %e, "failed to persist step log");
        }
    }
}

/// Decode a step's structured content. JSON first, then TOML.
pub fn parse_content<T: DeserializeOwned>(content: &str) -> anyhow::Result<T> {
    match serde_json::from_str(content) {
        Ok(value) => Ok(value),
        Err(json_err) => toml::from_str(content)
            .with_context(|| format!("content is neither JSON ({json_err}) nor TOML")),
    }
}

/// Resolve `path` relative to a workspace, refusing to leave it.
pub fn workspace_path(path: &str) -> anyhow::Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(path.trim()).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => {
                if !clean.pop() {
                    bail!("path {path:?} escapes the workspace");
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if clean.as_os_str().is_empty() {
        bail!("path is empty");
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_paths_are_normalised() {
        assert_eq!(workspace_path("a/./b/../c").unwrap(), PathBuf::from("a/c"));
        assert_eq!(workspace_path("/abs/dir").unwrap(), PathBuf::from("abs/dir"));
        assert!(workspace_path("../outside").is_err());
        assert!(workspace_path("  ").is_err());
        assert!(workspace_path("a/..").is_err());
    }

    #[derive(serde::Deserialize)]
    struct Spec {
        path: String,
    }

    #[test]
    fn content_accepts_json_or_toml() {
        let json: Spec = parse_content(r#"{"path": "x"}"#).unwrap();
        assert_eq!(json.path, "x");
        let toml: Spec = parse_content("path = \"y\"").unwrap();
        assert_eq!(toml.path, "y");
        assert!(parse_content::<Spec>("path: z").is_err());
    }

    #[test]
    fn child_env_carries_task_variables() {
        let ctx = ExecContext {
            task: "t".into(),
            step: "s".into(),
            subcommand: String::new(),
            content: String::new(),
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            workspace: PathBuf::from("/w"),
            script_dir: PathBuf::from("/s"),
            log: StepLog::detached("t", "s"),
        };
        let envs = ctx.envs();
        assert!(envs.contains(&("A".to_string(), "1".to_string())));
        assert!(envs.contains(&("TASK_STEP_NAME".to_string(), "s".to_string())));
        assert!(envs.contains(&("TASK_WORKSPACE".to_string(), "/w".to_string())));
    }
}
