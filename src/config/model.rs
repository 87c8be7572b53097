// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dag::RetryPolicy;
use crate::engine::TaskSpec;

/// Configuration file as read from TOML, before validation.
///
/// ```toml
/// [node]
/// name = "dagflow01"
/// broker_url = "inmemory://"
///
/// [default.retry]
/// max_attempts = 2
///
/// [task.build]
/// kind = "dag"
///
/// [[task.build.step]]
/// name = "compile"
/// type = "exec"
/// content = "make"
/// ```
///
/// All sections are optional; validation requires at least one task.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub default: DefaultSection,

    /// Keys are task names.
    #[serde(default)]
    pub task: BTreeMap<String, RawTaskConfig>,
}

/// `[node]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Tasks run at once. Defaults to twice the available CPUs.
    #[serde(default)]
    pub pool_size: Option<usize>,

    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Prefix of every exchange, queue and routing key.
    #[serde(default = "default_service")]
    pub service: String,

    /// Upper bound for task timeouts.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout: String,

    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Per-task step pool. `<= 0` means the default of 150.
    #[serde(default = "default_dag_workers")]
    pub dag_workers: i64,
}

fn default_node_name() -> String {
    "dagflow01".to_string()
}

fn default_broker_url() -> String {
    "inmemory://".to_string()
}

fn default_service() -> String {
    crate::broker::DEFAULT_SERVICE.to_string()
}

fn default_exec_timeout() -> String {
    "24h".to_string()
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".dagflow")
}

fn default_dag_workers() -> i64 {
    crate::dag::dagcuter::DEFAULT_WORKERS as i64
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            pool_size: None,
            broker_url: default_broker_url(),
            service: default_service(),
            exec_timeout: default_exec_timeout(),
            root_dir: default_root_dir(),
            dag_workers: default_dag_workers(),
        }
    }
}

/// `[default]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DefaultSection {
    /// Retry policy for steps (and tasks) that declare none.
    #[serde(default)]
    pub retry: Option<RawRetry>,
}

/// Retry table, used by `[default.retry]`, tasks and steps.
///
/// Unset intervals fall back to the policy defaults (1s, capped at 30s).
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RawRetry {
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub max_interval: Option<String>,
    #[serde(default)]
    pub max_attempts: i32,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawTaskConfig {
    /// `"chain"` (default) or `"dag"`.
    #[serde(default)]
    pub kind: String,

    /// Target node; empty dispatches to any node.
    #[serde(default)]
    pub node: String,

    #[serde(default)]
    pub timeout: Option<String>,

    /// Hold dispatch back this long.
    #[serde(default)]
    pub delay: Option<String>,

    #[serde(default)]
    pub disable: bool,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub retry: Option<RawRetry>,

    /// `[[task.<name>.step]]` entries in declaration order.
    #[serde(default)]
    pub step: Vec<RawStepConfig>,
}

/// `[[task.<name>.step]]` entry.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawStepConfig {
    pub name: String,

    /// Executor kind, `kind@subcommand` accepted.
    #[serde(rename = "type", default = "default_step_type")]
    pub kind: String,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub depends: Vec<String>,

    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub disable: bool,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub retry: Option<RawRetry>,
}

fn default_step_type() -> String {
    crate::exec::FALLBACK_KIND.to_string()
}

/// Validated node settings.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    pub pool_size: usize,
    pub broker_url: String,
    pub service: String,
    pub exec_timeout: Duration,
    pub root_dir: PathBuf,
    pub dag_workers: i64,
}

/// Validated configuration. Only built through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub node: NodeConfig,
    pub default_retry: Option<RetryPolicy>,
    /// Tasks ordered by name.
    pub tasks: Vec<TaskSpec>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        node: NodeConfig,
        default_retry: Option<RetryPolicy>,
        tasks: Vec<TaskSpec>,
    ) -> Self {
        Self {
            node,
            default_retry,
            tasks,
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }
}
