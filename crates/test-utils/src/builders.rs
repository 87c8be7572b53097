#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use dagflow::config::model::{RawRetry, RawStepConfig, RawTaskConfig};
use dagflow::config::{ConfigFile, RawConfigFile};
use dagflow::dag::RetryPolicy;
use dagflow::engine::{StepSpec, TaskSpec};
use dagflow::types::TaskKind;

use crate::fake_executor::{FakeScript, FAKE_KIND};

/// Builder for `TaskSpec` submissions.
pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    /// A DAG task; use [`chain`](Self::chain) for declaration-order tasks.
    pub fn new(name: &str) -> Self {
        Self {
            spec: TaskSpec {
                name: name.to_string(),
                kind: TaskKind::Dag,
                ..TaskSpec::default()
            },
        }
    }

    pub fn chain(mut self) -> Self {
        self.spec.kind = TaskKind::Chain;
        self
    }

    pub fn node(mut self, node: &str) -> Self {
        self.spec.node = node.to_string();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.spec.delay = delay;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.spec.retry = Some(policy);
        self
    }

    pub fn disable(mut self) -> Self {
        self.spec.disable = true;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.spec.steps.push(step);
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

/// Builder for `StepSpec`.
pub struct StepSpecBuilder {
    spec: StepSpec,
}

impl StepSpecBuilder {
    pub fn new(name: &str, kind: &str, content: &str) -> Self {
        Self {
            spec: StepSpec {
                name: name.to_string(),
                kind: kind.to_string(),
                content: content.to_string(),
                ..StepSpec::default()
            },
        }
    }

    /// Step run by the fake executor.
    pub fn fake(name: &str, script: FakeScript) -> Self {
        Self::new(name, FAKE_KIND, &script.content())
    }

    pub fn depends(mut self, dep: &str) -> Self {
        self.spec.depends.push(dep.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.spec.retry = Some(policy);
        self
    }

    pub fn disable(mut self) -> Self {
        self.spec.disable = true;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> StepSpec {
        self.spec
    }
}

/// Retry policy with millisecond backoff, for fast tests.
pub fn quick_retry(max_attempts: i32) -> RetryPolicy {
    RetryPolicy {
        interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        max_attempts,
        multiplier: 2.0,
    }
}

/// Builder for `ConfigFile` going through the same validation as a file.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn node_name(mut self, name: &str) -> Self {
        self.config.node.name = name.to_string();
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.node.pool_size = Some(size);
        self
    }

    pub fn default_attempts(mut self, max_attempts: i32) -> Self {
        self.config.default.retry = Some(RawRetry {
            max_attempts,
            ..RawRetry::default()
        });
        self
    }

    pub fn with_task(mut self, name: &str, task: RawTaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a `[task.<name>]` table.
pub struct TaskConfigBuilder {
    task: RawTaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(kind: &str) -> Self {
        Self {
            task: RawTaskConfig {
                kind: kind.to_string(),
                ..RawTaskConfig::default()
            },
        }
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.task.timeout = Some(timeout.to_string());
        self
    }

    pub fn step(mut self, name: &str, content: &str, depends: &[&str]) -> Self {
        self.task.step.push(RawStepConfig {
            name: name.to_string(),
            kind: "exec".to_string(),
            content: content.to_string(),
            depends: depends.iter().map(|d| d.to_string()).collect(),
            env: BTreeMap::new(),
            ..RawStepConfig::default()
        });
        self
    }

    pub fn build(self) -> RawTaskConfig {
        self.task
    }
}
