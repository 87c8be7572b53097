// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::duration::parse_duration;
use crate::config::model::{
    ConfigFile, NodeConfig, NodeSection, RawConfigFile, RawRetry, RawStepConfig, RawTaskConfig,
};
use crate::dag::RetryPolicy;
use crate::engine::{StepSpec, TaskSpec};
use crate::errors::{DagflowError, Result};
use crate::types::TaskKind;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DagflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_tasks(&raw)?;
        let node = validate_node(&raw.node)?;
        let default_retry = raw
            .default
            .retry
            .as_ref()
            .map(|r| retry_policy("[default.retry]", r))
            .transpose()?;

        let mut tasks = Vec::with_capacity(raw.task.len());
        for (name, task) in &raw.task {
            validate_steps(name, task)?;
            tasks.push(task_spec(name, task)?);
        }
        Ok(ConfigFile::new_unchecked(node, default_retry, tasks))
    }
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(DagflowError::ConfigError(
            "config must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn duration(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| DagflowError::ConfigError(format!("{field}: {e}")))
}

fn optional_duration(field: &str, value: Option<&String>) -> Result<Duration> {
    value.map_or(Ok(Duration::ZERO), |v| duration(field, v))
}

fn validate_node(node: &NodeSection) -> Result<NodeConfig> {
    if node.name.trim().is_empty() {
        return Err(DagflowError::ConfigError(
            "[node].name must not be empty".to_string(),
        ));
    }
    if node.pool_size == Some(0) {
        return Err(DagflowError::ConfigError(
            "[node].pool_size must be >= 1 (got 0)".to_string(),
        ));
    }
    let pool_size = node.pool_size.unwrap_or_else(|| {
        std::thread::available_parallelism().map_or(1, |n| n.get()) * 2
    });

    Ok(NodeConfig {
        name: node.name.trim().to_string(),
        pool_size,
        broker_url: node.broker_url.clone(),
        service: node.service.clone(),
        exec_timeout: duration("[node].exec_timeout", &node.exec_timeout)?,
        root_dir: node.root_dir.clone(),
        dag_workers: node.dag_workers,
    })
}

fn retry_policy(field: &str, raw: &RawRetry) -> Result<RetryPolicy> {
    let defaults = RetryPolicy::default();
    Ok(RetryPolicy {
        interval: match &raw.interval {
            Some(v) => duration(&format!("{field}.interval"), v)?,
            None => defaults.interval,
        },
        max_interval: match &raw.max_interval {
            Some(v) => duration(&format!("{field}.max_interval"), v)?,
            None => defaults.max_interval,
        },
        max_attempts: raw.max_attempts,
        multiplier: raw.multiplier.unwrap_or(defaults.multiplier),
    })
}

fn validate_steps(task_name: &str, task: &RawTaskConfig) -> Result<()> {
    if task.step.is_empty() {
        return Err(DagflowError::ConfigError(format!(
            "task '{task_name}' must have at least one [[task.{task_name}.step]]"
        )));
    }

    let mut names = HashSet::new();
    for step in &task.step {
        if step.name.trim().is_empty() {
            return Err(DagflowError::ConfigError(format!(
                "task '{task_name}' has a step without a name"
            )));
        }
        if !names.insert(step.name.as_str()) {
            return Err(DagflowError::ConfigError(format!(
                "task '{task_name}' has duplicate step '{}'",
                step.name
            )));
        }
    }

    for step in &task.step {
        for dep in &step.depends {
            if dep == &step.name {
                return Err(DagflowError::ConfigError(format!(
                    "step '{task_name}/{}' cannot depend on itself",
                    step.name
                )));
            }
            if !names.contains(dep.as_str()) {
                return Err(DagflowError::ConfigError(format!(
                    "step '{task_name}/{}' has unknown dependency '{dep}'",
                    step.name
                )));
            }
        }
    }

    validate_dag(task_name, &task.step)
}

fn validate_dag(task_name: &str, steps: &[RawStepConfig]) -> Result<()> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for step in steps {
        graph.add_node(step.name.as_str());
    }
    for step in steps {
        for dep in &step.depends {
            graph.add_edge(dep.as_str(), step.name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(DagflowError::DagCycle(format!(
            "cycle in task '{task_name}' involving step '{}'",
            cycle.node_id()
        ))),
    }
}

fn task_spec(name: &str, task: &RawTaskConfig) -> Result<TaskSpec> {
    let kind: TaskKind = task
        .kind
        .parse()
        .map_err(|e| DagflowError::ConfigError(format!("task '{name}': {e}")))?;
    let field = |f: &str| format!("task '{name}'.{f}");

    let mut steps = Vec::with_capacity(task.step.len());
    for step in &task.step {
        let step_field = |f: &str| format!("step '{name}/{}'.{f}", step.name);
        steps.push(StepSpec {
            name: step.name.trim().to_string(),
            kind: step.kind.clone(),
            content: step.content.clone(),
            depends: step.depends.clone(),
            timeout: optional_duration(&step_field("timeout"), step.timeout.as_ref())?,
            retry: step
                .retry
                .as_ref()
                .map(|r| retry_policy(&step_field("retry"), r))
                .transpose()?,
            disable: step.disable,
            env: step.env.clone(),
        });
    }

    Ok(TaskSpec {
        name: name.to_string(),
        kind,
        node: task.node.clone(),
        timeout: optional_duration(&field("timeout"), task.timeout.as_ref())?,
        delay: optional_duration(&field("delay"), task.delay.as_ref())?,
        retry: task
            .retry
            .as_ref()
            .map(|r| retry_policy(&field("retry"), r))
            .transpose()?,
        disable: task.disable,
        env: task.env.clone(),
        steps,
    })
}
