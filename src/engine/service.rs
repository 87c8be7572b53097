// src/engine/service.rs

//! Client side of the engine: validate and persist submissions, dispatch
//! them, and route control requests to the node that owns a task.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::control::{ControlAction, ControlMessage};
use crate::dag::{DagGraph, RetryPolicy};
use crate::errors::{DagflowError, Result};
use crate::lifecycle::state::MSG_PENDING;
use crate::lifecycle::{State, Status};
use crate::storage::{LogLine, StepRecord, Storage, TaskRecord};
use crate::types::{ANY_NODE, TaskKind};

/// Default upper bound for task timeouts.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Characters allowed in task and step names: ASCII letters and digits,
/// `-_.~` and CJK ideographs. Everything else is stripped.
const NAME_FILTER: &str = r"[^a-zA-Z\p{Han}0-9\-_.~]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepSpec {
    pub name: String,
    /// Executor kind, optionally `kind@subcommand`.
    pub kind: String,
    pub content: String,
    pub depends: Vec<String>,
    /// Zero means "the task timeout".
    pub timeout: Duration,
    pub retry: Option<RetryPolicy>,
    pub disable: bool,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    /// Target node; empty means any node.
    pub node: String,
    /// Zero means the service's exec timeout.
    pub timeout: Duration,
    /// Dispatch is held back this long.
    pub delay: Duration,
    pub retry: Option<RetryPolicy>,
    pub disable: bool,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepSpec>,
}

/// A task with its steps, as read back from storage.
#[derive(Debug, Clone)]
pub struct TaskDetail {
    pub task: TaskRecord,
    pub steps: Vec<StepRecord>,
}

impl TaskDetail {
    /// Task message followed by step counts per state,
    /// e.g. `execution succeeded; 2 stopped; 1 skipped`.
    pub fn summary(&self) -> String {
        let mut counts: BTreeMap<State, usize> = BTreeMap::new();
        for step in &self.steps {
            *counts.entry(step.status.state).or_default() += 1;
        }
        let mut parts = Vec::with_capacity(counts.len() + 1);
        if !self.task.status.message.is_empty() {
            parts.push(self.task.status.message.clone());
        }
        parts.extend(counts.iter().map(|(state, n)| format!("{n} {state}")));
        parts.join("; ")
    }
}

pub struct TaskService {
    storage: Arc<dyn Storage>,
    broker: Arc<dyn Broker>,
    exec_timeout: Duration,
    name_filter: Regex,
}

impl TaskService {
    pub fn new(storage: Arc<dyn Storage>, broker: Arc<dyn Broker>, exec_timeout: Duration) -> Result<Self> {
        let name_filter = Regex::new(NAME_FILTER)
            .map_err(|e| DagflowError::ConfigError(format!("name filter: {e}")))?;
        let exec_timeout = if exec_timeout.is_zero() {
            DEFAULT_EXEC_TIMEOUT
        } else {
            exec_timeout
        };
        Ok(Self {
            storage,
            broker,
            exec_timeout,
            name_filter,
        })
    }

    fn sanitize(&self, name: &str) -> String {
        let clean = self.name_filter.replace_all(name, "").into_owned();
        if clean.is_empty() {
            Uuid::new_v4().simple().to_string()
        } else {
            clean
        }
    }

    /// Validate a submission and turn it into storage records.
    fn prepare(&self, spec: TaskSpec) -> Result<(TaskRecord, Vec<StepRecord>)> {
        let name = self.sanitize(&spec.name);
        if spec.steps.is_empty() {
            return Err(DagflowError::InvalidTask(format!(
                "task {name}: steps can not be empty"
            )));
        }

        let timeout = if spec.timeout.is_zero() || spec.timeout >= self.exec_timeout {
            self.exec_timeout
        } else {
            spec.timeout
        };

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(spec.steps.len());
        for (i, step) in spec.steps.into_iter().enumerate() {
            let step_name = self.sanitize(&step.name);
            if !seen.insert(step_name.clone()) {
                return Err(DagflowError::InvalidTask(format!(
                    "task {name}: duplicate step name {step_name}"
                )));
            }
            let kind = step.kind.trim().to_string();
            if kind.is_empty() {
                return Err(DagflowError::InvalidTask(format!(
                    "step {name}/{step_name}: type is empty"
                )));
            }
            if step.content.is_empty() {
                return Err(DagflowError::InvalidTask(format!(
                    "step {name}/{step_name}: content is empty"
                )));
            }
            let mut depends: Vec<String> = Vec::with_capacity(step.depends.len());
            for dep in step.depends {
                if !depends.contains(&dep) {
                    depends.push(dep);
                }
            }

            steps.push(StepRecord {
                task: name.clone(),
                name: step_name,
                seq: i as u32 + 1,
                kind,
                content: step.content,
                timeout: if step.timeout.is_zero() || step.timeout > timeout {
                    timeout
                } else {
                    step.timeout
                },
                retry: step.retry,
                disable: step.disable,
                env: step.env,
                depends,
                status: Status::pending(MSG_PENDING),
            });
        }

        if spec.kind == TaskKind::Chain {
            chain_steps(&mut steps);
        }
        DagGraph::from_dependencies(steps.iter().map(|s| (s.name.clone(), s.depends.clone())))?;

        let task = TaskRecord {
            name,
            kind: spec.kind,
            node: spec.node.trim().to_string(),
            timeout,
            retry: spec.retry,
            disable: spec.disable,
            env: spec.env,
            status: Status::pending(MSG_PENDING),
            created_at: Utc::now(),
        };
        Ok((task, steps))
    }

    /// Persist a task as Pending and dispatch it. Returns the stored name,
    /// which may differ from the requested one after sanitising.
    pub async fn submit(&self, spec: TaskSpec) -> Result<String> {
        let delay = spec.delay;
        let (task, steps) = self.prepare(spec)?;
        let name = task.name.clone();

        let busy = self
            .storage
            .task(&name)
            .is_ok_and(|existing| !existing.status.state.accepts_resubmit());
        if busy {
            return Err(DagflowError::TaskBusy(name));
        }

        let target = if task.node.is_empty() {
            ANY_NODE.to_string()
        } else {
            task.node.clone()
        };
        let step_count = steps.len();
        self.storage.create_task(task, steps)?;

        let published = if delay.is_zero() {
            self.broker.publish_task(&target, &name).await
        } else {
            self.broker.publish_task_delayed(&target, &name, delay).await
        };
        if let Err(e) = published {
            warn!(task = %name, error = %e, "dispatch failed, discarding task");
            if let Err(e) = self.storage.remove_task(&name) {
                debug!(task = %name, error = %e, "rollback failed");
            }
            return Err(e);
        }

        info!(task = %name, node = %target, steps = step_count, delay = ?delay, "task submitted");
        Ok(name)
    }

    fn owner<'a>(&self, task: &'a TaskRecord) -> Result<&'a str> {
        if task.status.state.is_terminal() || task.node.is_empty() {
            return Err(DagflowError::TaskNotRunning(task.name.clone()));
        }
        Ok(&task.node)
    }

    /// Send kill / pause / resume for a whole task to its node.
    pub async fn manage_task(&self, name: &str, action: ControlAction, duration: Duration) -> Result<()> {
        let task = self.storage.task(name)?;
        let node = self.owner(&task)?;
        let payload = ControlMessage::task(name, action, duration).encode()?;
        debug!(task = %name, node = %node, action = %action, "sending control message");
        self.broker.publish_manager(node, &payload).await
    }

    /// Send kill / pause / resume for one step to its task's node.
    pub async fn manage_step(
        &self,
        task: &str,
        step: &str,
        action: ControlAction,
        duration: Duration,
    ) -> Result<()> {
        let record = self.storage.task(task)?;
        let node = self.owner(&record)?;
        if self.storage.step(task, step)?.status.state.is_terminal() {
            return Err(DagflowError::TaskNotRunning(format!("{task}/{step}")));
        }
        let payload = ControlMessage::step(task, step, action, duration).encode()?;
        debug!(task = %task, step = %step, node = %node, action = %action, "sending control message");
        self.broker.publish_manager(node, &payload).await
    }

    /// Kill the task if it is live, then remove it and its steps.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let task = self.storage.task(name)?;
        if let Ok(node) = self.owner(&task) {
            let payload = ControlMessage::task(name, ControlAction::Kill, Duration::ZERO).encode()?;
            self.broker.publish_manager(node, &payload).await?;
        }
        self.storage.remove_task(name)?;
        info!(task = %name, "task deleted");
        Ok(())
    }

    pub fn detail(&self, name: &str) -> Result<TaskDetail> {
        Ok(TaskDetail {
            task: self.storage.task(name)?,
            steps: self.storage.steps(name)?,
        })
    }

    pub fn step_log(&self, task: &str, step: &str) -> Result<Vec<LogLine>> {
        self.storage.step_log(task, step)
    }

    /// Stored tasks whose name starts with `prefix`.
    pub fn list(&self, prefix: &str) -> Vec<TaskRecord> {
        self.storage
            .tasks()
            .into_iter()
            .filter(|t| t.name.starts_with(prefix))
            .collect()
    }
}

/// Make every step depend on its predecessor only.
fn chain_steps(steps: &mut [StepRecord]) {
    let mut previous: Option<String> = None;
    for step in steps.iter_mut() {
        step.depends = previous.iter().cloned().collect();
        previous = Some(step.name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Routing};
    use crate::storage::MemoryStorage;

    fn service() -> (TaskService, Arc<MemoryBroker>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let broker = Arc::new(MemoryBroker::new(Routing::default()));
        let svc = TaskService::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::clone(&broker) as Arc<dyn Broker>,
            Duration::from_secs(3600),
        )
        .unwrap();
        (svc, broker, storage)
    }

    fn step(name: &str, depends: &[&str]) -> StepSpec {
        StepSpec {
            name: name.into(),
            kind: "exec".into(),
            content: "true".into(),
            depends: depends.iter().map(|d| d.to_string()).collect(),
            ..StepSpec::default()
        }
    }

    #[tokio::test]
    async fn chain_tasks_are_rewired_in_declaration_order() {
        let (svc, broker, storage) = service();
        let name = svc
            .submit(TaskSpec {
                name: "build".into(),
                steps: vec![step("a", &[]), step("b", &["x"]), step("c", &["a"])],
                ..TaskSpec::default()
            })
            .await
            .unwrap();

        let steps = storage.steps(&name).unwrap();
        assert_eq!(steps[0].depends, Vec::<String>::new());
        assert_eq!(steps[1].depends, vec!["a"]);
        assert_eq!(steps[2].depends, vec!["b"]);
        assert_eq!(broker.queued(ANY_NODE), 1);
    }

    #[tokio::test]
    async fn names_are_sanitised_and_timeouts_clamped() {
        let (svc, _broker, storage) = service();
        let name = svc
            .submit(TaskSpec {
                name: "构建 #1/x".into(),
                node: "n1".into(),
                timeout: Duration::from_secs(7200),
                steps: vec![StepSpec {
                    timeout: Duration::from_secs(9000),
                    ..step("s", &[])
                }],
                ..TaskSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(name, "构建1x");

        let task = storage.task(&name).unwrap();
        assert_eq!(task.timeout, Duration::from_secs(3600));
        assert_eq!(task.status.state, State::Pending);
        assert_eq!(storage.steps(&name).unwrap()[0].timeout, Duration::from_secs(3600));

        let unnamed = svc
            .submit(TaskSpec {
                name: "###".into(),
                steps: vec![step("s", &[])],
                ..TaskSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(unnamed.len(), 32);
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let (svc, _broker, storage) = service();
        let empty = svc.submit(TaskSpec {
            name: "t".into(),
            ..TaskSpec::default()
        });
        assert!(matches!(empty.await, Err(DagflowError::InvalidTask(_))));

        let dup = svc.submit(TaskSpec {
            name: "t".into(),
            steps: vec![step("a", &[]), step("a", &[])],
            ..TaskSpec::default()
        });
        assert!(matches!(dup.await, Err(DagflowError::InvalidTask(_))));

        let cycle = svc.submit(TaskSpec {
            name: "t".into(),
            kind: TaskKind::Dag,
            steps: vec![step("a", &["b"]), step("b", &["a"])],
            ..TaskSpec::default()
        });
        assert!(matches!(cycle.await, Err(DagflowError::DagCycle(_))));

        let unknown = svc.submit(TaskSpec {
            name: "t".into(),
            kind: TaskKind::Dag,
            steps: vec![step("a", &["missing"])],
            ..TaskSpec::default()
        });
        assert!(matches!(
            unknown.await,
            Err(DagflowError::UnknownDependency { .. })
        ));
        assert!(storage.tasks().is_empty());
    }

    #[tokio::test]
    async fn live_tasks_cannot_be_resubmitted() {
        let (svc, _broker, _storage) = service();
        let spec = TaskSpec {
            name: "t".into(),
            steps: vec![step("a", &[])],
            ..TaskSpec::default()
        };
        svc.submit(spec.clone()).await.unwrap();
        assert!(matches!(
            svc.submit(spec).await,
            Err(DagflowError::TaskBusy(_))
        ));
    }

    #[tokio::test]
    async fn control_needs_a_live_owned_task() {
        let (svc, broker, storage) = service();
        svc.submit(TaskSpec {
            name: "t".into(),
            steps: vec![step("a", &[])],
            ..TaskSpec::default()
        })
        .await
        .unwrap();

        // Unclaimed any-node task.
        assert!(matches!(
            svc.manage_task("t", ControlAction::Pause, Duration::ZERO).await,
            Err(DagflowError::TaskNotRunning(_))
        ));

        storage
            .update_task("t", &mut |t| {
                t.node = "n1".into();
                Ok(())
            })
            .unwrap();
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        broker
            .subscribe_manager(
                tokio_util::sync::CancellationToken::new(),
                "n1",
                crate::broker::handler(move |payload| {
                    let sink = Arc::clone(&sink);
                    async move { sink.lock().unwrap().push(payload) }
                }),
            )
            .await
            .unwrap();

        svc.manage_step("t", "a", ControlAction::Kill, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let got = received.lock().unwrap().clone();
        assert_eq!(
            ControlMessage::parse(&got[0]).unwrap(),
            ControlMessage::step("t", "a", ControlAction::Kill, Duration::ZERO)
        );

        svc.delete("t").await.unwrap();
        assert!(matches!(svc.detail("t"), Err(DagflowError::TaskNotFound(_))));
    }

    #[test]
    fn summary_counts_steps_per_state() {
        let mut task_status = Status::pending("done");
        task_status.state = State::Stopped;
        let mk = |name: &str, state: State| {
            let mut status = Status::pending("");
            status.state = state;
            StepRecord {
                task: "t".into(),
                name: name.into(),
                seq: 1,
                kind: "exec".into(),
                content: String::new(),
                timeout: Duration::from_secs(1),
                retry: None,
                disable: false,
                env: BTreeMap::new(),
                depends: vec![],
                status,
            }
        };
        let detail = TaskDetail {
            task: TaskRecord {
                name: "t".into(),
                kind: TaskKind::Chain,
                node: String::new(),
                timeout: Duration::from_secs(1),
                retry: None,
                disable: false,
                env: BTreeMap::new(),
                status: task_status,
                created_at: Utc::now(),
            },
            steps: vec![
                mk("a", State::Stopped),
                mk("b", State::Failed),
                mk("c", State::Stopped),
            ],
        };
        assert_eq!(detail.summary(), "done; 2 stopped; 1 failed");
    }
}
