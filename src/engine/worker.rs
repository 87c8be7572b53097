// src/engine/worker.rs

//! A worker node.
//!
//! On start the node repairs records a previous process left unfinished,
//! then listens on three channels:
//!
//! - its own dispatch queue and the shared any-node queue; every message is
//!   a task name and is run on the node's task pool;
//! - its control queue (kill / pause / resume);
//! - the local lifecycle events, which are forwarded to the broker.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::controller::Controller;
use super::task_runner::{register, run_registered};
use super::EngineContext;
use crate::broker::{Broker, handler};
use crate::dag::WorkerPool;
use crate::errors::{DagflowError, Result};
use crate::lifecycle::state::MSG_SYSTEM_ERR;
use crate::lifecycle::{ExecCode, State, Status, Transition};
use crate::types::ANY_NODE;

/// Default number of tasks a node runs at once.
pub const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    ctx: EngineContext,
    broker: Arc<dyn Broker>,
    pool: Arc<WorkerPool>,
    controller: Controller,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    event_subscription: Mutex<Option<Uuid>>,
}

/// Everything a dispatch callback needs, without a reference back to the node.
#[derive(Clone)]
struct Dispatcher {
    ctx: EngineContext,
    pool: Arc<WorkerPool>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    fn dispatch(&self, payload: &str, claim: bool) {
        let name = payload.trim().to_string();
        if name.is_empty() {
            return;
        }
        if claim {
            match self.claim(&name) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task = %name, "task owned by another node, ignoring");
                    return;
                }
                Err(e) => {
                    warn!(task = %name, error = %e, "cannot claim task");
                    return;
                }
            }
        }

        // Registered before queueing so control messages reach the task
        // while it waits for a pool slot.
        let handle = match register(&self.ctx, &name) {
            Ok(handle) => handle,
            Err(DagflowError::TaskBusy(_)) => {
                warn!(task = %name, "task is already scheduled on this node");
                return;
            }
            Err(e) => {
                warn!(task = %name, error = %e, "cannot schedule task");
                return;
            }
        };

        let ctx = self.ctx.clone();
        let pool = Arc::clone(&self.pool);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let job = {
                let ctx = ctx.clone();
                let handle = Arc::clone(&handle);
                let task = name.clone();
                async move {
                    // Scheduled after the shutdown sweep: settle it as killed.
                    if shutdown.is_cancelled() {
                        handle.kill();
                    }
                    run_registered(&ctx, &task, handle).await
                }
            };
            match pool.submit(job).await {
                Ok(state) => debug!(task = %name, state = %state, "task run returned"),
                Err(e) => {
                    ctx.handles.release(&handle);
                    error!(task = %name, error = %e, "task run failed");
                }
            }
        });
    }

    /// Record this node as owner of an any-node task.
    fn claim(&self, name: &str) -> Result<bool> {
        let node = self.ctx.node.clone();
        let mut claimed = false;
        self.ctx.lifecycle.storage().update_task(name, &mut |task| {
            claimed = task.node.is_empty() || task.node == node;
            if claimed {
                task.node = node.clone();
            }
            Ok(())
        })?;
        Ok(claimed)
    }
}

fn system_failure(status: &Status) -> Status {
    Status {
        state: State::Failed,
        old_state: status.state,
        code: ExecCode::SystemErr.code(),
        message: MSG_SYSTEM_ERR.to_string(),
        start_time: status.start_time,
        end_time: Some(Utc::now()),
    }
}

fn clear_dir(path: &std::path::Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "cleared leftover directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to clear leftover directory"),
    }
}

impl Node {
    /// Must be called inside a Tokio runtime.
    pub fn new(ctx: EngineContext, broker: Arc<dyn Broker>, pool_size: usize) -> Self {
        let shutdown = CancellationToken::new();
        let size = if pool_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            pool_size
        };
        Self {
            inner: Arc::new(NodeInner {
                controller: Controller::new(ctx.clone(), shutdown.clone()),
                pool: Arc::new(WorkerPool::new(format!("node-{}", ctx.node), size)),
                ctx,
                broker,
                shutdown,
                tasks: TaskTracker::new(),
                event_subscription: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.ctx.node
    }

    pub fn context(&self) -> &EngineContext {
        &self.inner.ctx
    }

    pub fn controller(&self) -> &Controller {
        &self.inner.controller
    }

    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let recovered = self.recover()?;
        if recovered > 0 {
            warn!(node = %inner.ctx.node, recovered, "failed tasks left unfinished by a previous run");
        }
        info!(
            node = %inner.ctx.node,
            pool = inner.pool.size(),
            executors = ?inner.ctx.executors.kinds(),
            "node starting"
        );

        let dispatcher = Dispatcher {
            ctx: inner.ctx.clone(),
            pool: Arc::clone(&inner.pool),
            tasks: inner.tasks.clone(),
            shutdown: inner.shutdown.clone(),
        };
        for (queue, claim) in [(inner.ctx.node.as_str(), false), (ANY_NODE, true)] {
            let dispatcher = dispatcher.clone();
            inner
                .broker
                .subscribe_task(
                    inner.shutdown.child_token(),
                    queue,
                    handler(move |payload| {
                        let dispatcher = dispatcher.clone();
                        async move { dispatcher.dispatch(&payload, claim) }
                    }),
                )
                .await?;
        }

        let controller = inner.controller.clone();
        inner
            .broker
            .subscribe_manager(
                inner.shutdown.child_token(),
                &inner.ctx.node,
                handler(move |payload| {
                    let controller = controller.clone();
                    async move {
                        if let Err(e) = controller.apply_payload(&payload) {
                            warn!(error = %e, "control message rejected");
                        }
                    }
                }),
            )
            .await?;

        self.forward_events();
        Ok(())
    }

    /// Publish local lifecycle events until shutdown. Losing one is fine.
    fn forward_events(&self) {
        let (id, mut events) = self.inner.ctx.lifecycle.events().subscribe();
        if let Ok(mut slot) = self.inner.event_subscription.lock() {
            *slot = Some(id);
        }
        let broker = Arc::clone(&self.inner.broker);
        let shutdown = self.inner.shutdown.clone();
        self.inner.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "cannot encode lifecycle event");
                        continue;
                    }
                };
                if let Err(e) = broker.publish_event(&payload).await {
                    debug!(task = %event.task, error = %e, "event not published");
                }
            }
        });
    }

    /// Fail tasks of this node (or unclaimed ones) that a previous process
    /// left non-terminal, and clear leftover script and workspace dirs.
    ///
    /// Returns how many tasks were failed.
    pub fn recover(&self) -> Result<usize> {
        let ctx = &self.inner.ctx;
        let storage = ctx.lifecycle.storage();
        let mut recovered = 0;

        for task in storage.node_tasks(&ctx.node) {
            if task.node == ctx.node {
                clear_dir(&ctx.script_dir(&task.name));
                clear_dir(&ctx.workspace_dir(&task.name));
            }
            if task.status.state.is_terminal() {
                continue;
            }
            // Unclaimed and pending: still waiting in the shared queue.
            if task.node.is_empty() && task.status.state == State::Pending {
                continue;
            }

            for step in storage.steps(&task.name)? {
                if matches!(step.status.state, State::Running | State::Paused) {
                    ctx.lifecycle
                        .force_step(&task.name, &step.name, system_failure(&step.status))?;
                }
            }
            let node = ctx.node.clone();
            storage.update_task(&task.name, &mut |t| {
                t.node = node.clone();
                Ok(())
            })?;
            ctx.lifecycle
                .force_task(&task.name, system_failure(&task.status))?;
            warn!(task = %task.name, state = %task.status.state, "task failed by recovery");
            recovered += 1;
        }
        Ok(recovered)
    }

    pub fn set_pool_size(&self, size: usize) {
        self.inner.pool.set_size(size.max(1));
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool.size()
    }

    /// Tasks waiting for a free slot in the node pool.
    pub fn queued_tasks(&self) -> usize {
        self.inner.pool.queue_length()
    }

    /// Kill every scheduled task, queued or running, then stop
    /// subscriptions and the pool.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!(node = %inner.ctx.node, "node shutting down");
        inner.shutdown.cancel();

        for name in inner.ctx.handles.live_tasks() {
            if let Some(handle) = inner.ctx.handles.task(&name) {
                handle.kill();
            }
            if let Err(e) = inner.ctx.lifecycle.task(&name, Transition::Kill) {
                debug!(task = %name, error = %e, "task not killed on shutdown");
            }
        }

        inner.tasks.close();
        inner.tasks.wait().await;
        inner.controller.close().await;
        inner.pool.close().await;

        let subscription = inner
            .event_subscription
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(id) = subscription {
            inner.ctx.lifecycle.events().unsubscribe(&id);
        }
        inner.broker.shutdown().await;
        info!(node = %inner.ctx.node, "node stopped");
    }
}
