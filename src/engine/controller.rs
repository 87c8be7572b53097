// src/engine/controller.rs

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::EngineContext;
use crate::control::{ControlAction, ControlMessage};
use crate::errors::{DagflowError, Result};
use crate::lifecycle::{ExecutionHandle, Transition};

/// Applies kill / pause / resume messages to the live handles of this node.
///
/// Pause closes the handle's gate before the persisted state changes;
/// kill and resume persist first and then act on the handle. A timed pause
/// schedules its own resume, which is dropped if the pause is lifted
/// earlier or the node shuts down.
#[derive(Clone)]
pub struct Controller {
    ctx: EngineContext,
    timers: TaskTracker,
    shutdown: CancellationToken,
}

enum Target<'a> {
    Task(&'a str),
    Step(&'a str, &'a str),
}

impl Target<'_> {
    fn transition(&self, ctx: &EngineContext, transition: Transition) -> Result<()> {
        match *self {
            Target::Task(task) => ctx.lifecycle.task(task, transition).map(|_| ()),
            Target::Step(task, step) => ctx.lifecycle.step(task, step, transition).map(|_| ()),
        }
    }
}

impl std::fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Task(task) => f.write_str(task),
            Target::Step(task, step) => write!(f, "{task}/{step}"),
        }
    }
}

impl Controller {
    pub fn new(ctx: EngineContext, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            timers: TaskTracker::new(),
            shutdown,
        }
    }

    /// Decode and apply a raw control payload.
    pub fn apply_payload(&self, payload: &str) -> Result<()> {
        self.apply(&ControlMessage::parse(payload)?)
    }

    pub fn apply(&self, msg: &ControlMessage) -> Result<()> {
        let (target, handle) = match &msg.step {
            None => (
                Target::Task(&msg.task),
                self.ctx
                    .handles
                    .task(&msg.task)
                    .ok_or_else(|| DagflowError::TaskNotFound(msg.task.clone()))?,
            ),
            Some(step) => (
                Target::Step(&msg.task, step),
                self.ctx
                    .handles
                    .step(&msg.task, step)
                    .ok_or_else(|| DagflowError::StepNotFound {
                        task: msg.task.clone(),
                        step: step.clone(),
                    })?,
            ),
        };
        info!(entity = %target, action = %msg.action, duration = ?msg.duration, "control message");

        match msg.action {
            ControlAction::Kill => {
                handle.kill();
                target.transition(&self.ctx, Transition::Kill)
            }
            ControlAction::Pause => {
                // Gate first: work reading the persisted Paused state must
                // already find it closed.
                let (control, closed) = handle.try_pause();
                if let Err(e) = target.transition(&self.ctx, Transition::Pause) {
                    if closed {
                        handle.try_resume();
                    }
                    return Err(e);
                }
                if closed && !msg.duration.is_zero() {
                    self.schedule_resume(msg, handle, control, msg.duration);
                }
                Ok(())
            }
            ControlAction::Resume => {
                target.transition(&self.ctx, Transition::Resume)?;
                handle.try_resume();
                Ok(())
            }
        }
    }

    fn schedule_resume(
        &self,
        msg: &ControlMessage,
        handle: Arc<ExecutionHandle>,
        control: CancellationToken,
        after: Duration,
    ) {
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();
        let task = msg.task.clone();
        let step = msg.step.clone();

        self.timers.spawn(async move {
            tokio::select! {
                _ = control.cancelled() => {
                    debug!(task = %task, "pause lifted before its deadline");
                    return;
                }
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(after) => {}
            }
            let target = match &step {
                None => Target::Task(&task),
                Some(step) => Target::Step(&task, step),
            };
            info!(entity = %target, "pause duration elapsed, resuming");
            if let Err(e) = target.transition(&ctx, Transition::Resume) {
                warn!(entity = %target, error = %e, "automatic resume failed");
            }
            handle.try_resume();
        });
    }

    /// Stop scheduled resumes and wait for them to exit.
    pub async fn close(&self) {
        self.timers.close();
        self.timers.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::lifecycle::{EventEmitter, Lifecycle, State, Status};
    use crate::storage::{MemoryStorage, StepRecord, Storage, TaskRecord};
    use crate::types::TaskKind;

    fn context() -> EngineContext {
        let storage = MemoryStorage::new();
        storage
            .create_task(
                TaskRecord {
                    name: "t".into(),
                    kind: TaskKind::Dag,
                    node: "n1".into(),
                    timeout: Duration::from_secs(60),
                    retry: None,
                    disable: false,
                    env: BTreeMap::new(),
                    status: Status::pending(""),
                    created_at: Utc::now(),
                },
                vec![StepRecord {
                    task: "t".into(),
                    name: "s".into(),
                    seq: 1,
                    kind: "exec".into(),
                    content: String::new(),
                    timeout: Duration::from_secs(60),
                    retry: None,
                    disable: false,
                    env: BTreeMap::new(),
                    depends: vec![],
                    status: Status::pending(""),
                }],
            )
            .unwrap();
        let lifecycle = Lifecycle::new(Arc::new(storage), EventEmitter::new());
        EngineContext::new("n1", lifecycle, std::env::temp_dir())
    }

    fn task_state(ctx: &EngineContext) -> State {
        ctx.lifecycle.storage().task("t").unwrap().status.state
    }

    #[tokio::test]
    async fn messages_for_unknown_handles_are_rejected() {
        let ctx = context();
        let controller = Controller::new(ctx, CancellationToken::new());
        let kill = ControlMessage::task("t", ControlAction::Kill, Duration::ZERO);
        assert!(matches!(controller.apply(&kill), Err(DagflowError::TaskNotFound(_))));
        let step = ControlMessage::step("t", "s", ControlAction::Pause, Duration::ZERO);
        assert!(matches!(
            controller.apply(&step),
            Err(DagflowError::StepNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn pause_then_resume_restores_previous_state() {
        let ctx = context();
        let handle = ctx.handles.register_task("t").unwrap();
        let controller = Controller::new(ctx.clone(), CancellationToken::new());

        controller
            .apply(&ControlMessage::task("t", ControlAction::Pause, Duration::ZERO))
            .unwrap();
        assert_eq!(task_state(&ctx), State::Paused);
        assert!(handle.is_paused());

        // Pausing twice is a no-op.
        controller
            .apply(&ControlMessage::task("t", ControlAction::Pause, Duration::ZERO))
            .unwrap();

        controller
            .apply(&ControlMessage::task("t", ControlAction::Resume, Duration::ZERO))
            .unwrap();
        assert_eq!(task_state(&ctx), State::Pending);
        assert!(!handle.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_pause_resumes_by_itself() {
        let ctx = context();
        let handle = ctx.handles.register_task("t").unwrap();
        let controller = Controller::new(ctx.clone(), CancellationToken::new());

        controller
            .apply(&ControlMessage::task("t", ControlAction::Pause, Duration::from_secs(5)))
            .unwrap();
        assert!(handle.is_paused());

        tokio::time::sleep(Duration::from_secs(6)).await;
        controller.close().await;
        assert_eq!(task_state(&ctx), State::Pending);
        assert!(!handle.is_paused());
    }

    #[tokio::test]
    async fn rejected_pause_leaves_the_gate_open() {
        let ctx = context();
        let task = ctx.handles.register_task("t").unwrap();
        let step = ctx.handles.register_step(&task, "s");
        ctx.lifecycle.step("t", "s", Transition::Dispatch).unwrap();
        let controller = Controller::new(ctx.clone(), CancellationToken::new());

        let pause = ControlMessage::step("t", "s", ControlAction::Pause, Duration::from_secs(5));
        assert!(matches!(
            controller.apply(&pause),
            Err(DagflowError::InvalidTransition { .. })
        ));
        assert!(!step.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timed_pause_keeps_the_first_deadline() {
        let ctx = context();
        let handle = ctx.handles.register_task("t").unwrap();
        let controller = Controller::new(ctx.clone(), CancellationToken::new());

        controller
            .apply(&ControlMessage::task("t", ControlAction::Pause, Duration::from_secs(2)))
            .unwrap();
        // A repeated pause neither reopens the gate nor adds a timer.
        controller
            .apply(&ControlMessage::task("t", ControlAction::Pause, Duration::from_secs(60)))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(task_state(&ctx), State::Pending);
        assert!(!handle.is_paused());
        controller.close().await;
    }

    #[tokio::test]
    async fn kill_cancels_the_handle_and_fails_the_task() {
        let ctx = context();
        let handle = ctx.handles.register_task("t").unwrap();
        let controller = Controller::new(ctx.clone(), CancellationToken::new());

        controller
            .apply(&ControlMessage::task("t", ControlAction::Kill, Duration::ZERO))
            .unwrap();
        assert!(handle.is_cancelled());
        let task = ctx.lifecycle.storage().task("t").unwrap();
        assert_eq!(task.status.state, State::Failed);
        assert_eq!(task.status.code, -997);
    }
}
