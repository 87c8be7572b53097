// src/engine/task_runner.rs

//! Runs one dispatched task on this node.
//!
//! The task's steps are rebuilt from storage into [`Unit`]s and driven
//! through a [`Dagcuter`]. Every step gets an execution handle that is a
//! child of the task handle, so a task kill or timeout reaches all running
//! executors and a paused task holds back steps that have not started.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EngineContext;
use crate::dag::dagcuter::BoxFuture;
use crate::dag::{ATTEMPT_KEY, Dagcuter, Outputs, RetryExecutor, RetryPolicy, Unit};
use crate::errors::{DagflowError, Result};
use crate::exec::{ExecContext, StepLog, split_kind};
use crate::lifecycle::state::{MSG_KILLED, MSG_SKIPPED, MSG_SYSTEM_ERR, MSG_TIMEOUT};
use crate::lifecycle::{CancelCause, ExecCode, ExecutionHandle, State, Status, Transition};
use crate::storage::{StepRecord, TaskRecord};

pub const MSG_SUCCEEDED: &str = "execution succeeded";
pub const MSG_UPSTREAM_FAILED: &str = "skipped, an upstream step did not succeed";

const GATE_RECHECK: Duration = Duration::from_millis(5);

/// Register the execution handles of task `name` and all of its steps.
///
/// Done when the task is dispatched to this node, before it waits for a
/// slot in the node pool, so control messages reach it while it is queued.
/// Fails with [`DagflowError::TaskBusy`] if the task already has a handle.
pub fn register(ctx: &EngineContext, name: &str) -> Result<Arc<ExecutionHandle>> {
    let steps = ctx.lifecycle.storage().steps(name)?;
    let handle = ctx
        .handles
        .register_task(name)
        .ok_or_else(|| DagflowError::TaskBusy(name.to_string()))?;
    for step in &steps {
        ctx.handles.register_step(&handle, &step.name);
    }
    Ok(handle)
}

/// Register task `name` and run it to a terminal state.
pub async fn run_task(ctx: &EngineContext, name: &str) -> Result<State> {
    let handle = register(ctx, name)?;
    run_registered(ctx, name, handle).await
}

/// Run a task whose handle came from [`register`] and release the handle.
///
/// Step failures are not errors here; they end up in the returned state.
/// A handle killed while the task was queued settles the task as killed
/// without running anything.
pub async fn run_registered(
    ctx: &EngineContext,
    name: &str,
    handle: Arc<ExecutionHandle>,
) -> Result<State> {
    let res = drive(ctx, name, &handle).await;
    ctx.handles.release(&handle);
    if let Err(e) = &res {
        error!(task = %name, error = %e, "task run aborted");
    }
    res
}

async fn drive(ctx: &EngineContext, name: &str, handle: &Arc<ExecutionHandle>) -> Result<State> {
    if handle.is_cancelled() {
        info!(task = %name, "task cancelled before it started");
        return settle_cancelled(ctx, name, handle);
    }

    let storage = Arc::clone(ctx.lifecycle.storage());
    let task = storage.task(name)?;
    let steps = storage.steps(name)?;

    if task.disable {
        ctx.lifecycle.task(name, Transition::Skip)?;
        for step in &steps {
            if let Err(e) = ctx.lifecycle.step(name, &step.name, Transition::Skip) {
                debug!(task = %name, step = %step.name, error = %e, "step not skipped");
            }
        }
        info!(task = %name, "task disabled, skipped");
        return Ok(State::Skipped);
    }

    if !start_task(ctx, name, handle).await? {
        if handle.is_cancelled() {
            return settle_cancelled(ctx, name, handle);
        }
        settle_leftovers(ctx, name, None);
        let current = storage.task(name)?;
        info!(task = %name, state = %current.status.state, "task did not start");
        return Ok(current.status.state);
    }
    info!(task = %name, kind = %task.kind, steps = steps.len(), "task started");

    let task = Arc::new(task);
    let mut units: HashMap<String, Arc<dyn Unit>> = HashMap::with_capacity(steps.len());
    for step in steps {
        let step_handle = ctx
            .handles
            .step(name, &step.name)
            .unwrap_or_else(|| ctx.handles.register_step(handle, &step.name));
        let unit = StepUnit::new(ctx.clone(), Arc::clone(&task), step, step_handle);
        units.insert(unit.step.name.clone(), Arc::new(unit));
    }

    let result = match Dagcuter::with_workers(units, ctx.dag_workers) {
        Ok(dag) => {
            let res = handle
                .run_with_deadline(Some(task.timeout), dag.execute(&handle.token()))
                .await;
            dag.close().await;
            debug!(task = %name, order = %dag.execution_order(), "step completion order");
            res.map(|_| ())
        }
        Err(e) => Err(e),
    };

    let cause = handle.cause();
    settle_leftovers(ctx, name, cause);
    finish(ctx, name, cause, result)
}

/// Settle a task that was cancelled before any of its steps ran.
fn settle_cancelled(ctx: &EngineContext, name: &str, handle: &ExecutionHandle) -> Result<State> {
    let cause = handle.cause().or(Some(CancelCause::Killed));
    settle_leftovers(ctx, name, cause);
    finish(ctx, name, cause, Ok(()))
}

/// Wait for the task's pause gate and move it to Running.
///
/// Only the controller opens and closes gates. It closes a gate before it
/// persists Paused, so a Paused record seen here with an open gate is a
/// resume about to land.
///
/// `Ok(false)` means the task was killed or otherwise settled before it
/// could start.
async fn start_task(ctx: &EngineContext, name: &str, handle: &ExecutionHandle) -> Result<bool> {
    loop {
        if !handle.wait_until_released().await {
            return Ok(false);
        }
        match ctx.lifecycle.task(name, Transition::Dispatch) {
            Ok(_) => return Ok(true),
            Err(DagflowError::InvalidTransition {
                from: State::Paused, ..
            }) => tokio::time::sleep(GATE_RECHECK).await,
            Err(DagflowError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

fn settled(status: &Status, state: State, code: i64, message: &str) -> Status {
    Status {
        state,
        old_state: status.state,
        code,
        message: message.to_string(),
        start_time: status.start_time,
        end_time: Some(Utc::now()),
    }
}

/// Move every step that never reached a terminal state to one.
fn settle_leftovers(ctx: &EngineContext, task: &str, cause: Option<CancelCause>) {
    let steps = match ctx.lifecycle.storage().steps(task) {
        Ok(steps) => steps,
        Err(e) => {
            warn!(task = %task, error = %e, "cannot load steps to settle");
            return;
        }
    };
    for step in steps.into_iter().filter(|s| !s.status.state.is_terminal()) {
        let res = match cause {
            Some(CancelCause::Killed) => ctx.lifecycle.step(task, &step.name, Transition::Kill),
            Some(CancelCause::Timeout) => ctx.lifecycle.force_step(
                task,
                &step.name,
                settled(&step.status, State::Failed, ExecCode::Timeout.code(), MSG_TIMEOUT),
            ),
            None => ctx.lifecycle.force_step(
                task,
                &step.name,
                settled(
                    &step.status,
                    State::Skipped,
                    ExecCode::Skipped.code(),
                    MSG_UPSTREAM_FAILED,
                ),
            ),
        };
        if let Err(e) = res {
            warn!(task = %task, step = %step.name, error = %e, "failed to settle step");
        }
    }
}

fn finish(
    ctx: &EngineContext,
    name: &str,
    cause: Option<CancelCause>,
    result: Result<()>,
) -> Result<State> {
    let transition = match (cause, &result) {
        (Some(CancelCause::Killed), _) => Transition::Kill,
        (Some(CancelCause::Timeout), _) => Transition::Complete {
            code: ExecCode::Timeout.code(),
            message: MSG_TIMEOUT.to_string(),
        },
        (None, Err(e)) => Transition::Complete {
            code: ExecCode::Failed.code(),
            message: e.to_string(),
        },
        (None, Ok(())) => Transition::Complete {
            code: ExecCode::Success.code(),
            message: MSG_SUCCEEDED.to_string(),
        },
    };
    match ctx.lifecycle.task(name, transition) {
        Ok(record) => {
            info!(
                task = %name,
                state = %record.status.state,
                code = record.status.code,
                "task finished"
            );
            Ok(record.status.state)
        }
        Err(DagflowError::InvalidTransition { from, .. }) => {
            debug!(task = %name, state = %from, "task already settled");
            Ok(from)
        }
        Err(e) => Err(e),
    }
}

/// One step as a dagcuter unit.
struct StepUnit {
    ctx: EngineContext,
    task: Arc<TaskRecord>,
    step: StepRecord,
    handle: Arc<ExecutionHandle>,
    log: StepLog,
    retry: Option<RetryPolicy>,
}

impl StepUnit {
    fn new(
        ctx: EngineContext,
        task: Arc<TaskRecord>,
        step: StepRecord,
        handle: Arc<ExecutionHandle>,
    ) -> Self {
        let log = StepLog::new(Arc::clone(ctx.lifecycle.storage()), &task.name, &step.name);
        // The task policy never applies to its steps.
        let retry = step.retry.or(ctx.default_retry);
        Self {
            ctx,
            task,
            step,
            handle,
            log,
            retry,
        }
    }

    fn max_attempts(&self) -> u32 {
        RetryExecutor::new(&self.step.name, self.retry)
            .policy()
            .max_attempts
            .max(1) as u32
    }

    fn cancelled(&self, attempt: u32) -> anyhow::Error {
        DagflowError::Cancelled {
            unit: self.step.name.clone(),
            attempt,
        }
        .into()
    }

    /// Wait for the pause gates and move the step to Running (or Skipped
    /// when disabled). Returns whether the step should run.
    async fn start(&self) -> Result<bool> {
        let (task, step) = (self.task.name.as_str(), self.step.name.as_str());
        loop {
            if !self.handle.wait_until_released().await {
                return Err(DagflowError::Cancelled {
                    unit: step.to_string(),
                    attempt: 1,
                });
            }
            let transition = if self.step.disable {
                Transition::Skip
            } else {
                Transition::Dispatch
            };
            match self.ctx.lifecycle.step(task, step, transition) {
                Ok(_) => return Ok(!self.step.disable),
                Err(DagflowError::InvalidTransition {
                    from: State::Paused, ..
                }) => tokio::time::sleep(GATE_RECHECK).await,
                Err(e) => return Err(e),
            }
        }
    }

    fn exec_context(&self) -> ExecContext {
        let (_, subcommand) = split_kind(&self.step.kind);
        let mut env = self.task.env.clone();
        env.extend(self.step.env.clone());
        ExecContext {
            task: self.task.name.clone(),
            step: self.step.name.clone(),
            subcommand,
            content: self.step.content.clone(),
            env,
            workspace: self.ctx.workspace_dir(&self.task.name),
            script_dir: self.ctx.script_dir(&self.task.name),
            log: self.log.clone(),
        }
    }

    /// One attempt: build the executor, run it under the step deadline and
    /// clear it. Returns the exit code and status message.
    async fn run_attempt(&self) -> (i64, String) {
        let (kind, _) = split_kind(&self.step.kind);
        let factory = match self.ctx.executors.get(&kind) {
            Ok(factory) => factory,
            Err(e) => return self.system_error(&anyhow!(e)),
        };
        let exec_ctx = self.exec_context();
        let executor = match std::panic::catch_unwind(AssertUnwindSafe(|| factory(exec_ctx))) {
            Ok(Ok(executor)) => executor,
            Ok(Err(e)) => return self.system_error(&e),
            Err(panic) => return self.recovered(panic),
        };

        let run = AssertUnwindSafe(executor.run(self.handle.token())).catch_unwind();
        let outcome = match self.handle.run_with_deadline(Some(self.step.timeout), run).await {
            Ok(Ok(code)) => (code, describe(code)),
            Ok(Err(e)) => self.system_error(&e),
            Err(panic) => self.recovered(panic),
        };

        if let Err(e) = executor.clear() {
            warn!(task = %self.task.name, step = %self.step.name, error = %e, "failed to clear executor");
        }

        match self.handle.cause() {
            Some(CancelCause::Killed) => (ExecCode::Killed.code(), MSG_KILLED.to_string()),
            Some(CancelCause::Timeout) => (ExecCode::Timeout.code(), MSG_TIMEOUT.to_string()),
            None => outcome,
        }
    }

    fn system_error(&self, e: &anyhow::Error) -> (i64, String) {
        error!(task = %self.task.name, step = %self.step.name, error = %format!("{e:#}"), "executor error");
        let message = format!("{MSG_SYSTEM_ERR}: {e:#}");
        self.log.write(&message);
        (ExecCode::SystemErr.code(), message)
    }

    fn recovered(&self, panic: Box<dyn Any + Send>) -> (i64, String) {
        let what = panic_message(panic.as_ref());
        let trace = Backtrace::force_capture();
        error!(task = %self.task.name, step = %self.step.name, panic = %what, "executor panicked\n{trace}");
        self.log.write(format!("panic: {what}\n{trace}"));
        (ExecCode::SystemErr.code(), MSG_SYSTEM_ERR.to_string())
    }

    fn complete(&self, code: i64, message: &str) {
        let transition = Transition::Complete {
            code,
            message: message.to_string(),
        };
        if let Err(e) = self
            .ctx
            .lifecycle
            .step(&self.task.name, &self.step.name, transition)
        {
            debug!(task = %self.task.name, step = %self.step.name, error = %e, "step completion not recorded");
        }
    }

    fn outputs(code: i64, message: &str) -> Outputs {
        Outputs::from([
            ("exit_code".to_string(), Value::from(code)),
            ("message".to_string(), Value::from(message)),
        ])
    }
}

fn describe(code: i64) -> String {
    if code == ExecCode::Success.code() {
        MSG_SUCCEEDED.to_string()
    } else {
        format!("exit status {code}")
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Unit for StepUnit {
    fn dependencies(&self) -> Vec<String> {
        self.step.depends.clone()
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }

    fn execute(
        &self,
        _cancel: CancellationToken,
        inputs: Outputs,
    ) -> BoxFuture<'_, anyhow::Result<Outputs>> {
        Box::pin(async move {
            let attempt = inputs
                .get(ATTEMPT_KEY)
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;

            if attempt == 1 {
                match self.start().await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(task = %self.task.name, step = %self.step.name, "step disabled, skipped");
                        return Ok(Self::outputs(ExecCode::Skipped.code(), MSG_SKIPPED));
                    }
                    Err(e) => {
                        debug!(task = %self.task.name, step = %self.step.name, error = %e, "step did not start");
                        return Err(self.cancelled(attempt));
                    }
                }
            } else {
                if self.handle.is_cancelled() {
                    return Err(self.cancelled(attempt));
                }
                self.log.write(format!("retry attempt {attempt}"));
            }

            let (code, message) = self.run_attempt().await;
            let class = ExecCode::from_code(code);
            let succeeded = matches!(class, ExecCode::Success | ExecCode::Skipped);
            let cancelled = self.handle.is_cancelled();

            if succeeded || cancelled || attempt >= self.max_attempts() {
                self.complete(code, &message);
            }
            if succeeded {
                return Ok(Self::outputs(code, &message));
            }
            if cancelled {
                return Err(self.cancelled(attempt));
            }
            Err(anyhow!(
                "step {}/{} failed: {message}",
                self.task.name,
                self.step.name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let err = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "boom 1");
        let err = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "static");
    }

    #[test]
    fn exit_codes_are_described() {
        assert_eq!(describe(0), MSG_SUCCEEDED);
        assert_eq!(describe(3), "exit status 3");
    }
}
