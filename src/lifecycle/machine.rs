// src/lifecycle/machine.rs

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use super::events::{EventEmitter, LifecycleEvent};
use super::state::{Scope, Status, Transition};
use crate::errors::Result;
use crate::storage::{StepRecord, Storage, TaskRecord};

/// Writes lifecycle transitions through storage and announces them.
///
/// Each transition is checked against the record's current persisted state
/// inside the storage update, so the execution path and the control path
/// never overwrite each other's changes.
#[derive(Clone)]
pub struct Lifecycle {
    storage: Arc<dyn Storage>,
    events: EventEmitter,
}

impl Lifecycle {
    pub fn new(storage: Arc<dyn Storage>, events: EventEmitter) -> Self {
        Self { storage, events }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn task(&self, name: &str, transition: Transition) -> Result<TaskRecord> {
        let mut changed = false;
        let record = self.storage.update_task(name, &mut |task| {
            changed = task.status.apply(name, Scope::Task, &transition)?;
            Ok(())
        })?;
        if changed {
            debug!(task = %name, state = %record.status.state, "task transition");
            self.announce(name, None, &record.status);
        }
        Ok(record)
    }

    pub fn step(&self, task: &str, step: &str, transition: Transition) -> Result<StepRecord> {
        let entity = format!("{task}/{step}");
        let mut changed = false;
        let record = self.storage.update_step(task, step, &mut |s| {
            changed = s.status.apply(&entity, Scope::Step, &transition)?;
            Ok(())
        })?;
        if changed {
            debug!(task = %task, step = %step, state = %record.status.state, "step transition");
            self.announce(task, Some(step), &record.status);
        }
        Ok(record)
    }

    /// Overwrite a status without transition checks. Used for recovery.
    pub fn force_step(&self, task: &str, step: &str, status: Status) -> Result<StepRecord> {
        let record = self.storage.update_step(task, step, &mut |s| {
            s.status = status.clone();
            Ok(())
        })?;
        self.announce(task, Some(step), &record.status);
        Ok(record)
    }

    pub fn force_task(&self, name: &str, status: Status) -> Result<TaskRecord> {
        let record = self.storage.update_task(name, &mut |t| {
            t.status = status.clone();
            Ok(())
        })?;
        self.announce(name, None, &record.status);
        Ok(record)
    }

    fn announce(&self, task: &str, step: Option<&str>, status: &Status) {
        self.events.emit(LifecycleEvent {
            task: task.to_string(),
            step: step.map(str::to_string),
            state: status.state,
            code: status.code,
            message: status.message.clone(),
            time: Utc::now(),
        });
    }
}
