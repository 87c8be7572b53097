// src/lifecycle/registry.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::ExecutionHandle;

/// Live execution handles, addressed by task name or by (task, step).
#[derive(Default)]
pub struct HandleRegistry {
    tasks: Mutex<HashMap<String, Arc<ExecutionHandle>>>,
    steps: Mutex<HashMap<(String, String), Arc<ExecutionHandle>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task handle. Returns `None` if the task already has one.
    pub fn register_task(&self, task: &str) -> Option<Arc<ExecutionHandle>> {
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(task) {
            return None;
        }
        let handle = ExecutionHandle::new(task);
        tasks.insert(task.to_string(), Arc::clone(&handle));
        Some(handle)
    }

    pub fn register_step(&self, task: &Arc<ExecutionHandle>, step: &str) -> Arc<ExecutionHandle> {
        let handle = task.child(format!("{}/{}", task.name(), step));
        lock(&self.steps).insert((task.name().to_string(), step.to_string()), Arc::clone(&handle));
        handle
    }

    pub fn task(&self, task: &str) -> Option<Arc<ExecutionHandle>> {
        lock(&self.tasks).get(task).cloned()
    }

    pub fn step(&self, task: &str, step: &str) -> Option<Arc<ExecutionHandle>> {
        lock(&self.steps)
            .get(&(task.to_string(), step.to_string()))
            .cloned()
    }

    /// Drop `handle` and its step handles, unless the task has since been
    /// registered again under a new handle.
    pub fn release(&self, handle: &Arc<ExecutionHandle>) {
        let mut tasks = lock(&self.tasks);
        let name = handle.name();
        if !tasks.get(name).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            return;
        }
        tasks.remove(name);
        lock(&self.steps).retain(|(t, _), _| t != name);
    }

    pub fn live_tasks(&self) -> Vec<String> {
        lock(&self.tasks).keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_handle_per_live_task() {
        let reg = HandleRegistry::new();
        let t = reg.register_task("t").unwrap();
        assert!(reg.register_task("t").is_none());

        let s = reg.register_step(&t, "a");
        assert!(Arc::ptr_eq(&reg.step("t", "a").unwrap(), &s));

        reg.release(&t);
        assert!(reg.task("t").is_none());
        assert!(reg.step("t", "a").is_none());
        assert!(reg.register_task("t").is_some());
    }

    #[test]
    fn stale_handle_does_not_release_a_newer_one() {
        let reg = HandleRegistry::new();
        let old = reg.register_task("t").unwrap();
        reg.release(&old);
        assert!(reg.task("t").is_none());

        let new = reg.register_task("t").unwrap();
        reg.register_step(&new, "a");
        reg.release(&old);
        assert!(Arc::ptr_eq(&reg.task("t").unwrap(), &new));
        assert!(reg.step("t", "a").is_some());
    }
}
