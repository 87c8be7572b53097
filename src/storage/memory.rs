// src/storage/memory.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use super::{LogLine, StepRecord, StepUpdate, Storage, TaskRecord, TaskUpdate};
use crate::errors::{DagflowError, Result};

struct Entry {
    task: TaskRecord,
    steps: Vec<StepRecord>,
    logs: HashMap<String, Vec<LogLine>>,
}

/// Process-local storage backend. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn step_not_found(task: &str, step: &str) -> DagflowError {
    DagflowError::StepNotFound {
        task: task.to_string(),
        step: step.to_string(),
    }
}

impl Storage for MemoryStorage {
    fn create_task(&self, task: TaskRecord, mut steps: Vec<StepRecord>) -> Result<()> {
        steps.sort_by_key(|s| s.seq);
        let name = task.name.clone();
        self.write().insert(
            name,
            Entry {
                task,
                steps,
                logs: HashMap::new(),
            },
        );
        Ok(())
    }

    fn task(&self, name: &str) -> Result<TaskRecord> {
        self.read()
            .get(name)
            .map(|e| e.task.clone())
            .ok_or_else(|| DagflowError::TaskNotFound(name.to_string()))
    }

    fn tasks(&self) -> Vec<TaskRecord> {
        self.read().values().map(|e| e.task.clone()).collect()
    }

    fn node_tasks(&self, node: &str) -> Vec<TaskRecord> {
        self.read()
            .values()
            .filter(|e| e.task.node.is_empty() || e.task.node == node)
            .map(|e| e.task.clone())
            .collect()
    }

    fn update_task(&self, name: &str, update: TaskUpdate<'_>) -> Result<TaskRecord> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| DagflowError::TaskNotFound(name.to_string()))?;

        let mut draft = entry.task.clone();
        update(&mut draft)?;
        entry.task = draft.clone();
        Ok(draft)
    }

    fn remove_task(&self, name: &str) -> Result<()> {
        self.write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DagflowError::TaskNotFound(name.to_string()))
    }

    fn step(&self, task: &str, step: &str) -> Result<StepRecord> {
        let entries = self.read();
        let entry = entries
            .get(task)
            .ok_or_else(|| DagflowError::TaskNotFound(task.to_string()))?;
        entry
            .steps
            .iter()
            .find(|s| s.name == step)
            .cloned()
            .ok_or_else(|| step_not_found(task, step))
    }

    fn steps(&self, task: &str) -> Result<Vec<StepRecord>> {
        self.read()
            .get(task)
            .map(|e| e.steps.clone())
            .ok_or_else(|| DagflowError::TaskNotFound(task.to_string()))
    }

    fn update_step(&self, task: &str, step: &str, update: StepUpdate<'_>) -> Result<StepRecord> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(task)
            .ok_or_else(|| DagflowError::TaskNotFound(task.to_string()))?;
        let record = entry
            .steps
            .iter_mut()
            .find(|s| s.name == step)
            .ok_or_else(|| step_not_found(task, step))?;

        let mut draft = record.clone();
        update(&mut draft)?;
        *record = draft.clone();
        Ok(draft)
    }

    fn append_log(&self, task: &str, step: &str, line: &str) -> Result<()> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(task)
            .ok_or_else(|| DagflowError::TaskNotFound(task.to_string()))?;
        if !entry.steps.iter().any(|s| s.name == step) {
            return Err(step_not_found(task, step));
        }
        entry.logs.entry(step.to_string()).or_default().push(LogLine {
            time: Utc::now(),
            line: line.to_string(),
        });
        Ok(())
    }

    fn step_log(&self, task: &str, step: &str) -> Result<Vec<LogLine>> {
        let entries = self.read();
        let entry = entries
            .get(task)
            .ok_or_else(|| DagflowError::TaskNotFound(task.to_string()))?;
        if !entry.steps.iter().any(|s| s.name == step) {
            return Err(step_not_found(task, step));
        }
        Ok(entry.logs.get(step).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::lifecycle::{Scope, State, Status, Transition};
    use crate::types::TaskKind;

    fn task(name: &str) -> TaskRecord {
        TaskRecord {
            name: name.to_string(),
            kind: TaskKind::Dag,
            node: String::new(),
            timeout: Duration::from_secs(60),
            retry: None,
            disable: false,
            env: BTreeMap::new(),
            status: Status::pending("waiting"),
            created_at: Utc::now(),
        }
    }

    fn step(task: &str, name: &str, seq: u32) -> StepRecord {
        StepRecord {
            task: task.to_string(),
            name: name.to_string(),
            seq,
            kind: "exec".to_string(),
            content: "true".to_string(),
            timeout: Duration::from_secs(60),
            retry: None,
            disable: false,
            env: BTreeMap::new(),
            depends: vec![],
            status: Status::pending("waiting"),
        }
    }

    #[test]
    fn failed_update_leaves_record_untouched() {
        let store = MemoryStorage::new();
        store
            .create_task(task("t"), vec![step("t", "a", 1)])
            .unwrap();

        let res = store.update_step("t", "a", &mut |s| {
            s.status.message = "half written".into();
            s.status.apply("t/a", Scope::Step, &Transition::Resume)?;
            s.status.apply("t/a", Scope::Step, &Transition::Dispatch)?;
            s.status.apply("t/a", Scope::Step, &Transition::Pause)?;
            Ok(())
        });
        assert!(res.is_err());

        let a = store.step("t", "a").unwrap();
        assert_eq!(a.status.state, State::Pending);
        assert_eq!(a.status.message, "waiting");
    }

    #[test]
    fn steps_come_back_in_sequence_order() {
        let store = MemoryStorage::new();
        store
            .create_task(task("t"), vec![step("t", "b", 2), step("t", "a", 1)])
            .unwrap();
        let names: Vec<String> = store.steps("t").unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.step_states("t").unwrap()["b"], State::Pending);
    }

    #[test]
    fn logs_are_scoped_to_existing_steps() {
        let store = MemoryStorage::new();
        store.create_task(task("t"), vec![step("t", "a", 1)]).unwrap();
        store.append_log("t", "a", "hello").unwrap();
        assert!(store.append_log("t", "ghost", "x").is_err());
        assert_eq!(store.step_log("t", "a").unwrap()[0].line, "hello");
        store.remove_task("t").unwrap();
        assert!(matches!(store.task("t"), Err(DagflowError::TaskNotFound(_))));
    }
}
