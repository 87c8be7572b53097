// src/exec/registry.rs

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{DagflowError, Result};

use super::{ExecContext, StepExecutor};

/// Kind used when a step names an executor nobody registered.
pub const FALLBACK_KIND: &str = "exec";

pub type ExecutorFactory =
    Arc<dyn Fn(ExecContext) -> anyhow::Result<Box<dyn StepExecutor>> + Send + Sync>;

/// Split `type@subcommand` into a lowercase kind and the subcommand.
///
/// Without `@` the kind doubles as the subcommand, so `type = "bash"` falls
/// back to `exec` and runs under bash.
pub fn split_kind(spec: &str) -> (String, String) {
    let (kind, sub) = spec.split_once('@').unwrap_or((spec, ""));
    let kind = kind.trim().to_lowercase();
    let sub = sub.trim();
    if sub.is_empty() {
        (kind.clone(), kind)
    } else {
        (kind, sub.to_string())
    }
}

/// Executor factories keyed by lowercase kind.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    factories: HashMap<String, ExecutorFactory>,
}

impl ExecutorRegistry {
    /// An empty registry. Most callers want [`with_builtins`](Self::with_builtins).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(FALLBACK_KIND, super::command::factory);
        registry.register("mkdir", super::mkdir::factory);
        registry.register("touch", super::touch::factory);
        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(ExecContext) -> anyhow::Result<Box<dyn StepExecutor>> + Send + Sync + 'static,
    {
        self.factories
            .insert(kind.trim().to_lowercase(), Arc::new(factory));
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Factory for `kind`, falling back to [`FALLBACK_KIND`].
    pub fn get(&self, kind: &str) -> Result<ExecutorFactory> {
        self.factories
            .get(&kind.trim().to_lowercase())
            .or_else(|| self.factories.get(FALLBACK_KIND))
            .cloned()
            .ok_or_else(|| DagflowError::UnknownExecutor(kind.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_spec_is_split_and_lowercased() {
        assert_eq!(split_kind("EXEC@bash"), ("exec".into(), "bash".into()));
        assert_eq!(split_kind("bash"), ("bash".into(), "bash".into()));
    }

    #[test]
    fn unknown_kinds_fall_back_to_exec() {
        let registry = ExecutorRegistry::with_builtins();
        assert_eq!(registry.kinds(), vec!["exec", "mkdir", "touch"]);
        assert!(registry.get("docker").is_ok());
        assert!(matches!(
            ExecutorRegistry::new().get("docker"),
            Err(DagflowError::UnknownExecutor(_))
        ));
    }
}
