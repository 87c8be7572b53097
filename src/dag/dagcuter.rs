// src/dag/dagcuter.rs

//! Dependency-graph executor ("dagcuter").
//!
//! Owns a set of named [`Unit`]s, validates their dependency edges up front
//! and then drives them through a shared [`WorkerPool`]:
//!
//! - every unit whose dependencies are all done is submitted to the pool;
//! - a finished unit stores its output, then each dependent's in-degree is
//!   decremented and dependents reaching zero are submitted with the outputs
//!   of their dependencies as input;
//! - the first unit error is returned to the caller straight away. Units that
//!   are already running keep going unless [`FailureMode::CancelSiblings`]
//!   was selected; [`Dagcuter::drain`] waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::dag::graph::DagGraph;
use crate::dag::pool::WorkerPool;
use crate::dag::retry::{RetryExecutor, RetryPolicy};
use crate::errors::{DagflowError, Result, Stage};

/// Input and output maps exchanged between units.
pub type Outputs = HashMap<String, Value>;

/// Reserved input key carrying the current attempt number (1-indexed).
pub const ATTEMPT_KEY: &str = "attempt";

pub const DEFAULT_WORKERS: usize = 150;
pub const MAX_WORKERS: usize = 1000;

/// A schedulable piece of work with declared dependencies.
///
/// `inputs` holds one entry per dependency (keyed by the dependency's name,
/// valued by its output as a JSON object) plus [`ATTEMPT_KEY`].
pub trait Unit: Send + Sync + 'static {
    fn dependencies(&self) -> Vec<String>;

    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    fn pre_execution<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        _inputs: &'a mut Outputs,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn execute(
        &self,
        cancel: CancellationToken,
        inputs: Outputs,
    ) -> BoxFuture<'_, anyhow::Result<Outputs>>;

    fn post_execution<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        _outputs: &'a mut Outputs,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// What happens to in-flight units when one unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Return the first error; running units finish on their own.
    #[default]
    Continue,
    /// Return the first error and cancel every in-flight unit.
    CancelSiblings,
}

#[derive(Default)]
struct RunBook {
    in_degrees: HashMap<String, usize>,
    results: HashMap<String, Outputs>,
    order: Vec<String>,
}

pub struct Dagcuter {
    units: HashMap<String, Arc<dyn Unit>>,
    graph: DagGraph,
    pool: Arc<WorkerPool>,
    failure_mode: FailureMode,
    book: Mutex<RunBook>,
    in_flight: TaskTracker,
}

/// Clamp a requested worker count: `<= 0` means the default, anything above
/// [`MAX_WORKERS`] is capped.
pub fn effective_workers(requested: i64) -> usize {
    if requested <= 0 {
        DEFAULT_WORKERS
    } else {
        (requested as usize).min(MAX_WORKERS)
    }
}

impl Dagcuter {
    pub fn new(units: HashMap<String, Arc<dyn Unit>>) -> Result<Self> {
        Self::with_workers(units, DEFAULT_WORKERS as i64)
    }

    /// Build the dependency index and reject cycles before anything runs.
    pub fn with_workers(units: HashMap<String, Arc<dyn Unit>>, workers: i64) -> Result<Self> {
        let graph = DagGraph::from_dependencies(
            units
                .iter()
                .map(|(name, unit)| (name.clone(), unit.dependencies())),
        )?;
        let workers = effective_workers(workers);
        debug!(units = graph.len(), workers, "dagcuter built");

        Ok(Self {
            units,
            graph,
            pool: Arc::new(WorkerPool::new("dagcuter", workers)),
            failure_mode: FailureMode::default(),
            book: Mutex::new(RunBook::default()),
            in_flight: TaskTracker::new(),
        })
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    fn book(&self) -> MutexGuard<'_, RunBook> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run every unit respecting dependencies and return all outputs.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<HashMap<String, Outputs>> {
        let total = self.graph.len();
        {
            let mut book = self.book();
            *book = RunBook {
                in_degrees: self.graph.in_degrees(),
                ..RunBook::default()
            };
        }
        if total == 0 {
            return Ok(HashMap::new());
        }

        let run_token = cancel.child_token();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, Result<Outputs>)>();

        for root in self.graph.roots() {
            self.dispatch(root, Outputs::new(), &run_token, done_tx.clone());
        }

        let mut completed = 0usize;
        while completed < total {
            let Some((name, res)) = done_rx.recv().await else {
                break;
            };

            match res {
                Ok(output) => {
                    completed += 1;
                    debug!(unit = %name, completed, total, "unit finished");
                    for (next, inputs) in self.complete(&name, output) {
                        self.dispatch(next, inputs, &run_token, done_tx.clone());
                    }
                }
                Err(err) => {
                    warn!(unit = %name, error = %err, "unit failed; stopping graph execution");
                    if self.failure_mode == FailureMode::CancelSiblings {
                        run_token.cancel();
                    }
                    return Err(err);
                }
            }
        }

        info!(units = total, "graph execution finished");
        Ok(self.book().results.clone())
    }

    /// Record a finished unit and collect dependents that became ready.
    fn complete(&self, name: &str, output: Outputs) -> Vec<(String, Outputs)> {
        let mut guard = self.book();
        let book = &mut *guard;
        book.order.push(name.to_string());
        book.results.insert(name.to_string(), output);

        let mut ready = Vec::new();
        for dependent in self.graph.dependents_of(name) {
            let Some(degree) = book.in_degrees.get_mut(dependent) else {
                continue;
            };
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                let inputs: Outputs = self
                    .graph
                    .dependencies_of(dependent)
                    .iter()
                    .filter_map(|dep| {
                        book.results
                            .get(dep)
                            .map(|out| (dep.clone(), Value::Object(out.clone().into_iter().collect())))
                    })
                    .collect();
                ready.push((dependent.clone(), inputs));
            }
        }
        ready
    }

    fn dispatch(
        &self,
        name: String,
        inputs: Outputs,
        run_token: &CancellationToken,
        done_tx: mpsc::UnboundedSender<(String, Result<Outputs>)>,
    ) {
        let Some(unit) = self.units.get(&name).map(Arc::clone) else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let token = run_token.clone();

        self.in_flight.spawn(async move {
            let res = pool.submit(run_unit(name.clone(), unit, token, inputs)).await;
            let _ = done_tx.send((name, res));
        });
    }

    /// Wait for units still running after an early return from `execute`.
    pub async fn drain(&self) {
        self.in_flight.close();
        self.in_flight.wait().await;
        self.in_flight.reopen();
    }

    /// Drain in-flight units and shut the worker pool down.
    pub async fn close(&self) {
        self.drain().await;
        self.pool.close().await;
    }

    /// Grow the pool. Requests at or below the current size are ignored.
    pub fn resize_workers(&self, workers: usize) {
        let target = workers.min(MAX_WORKERS);
        if target > self.pool.size() {
            self.pool.set_size(target);
        }
    }

    /// Number of units waiting for a free worker.
    pub fn worker_status(&self) -> usize {
        self.pool.queue_length()
    }

    pub fn workers(&self) -> usize {
        self.pool.size()
    }

    /// Completion order of the last execution, one `N. name` line per unit.
    pub fn execution_order(&self) -> String {
        self.book()
            .order
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{}. {}", i + 1, name))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn completed_units(&self) -> Vec<String> {
        self.book().order.clone()
    }

    /// Render the graph as a tree starting at its roots.
    pub fn print_graph(&self) -> String {
        self.graph.render_tree()
    }
}

async fn run_unit(
    name: String,
    unit: Arc<dyn Unit>,
    cancel: CancellationToken,
    mut inputs: Outputs,
) -> Result<Outputs> {
    unit.pre_execution(&cancel, &mut inputs)
        .await
        .map_err(|source| DagflowError::Stage {
            stage: Stage::Pre,
            source,
        })?;

    let retry = RetryExecutor::new(name.as_str(), unit.retry_policy());
    let mut output = retry
        .execute(&cancel, |attempt| {
            let mut attempt_inputs = inputs.clone();
            attempt_inputs.insert(ATTEMPT_KEY.to_string(), Value::from(attempt));
            unit.execute(cancel.clone(), attempt_inputs)
        })
        .await
        .map_err(|err| DagflowError::Stage {
            stage: Stage::Execute,
            source: err.into(),
        })?;

    unit.post_execution(&cancel, &mut output)
        .await
        .map_err(|source| DagflowError::Stage {
            stage: Stage::Post,
            source,
        })?;

    Ok(output)
}
