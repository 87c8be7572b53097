// src/lib.rs

pub mod broker;
pub mod cli;
pub mod config;
pub mod control;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod lifecycle;
pub mod logging;
pub mod storage;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, error, info};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::dag::DagGraph;
use crate::engine::{EngineContext, Node, TaskService};
use crate::lifecycle::{EventEmitter, Lifecycle, State};
use crate::storage::{MemoryStorage, Storage};
use crate::types::TaskKind;

/// How often `--once` checks whether every task has finished.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and CLI overrides
/// - storage, broker and the local worker node
/// - task submission
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let mut cfg = load_and_validate(&config_path)?;
    apply_overrides(&mut cfg, &args);

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(());
    }

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let lifecycle = Lifecycle::new(Arc::clone(&storage), EventEmitter::new());
    let broker = broker::connect(&cfg.node.broker_url, &cfg.node.service).await?;

    let ctx = EngineContext::new(cfg.node.name.clone(), lifecycle, cfg.node.root_dir.clone())
        .with_dag_workers(cfg.node.dag_workers)
        .with_default_retry(cfg.default_retry);
    let node = Node::new(ctx, Arc::clone(&broker), cfg.node.pool_size);
    node.start().await?;

    let service = TaskService::new(Arc::clone(&storage), broker, cfg.node.exec_timeout)?;
    let mut submitted = Vec::with_capacity(cfg.tasks.len());
    let mut rejected = 0usize;
    for spec in cfg.tasks.iter().cloned() {
        let requested = spec.name.clone();
        match service.submit(spec).await {
            Ok(name) => submitted.push(name),
            Err(e) => {
                error!(task = %requested, error = %e, "submission rejected");
                rejected += 1;
            }
        }
    }
    info!(submitted = submitted.len(), rejected, "tasks submitted");

    let outcome = if args.once {
        tokio::select! {
            res = wait_for_tasks(&service, &submitted) => res.map(|failed| failed + rejected),
            res = tokio::signal::ctrl_c() => res.map(|_| 0).map_err(anyhow::Error::from),
        }
    } else {
        info!("running until Ctrl+C");
        tokio::signal::ctrl_c().await.map(|_| 0).map_err(anyhow::Error::from)
    };

    node.shutdown().await;
    match outcome? {
        0 => Ok(()),
        failed => bail!("{failed} task(s) did not succeed"),
    }
}

fn apply_overrides(cfg: &mut ConfigFile, args: &CliArgs) {
    if let Some(name) = &args.node_name {
        cfg.node.name = name.clone();
    }
    if let Some(size) = args.pool_size {
        cfg.node.pool_size = size.max(1);
    }
    if let Some(url) = &args.broker_url {
        cfg.node.broker_url = url.clone();
    }
}

/// Poll storage until every task is terminal, print a summary and return
/// the number of tasks that did not succeed.
async fn wait_for_tasks(service: &TaskService, names: &[String]) -> Result<usize> {
    loop {
        let mut pending = 0usize;
        for name in names {
            if !service.detail(name)?.task.status.state.is_terminal() {
                pending += 1;
            }
        }
        if pending == 0 {
            break;
        }
        debug!(pending, "waiting for tasks");
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let mut failed = 0usize;
    println!("dagflow summary");
    for name in names {
        let detail = service.detail(name)?;
        let state = detail.task.status.state;
        if state == State::Failed {
            failed += 1;
        }
        println!("  {name}: {state} ({})", detail.summary());
        for step in &detail.steps {
            println!(
                "      {}: {} code={} {}",
                step.name, step.status.state, step.status.code, step.status.message
            );
        }
    }
    Ok(failed)
}

/// Print each task's step graph without running anything.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    println!("dagflow dry-run");
    println!("  node.name = {}", cfg.node.name);
    println!("  node.pool_size = {}", cfg.node.pool_size);
    println!("  node.broker_url = {}", cfg.node.broker_url);
    println!();

    println!("tasks ({}):", cfg.tasks.len());
    for task in &cfg.tasks {
        println!("  - {} [{}]", task.name, task.kind);
        let mut previous: Option<&str> = None;
        let edges = task.steps.iter().map(|step| {
            let depends: Vec<String> = match task.kind {
                TaskKind::Dag => step.depends.clone(),
                TaskKind::Chain => previous.iter().map(|p| p.to_string()).collect(),
            };
            previous = Some(step.name.as_str());
            (step.name.clone(), depends)
        });
        let graph = DagGraph::from_dependencies(edges.collect::<Vec<_>>())?;
        for line in graph.render_tree().lines() {
            println!("      {line}");
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
