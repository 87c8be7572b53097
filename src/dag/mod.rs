// src/dag/mod.rs

//! Dependency-graph execution.
//!
//! - [`graph`] validates unit dependencies and indexes both edge directions.
//! - [`retry`] runs a unit attempt with exponential backoff between failures.
//! - [`pool`] is the bounded worker pool every unit runs on.
//! - [`dagcuter`] drives a set of units through the pool in dependency order.

pub mod dagcuter;
pub mod graph;
pub mod pool;
pub mod retry;

pub use dagcuter::{ATTEMPT_KEY, Dagcuter, FailureMode, Outputs, Unit};
pub use graph::DagGraph;
pub use pool::WorkerPool;
pub use retry::{RetryExecutor, RetryPolicy};
