// src/lifecycle/mod.rs

//! Task and step lifecycle.
//!
//! - [`state`] holds the state vocabulary, exit-code classes and the pure
//!   transition rules.
//! - [`handle`] is the in-memory side of a live execution (cancellation,
//!   pause gate).
//! - [`registry`] indexes live handles for control messages.
//! - [`machine`] persists transitions and emits [`events`].

pub mod events;
pub mod handle;
pub mod machine;
pub mod registry;
pub mod state;

pub use events::{EventEmitter, LifecycleEvent};
pub use handle::{CancelCause, ExecutionHandle};
pub use machine::Lifecycle;
pub use registry::HandleRegistry;
pub use state::{ExecCode, Scope, State, Status, Transition};
