// src/lifecycle/events.rs

//! Local fan-out of lifecycle events.
//!
//! Every subscriber gets its own bounded buffer. A slow subscriber loses
//! events instead of holding up the state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use super::State;

pub const EVENT_BUFFER: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub state: State,
    pub code: i64,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct EventEmitter {
    subscribers: Arc<Mutex<HashMap<Uuid, mpsc::Sender<LifecycleEvent>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<Uuid, mpsc::Sender<LifecycleEvent>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let id = Uuid::new_v4();
        self.subscribers().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        self.subscribers().remove(id);
    }

    /// Deliver to every subscriber without waiting.
    pub fn emit(&self, event: LifecycleEvent) {
        let mut subs = self.subscribers();
        subs.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(subscriber = %id, task = %event.task, "event buffer full; dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: usize) -> LifecycleEvent {
        LifecycleEvent {
            task: format!("t{n}"),
            step: None,
            state: State::Running,
            code: 0,
            message: String::new(),
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let emitter = EventEmitter::new();
        let (_id, mut rx) = emitter.subscribe();
        for n in 0..EVENT_BUFFER + 10 {
            emitter.emit(event(n));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, EVENT_BUFFER);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let emitter = EventEmitter::new();
        let (_id, rx) = emitter.subscribe();
        drop(rx);
        emitter.emit(event(1));
        assert!(emitter.subscribers().is_empty());
    }
}
