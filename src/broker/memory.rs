// src/broker/memory.rs

//! In-process broker backend.
//!
//! - One bounded FIFO per dispatch queue; every subscriber of that queue
//!   competes for messages, so each message reaches exactly one of them.
//! - Events and control messages go through a topic bus: each subscriber
//!   owns a small buffer and every subscriber whose pattern matches the
//!   routing key gets a copy.
//! - Full buffers drop the new message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::wildcard::topic_matches;
use super::{BoxFuture, Broker, Handler, Routing};
use crate::errors::{DagflowError, Result};

pub const DIRECT_QUEUE_SIZE: usize = 2 << 16;
pub const TOPIC_BUFFER_SIZE: usize = 100;

struct DirectQueue {
    tx: mpsc::Sender<String>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
}

struct TopicSub {
    id: Uuid,
    pattern: String,
    tx: mpsc::Sender<String>,
}

struct Inner {
    routing: Routing,
    origin: String,
    direct_capacity: usize,
    directs: Mutex<HashMap<String, DirectQueue>>,
    topics: Mutex<Vec<TopicSub>>,
    closed: CancellationToken,
    tasks: TaskTracker,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Broker living entirely inside this process.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new(routing: Routing) -> Self {
        Self::with_capacity(routing, DIRECT_QUEUE_SIZE)
    }

    /// Broker whose dispatch queues hold at most `capacity` messages.
    pub fn with_capacity(routing: Routing, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                routing,
                origin: Uuid::new_v4().simple().to_string(),
                direct_capacity: capacity.max(1),
                directs: Mutex::new(HashMap::new()),
                topics: Mutex::new(Vec::new()),
                closed: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn routing(&self) -> &Routing {
        &self.inner.routing
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(DagflowError::BrokerClosed);
        }
        Ok(())
    }

    /// Messages waiting in a dispatch queue.
    pub fn queued(&self, node: &str) -> usize {
        let key = self.inner.routing.task_queue(node);
        lock(&self.inner.directs)
            .get(&key)
            .map(|q| q.tx.max_capacity() - q.tx.capacity())
            .unwrap_or(0)
    }

    /// Publish `payload` to every topic subscriber whose pattern matches `key`.
    pub fn publish_topic(&self, key: &str, payload: &str) -> Result<()> {
        self.ensure_open()?;
        let mut topics = lock(&self.inner.topics);
        topics.retain(|sub| !sub.tx.is_closed());
        for sub in topics.iter().filter(|s| topic_matches(&s.pattern, key)) {
            if sub.tx.try_send(payload.to_string()).is_err() {
                debug!(key, pattern = %sub.pattern, "topic buffer full; dropping message");
            }
        }
        Ok(())
    }

    /// Subscribe to every topic key matching `pattern`.
    pub fn subscribe_topic(&self, cancel: CancellationToken, pattern: &str, handler: Handler) -> Result<()> {
        self.ensure_open()?;
        let (tx, mut rx) = mpsc::channel::<String>(TOPIC_BUFFER_SIZE);
        let id = Uuid::new_v4();
        lock(&self.inner.topics).push(TopicSub {
            id,
            pattern: pattern.to_string(),
            tx,
        });

        let inner = Arc::clone(&self.inner);
        let pattern = pattern.to_string();
        self.inner.tasks.spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = inner.closed.cancelled() => break,
                    msg = rx.recv() => msg,
                };
                let Some(msg) = msg else { break };
                handler(msg).await;
            }
            lock(&inner.topics).retain(|s| s.id != id);
            debug!(pattern = %pattern, "topic subscription ended");
        });
        Ok(())
    }

    fn direct_queue(&self, key: &str) -> (mpsc::Sender<String>, Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>) {
        let mut directs = lock(&self.inner.directs);
        let queue = directs.entry(key.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.inner.direct_capacity);
            DirectQueue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        (queue.tx.clone(), Arc::clone(&queue.rx))
    }

    fn push_task(&self, node: &str, payload: &str) -> Result<()> {
        self.ensure_open()?;
        let key = self.inner.routing.task_queue(node);
        let (tx, _) = self.direct_queue(&key);
        match tx.try_send(payload.to_string()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(queue = %key, "dispatch queue full; dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(DagflowError::BrokerClosed),
        }
        Ok(())
    }
}

impl Broker for MemoryBroker {
    fn publish_task<'a>(&'a self, node: &'a str, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.push_task(node, payload) })
    }

    fn publish_task_delayed<'a>(
        &'a self,
        node: &'a str,
        payload: &'a str,
        delay: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let broker = self.clone();
            let node = node.to_string();
            let payload = payload.to_string();
            self.inner.tasks.spawn(async move {
                tokio::select! {
                    _ = broker.inner.closed.cancelled() => {
                        debug!(node = %node, "delayed publish cancelled by shutdown");
                    }
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = broker.push_task(&node, &payload) {
                            warn!(node = %node, error = %e, "delayed publish failed");
                        }
                    }
                }
            });
            Ok(())
        })
    }

    fn subscribe_task<'a>(
        &'a self,
        cancel: CancellationToken,
        node: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let key = self.inner.routing.task_queue(node);
            let (_, rx) = self.direct_queue(&key);
            let closed = self.inner.closed.clone();

            self.inner.tasks.spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = closed.cancelled() => break,
                        msg = async { rx.lock().await.recv().await } => msg,
                    };
                    let Some(msg) = msg else { break };
                    handler(msg).await;
                }
                debug!(queue = %key, "task subscription ended");
            });
            Ok(())
        })
    }

    fn publish_event<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = self.inner.routing.event_key(&self.inner.origin);
            self.publish_topic(&key, payload)
        })
    }

    fn subscribe_event(
        &self,
        cancel: CancellationToken,
        handler: Handler,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let pattern = self.inner.routing.event_pattern();
            self.subscribe_topic(cancel, &pattern, handler)
        })
    }

    fn publish_manager<'a>(&'a self, node: &'a str, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = self.inner.routing.manager_key(node);
            self.publish_topic(&key, payload)
        })
    }

    fn subscribe_manager<'a>(
        &'a self,
        cancel: CancellationToken,
        node: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = self.inner.routing.manager_key(node);
            self.subscribe_topic(cancel, &key, handler)
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.inner.closed.is_cancelled() {
                return;
            }
            self.inner.closed.cancel();
            self.inner.tasks.close();
            self.inner.tasks.wait().await;
            lock(&self.inner.directs).clear();
            lock(&self.inner.topics).clear();
            info!("broker shutdown complete");
        })
    }
}
