// src/broker/mod.rs

//! Messaging abstraction used for dispatch, events and control messages.
//!
//! - Task dispatch goes to exactly one consumer group per node name; the
//!   [`ANY_NODE`](crate::types::ANY_NODE) group is shared by every node.
//! - Delayed dispatch is never delivered before its delay.
//! - Events are best-effort fan-out to every event subscriber.
//! - Control messages are addressed to a single node.
//!
//! [`memory`] keeps everything in-process; [`amqp`] (feature `amqp`) maps the
//! same contract onto RabbitMQ exchanges and queues.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod wildcard;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{DagflowError, Result};

pub use memory::MemoryBroker;

/// Per-message callback. Each subscription awaits its handler before taking
/// the next message.
pub type Handler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

pub const DEFAULT_SERVICE: &str = "dagflow";

/// Routing keys, queue and exchange names derived from a service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    service: String,
}

impl Routing {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn task_routing_key(&self) -> String {
        format!("{}.task", self.service)
    }

    pub fn event_routing_key(&self) -> String {
        format!("{}.event", self.service)
    }

    pub fn manager_routing_key(&self) -> String {
        format!("{}.manager", self.service)
    }

    /// Dispatch queue (and routing key) of one node.
    pub fn task_queue(&self, node: &str) -> String {
        format!("{}.{}", self.task_routing_key(), node)
    }

    /// Holding queue whose messages dead-letter into `task_queue(node)`.
    pub fn delayed_queue(&self, node: &str) -> String {
        format!("{}.delayed", self.task_queue(node))
    }

    /// Key an event is published under.
    pub fn event_key(&self, origin: &str) -> String {
        format!("{}.{}", self.event_routing_key(), origin)
    }

    /// Pattern every event subscriber binds with.
    pub fn event_pattern(&self) -> String {
        format!("{}.*", self.event_routing_key())
    }

    pub fn manager_key(&self, node: &str) -> String {
        format!("{}.{}", self.manager_routing_key(), node)
    }

    pub fn direct_exchange(&self) -> String {
        self.service.clone()
    }

    pub fn topic_exchange(&self) -> String {
        format!("{}.topic", self.service)
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

/// Publish/subscribe surface shared by every backend.
///
/// Subscriptions stay active until `cancel` fires or the broker shuts down.
pub trait Broker: Send + Sync {
    fn publish_task<'a>(&'a self, node: &'a str, payload: &'a str) -> BoxFuture<'a, Result<()>>;

    fn publish_task_delayed<'a>(
        &'a self,
        node: &'a str,
        payload: &'a str,
        delay: Duration,
    ) -> BoxFuture<'a, Result<()>>;

    fn subscribe_task<'a>(
        &'a self,
        cancel: CancellationToken,
        node: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, Result<()>>;

    fn publish_event<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, Result<()>>;

    fn subscribe_event(&self, cancel: CancellationToken, handler: Handler)
    -> BoxFuture<'_, Result<()>>;

    fn publish_manager<'a>(&'a self, node: &'a str, payload: &'a str)
    -> BoxFuture<'a, Result<()>>;

    fn subscribe_manager<'a>(
        &'a self,
        cancel: CancellationToken,
        node: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, Result<()>>;

    /// Stop subscriptions and pending delayed publishes.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Build a broker from a URL: `inmemory://` or `amqp://` / `amqps://`.
pub async fn connect(url: &str, service: &str) -> Result<Arc<dyn Broker>> {
    let (scheme, _) = url
        .split_once("://")
        .ok_or_else(|| DagflowError::ConfigError(format!("invalid message queue url: {url}")))?;

    info!(scheme, service, "connecting message broker");
    match scheme.to_lowercase().as_str() {
        "inmemory" | "memory" => Ok(Arc::new(MemoryBroker::new(Routing::new(service)))),
        #[cfg(feature = "amqp")]
        "amqp" | "amqps" => Ok(Arc::new(
            amqp::AmqpBroker::connect(url, Routing::new(service)).await?,
        )),
        #[cfg(not(feature = "amqp"))]
        "amqp" | "amqps" => Err(DagflowError::ConfigError(
            "amqp broker support is not compiled in (enable the `amqp` feature)".to_string(),
        )),
        other => Err(DagflowError::ConfigError(format!(
            "unsupported message queue scheme: {other}"
        ))),
    }
}
