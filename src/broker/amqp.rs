// src/broker/amqp.rs

//! RabbitMQ backend.
//!
//! Layout on the server:
//! - direct exchange `<svc>` carrying dispatch; one durable quorum queue
//!   `<svc>.task.<node>` per node, bound with its own name;
//! - `<svc>.task.<node>.delayed` holds delayed dispatch. Messages expire
//!   after their delay and dead-letter back into the node queue;
//! - topic exchange `<svc>.topic` carrying events and control messages.
//!   Event subscribers get throw-away queues that expire after a minute.
//!
//! Publisher confirms are on and messages are persistent.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BoxFuture, Broker, Handler, Routing};
use crate::errors::{DagflowError, Result};

const EVENT_QUEUE_TTL_MS: i32 = 60_000;

fn broker_err(e: lapin::Error) -> DagflowError {
    DagflowError::Broker(e.to_string())
}

fn quorum_args() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-queue-type".into(), AMQPValue::LongString(LongString::from("quorum")));
    args
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

pub struct AmqpBroker {
    routing: Routing,
    origin: String,
    conn: Connection,
    publisher: Channel,
    closed: CancellationToken,
    tasks: TaskTracker,
}

impl AmqpBroker {
    pub async fn connect(url: &str, routing: Routing) -> Result<Self> {
        let name = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("unknown-{}", Uuid::new_v4().simple()));
        let props = ConnectionProperties::default().with_connection_name(LongString::from(name.clone()));
        let conn = Connection::connect(url, props).await.map_err(broker_err)?;

        let publisher = conn.create_channel().await.map_err(broker_err)?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_err)?;

        let broker = Self {
            routing,
            origin: Uuid::new_v4().simple().to_string(),
            conn,
            publisher,
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        broker.declare_exchanges(&broker.publisher).await?;
        info!(connection = %name, "connected to amqp broker");
        Ok(broker)
    }

    async fn declare_exchanges(&self, channel: &Channel) -> Result<()> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        channel
            .exchange_declare(
                &self.routing.direct_exchange(),
                ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        channel
            .exchange_declare(
                &self.routing.topic_exchange(),
                ExchangeKind::Topic,
                options,
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(DagflowError::BrokerClosed);
        }
        Ok(())
    }

    /// Declare a node's dispatch queue so messages routed to it are kept
    /// even before its node subscribes.
    async fn ensure_task_queue(&self, channel: &Channel, node: &str) -> Result<String> {
        let queue = self.routing.task_queue(node);
        channel
            .queue_declare(&queue, durable_queue(), quorum_args())
            .await
            .map_err(broker_err)?;
        channel
            .queue_bind(
                &queue,
                &self.routing.direct_exchange(),
                &queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        Ok(queue)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
        expiration: Option<Duration>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut props = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("text/plain".into());
        if let Some(exp) = expiration {
            props = props.with_expiration(exp.as_millis().to_string().into());
        }

        let confirm = self
            .publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload.as_bytes(),
                props,
            )
            .await
            .map_err(broker_err)?
            .await
            .map_err(broker_err)?;

        if confirm.is_nack() {
            return Err(DagflowError::Broker(format!(
                "message to {exchange}/{routing_key} was not confirmed"
            )));
        }
        Ok(())
    }

    /// Consume `queue` until cancelled, acking after the handler returns.
    async fn consume(
        &self,
        channel: Channel,
        queue: String,
        cancel: CancellationToken,
        handler: Handler,
    ) -> Result<()> {
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(broker_err)?;
        let tag = format!("{}-{}", queue, Uuid::new_v4().simple());
        let mut consumer = channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;

        let closed = self.closed.clone();
        self.tasks.spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = closed.cancelled() => break,
                    next = consumer.next() => next,
                };
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        warn!(queue = %queue, error = %e, "amqp consumer error");
                        break;
                    }
                    None => break,
                };

                let payload = String::from_utf8_lossy(&delivery.data).into_owned();
                handler(payload).await;
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!(queue = %queue, error = %e, "failed to ack message");
                }
            }
            if let Err(e) = channel.close(200, "subscription ended").await {
                debug!(queue = %queue, error = %e, "closing consumer channel");
            }
            debug!(queue = %queue, "amqp subscription ended");
        });
        Ok(())
    }
}

impl Broker for AmqpBroker {
    fn publish_task<'a>(&'a self, node: &'a str, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let queue = self.ensure_task_queue(&self.publisher, node).await?;
            self.publish(&self.routing.direct_exchange(), &queue, payload, None)
                .await
        })
    }

    fn publish_task_delayed<'a>(
        &'a self,
        node: &'a str,
        payload: &'a str,
        delay: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = self.ensure_task_queue(&self.publisher, node).await?;
            let delayed = self.routing.delayed_queue(node);

            let mut args = quorum_args();
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from(self.routing.direct_exchange())),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(LongString::from(target)),
            );
            self.publisher
                .queue_declare(&delayed, durable_queue(), args)
                .await
                .map_err(broker_err)?;
            self.publisher
                .queue_bind(
                    &delayed,
                    &self.routing.direct_exchange(),
                    &delayed,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(broker_err)?;

            self.publish(&self.routing.direct_exchange(), &delayed, payload, Some(delay))
                .await
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
            let channel = self.conn.create_channel().await.map_err(broker_err)?;
            let queue = self.ensure_task_queue(&channel, node).await?;
            self.consume(channel, queue, cancel, handler).await
        })
    }

    fn publish_event<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = self.routing.event_key(&self.origin);
            self.publish(&self.routing.topic_exchange(), &key, payload, None)
                .await
        })
    }

    fn subscribe_event(
        &self,
        cancel: CancellationToken,
        handler: Handler,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let channel = self.conn.create_channel().await.map_err(broker_err)?;
            let queue = self.routing.event_key(&Uuid::new_v4().simple().to_string());

            let mut args = FieldTable::default();
            args.insert("x-expires".into(), AMQPValue::LongInt(EVENT_QUEUE_TTL_MS));
            channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        auto_delete: true,
                        ..QueueDeclareOptions::default()
                    },
                    args,
                )
                .await
                .map_err(broker_err)?;
            channel
                .queue_bind(
                    &queue,
                    &self.routing.topic_exchange(),
                    &self.routing.event_pattern(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(broker_err)?;
            self.consume(channel, queue, cancel, handler).await
        })
    }

    fn publish_manager<'a>(&'a self, node: &'a str, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = self.routing.manager_key(node);
            self.publish(&self.routing.topic_exchange(), &key, payload, None)
                .await
        })
    }

    fn subscribe_manager<'a>(
        &'a self,
        cancel: CancellationToken,
        node: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let channel = self.conn.create_channel().await.map_err(broker_err)?;
            let queue = self.routing.manager_key(node);
            channel
                .queue_declare(&queue, durable_queue(), quorum_args())
                .await
                .map_err(broker_err)?;
            channel
                .queue_bind(
                    &queue,
                    &self.routing.topic_exchange(),
                    &queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(broker_err)?;
            self.consume(channel, queue, cancel, handler).await
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return;
            }
            self.closed.cancel();
            self.tasks.close();
            self.tasks.wait().await;
            if let Err(e) = self.conn.close(200, "shutdown").await {
                warn!(error = %e, "closing amqp connection");
            }
            info!("broker shutdown complete");
        })
    }
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("routing", &self.routing)
            .finish_non_exhaustive()
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn is<T: Send + Sync>() {}
    is::<Arc<AmqpBroker>>();
}
