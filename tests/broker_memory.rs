// tests/broker_memory.rs

mod common;
use crate::common::{init_tracing, with_timeout};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use dagflow::broker::{self, Broker, Handler, MemoryBroker, Routing, handler};

fn collector() -> (Handler, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let h = handler(move |msg| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
        }
    });
    (h, rx)
}

#[tokio::test]
async fn events_fan_out_to_every_subscriber() {
    init_tracing();
    let broker = MemoryBroker::new(Routing::new("svc"));
    let (h1, mut rx1) = collector();
    let (h2, mut rx2) = collector();
    broker.subscribe_event(CancellationToken::new(), h1).await.unwrap();
    broker.subscribe_event(CancellationToken::new(), h2).await.unwrap();

    broker.publish_event("{\"task\":\"t\"}").await.unwrap();

    assert_eq!(with_timeout(rx1.recv()).await.unwrap(), "{\"task\":\"t\"}");
    assert_eq!(with_timeout(rx2.recv()).await.unwrap(), "{\"task\":\"t\"}");
    broker.shutdown().await;
}

#[tokio::test]
async fn control_messages_reach_only_the_addressed_node() {
    init_tracing();
    let broker = MemoryBroker::new(Routing::default());
    let (h1, mut rx1) = collector();
    let (h2, mut rx2) = collector();
    broker
        .subscribe_manager(CancellationToken::new(), "n1", h1)
        .await
        .unwrap();
    broker
        .subscribe_manager(CancellationToken::new(), "n2", h2)
        .await
        .unwrap();

    broker.publish_manager("n2", "kill").await.unwrap();

    assert_eq!(with_timeout(rx2.recv()).await.unwrap(), "kill");
    assert!(timeout(Duration::from_millis(30), rx1.recv()).await.is_err());
    broker.shutdown().await;
}

#[tokio::test]
async fn dispatch_queue_consumers_compete_for_messages() {
    init_tracing();
    let broker = MemoryBroker::new(Routing::default());
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, String)>();
    for consumer in 0..2 {
        let tx = tx.clone();
        broker
            .subscribe_task(
                CancellationToken::new(),
                "n1",
                handler(move |msg| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((consumer, msg));
                    }
                }),
            )
            .await
            .unwrap();
    }
    drop(tx);

    for i in 0..10 {
        broker.publish_task("n1", &format!("task{i}")).await.unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..10 {
        let (_, msg) = with_timeout(rx.recv()).await.unwrap();
        assert!(seen.insert(msg), "message delivered twice");
    }
    assert!(timeout(Duration::from_millis(30), rx.recv()).await.is_err());
    broker.shutdown().await;
}

#[tokio::test]
async fn delayed_dispatch_is_held_back() {
    init_tracing();
    let broker = MemoryBroker::new(Routing::default());
    let (h, mut rx) = collector();
    broker
        .subscribe_task(CancellationToken::new(), "n1", h)
        .await
        .unwrap();

    let started = Instant::now();
    broker
        .publish_task_delayed("n1", "later", Duration::from_millis(80))
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(20), rx.recv()).await.is_err());

    assert_eq!(with_timeout(rx.recv()).await.unwrap(), "later");
    assert!(started.elapsed() >= Duration::from_millis(80));
    broker.shutdown().await;
}

#[tokio::test]
async fn shutdown_drops_pending_delayed_dispatch() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(Routing::default()));
    broker
        .publish_task_delayed("n1", "never", Duration::from_secs(60))
        .await
        .unwrap();

    with_timeout(broker.shutdown()).await;
    assert_eq!(broker.queued("n1"), 0);
    assert!(broker.publish_task("n1", "x").await.is_err());
}

#[tokio::test]
async fn cancelled_subscription_stops_receiving() {
    init_tracing();
    let broker = MemoryBroker::new(Routing::default());
    let cancel = CancellationToken::new();
    let (h, mut rx) = collector();
    broker.subscribe_manager(cancel.clone(), "n1", h).await.unwrap();

    cancel.cancel();
    // The subscription task owns the sender; it ends once cancelled.
    assert!(with_timeout(rx.recv()).await.is_none());
    broker.publish_manager("n1", "late").await.unwrap();
    broker.shutdown().await;
}

#[tokio::test]
async fn connect_builds_in_memory_broker() {
    let broker = broker::connect("inmemory://", "svc").await.unwrap();
    broker.publish_task("n1", "t").await.unwrap();
    broker.shutdown().await;
}
