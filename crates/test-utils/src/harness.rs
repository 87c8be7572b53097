use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use dagflow::broker::{Broker, MemoryBroker, Routing};
use dagflow::dag::RetryPolicy;
use dagflow::engine::{EngineContext, Node, TaskDetail, TaskService};
use dagflow::lifecycle::{EventEmitter, Lifecycle, State};
use dagflow::storage::{MemoryStorage, Storage};

use crate::fake_executor::FakeExecutors;

/// One node wired to an in-process broker and storage, with the fake
/// executor installed and a throwaway root directory.
pub struct TestNode {
    pub node: Node,
    pub service: TaskService,
    pub storage: Arc<MemoryStorage>,
    pub broker: Arc<MemoryBroker>,
    pub fakes: FakeExecutors,
    _root: TempDir,
}

pub struct TestNodeBuilder {
    name: String,
    pool_size: usize,
    dag_workers: i64,
    default_retry: Option<RetryPolicy>,
    storage: Arc<MemoryStorage>,
    broker: Arc<MemoryBroker>,
}

impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pool_size: 4,
            dag_workers: 8,
            default_retry: None,
            storage: Arc::new(MemoryStorage::new()),
            broker: Arc::new(MemoryBroker::new(Routing::default())),
        }
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn dag_workers(mut self, workers: i64) -> Self {
        self.dag_workers = workers;
        self
    }

    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Some(policy);
        self
    }

    /// Share storage with another node (or a previous "process").
    pub fn storage(mut self, storage: Arc<MemoryStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Share a broker with another node.
    pub fn broker(mut self, broker: Arc<MemoryBroker>) -> Self {
        self.broker = broker;
        self
    }

    /// Build without starting subscriptions.
    pub fn build(self) -> TestNode {
        let root = tempfile::tempdir().expect("tempdir");
        let fakes = FakeExecutors::new();
        let storage_dyn: Arc<dyn Storage> = Arc::clone(&self.storage) as Arc<dyn Storage>;
        let broker_dyn: Arc<dyn Broker> = Arc::clone(&self.broker) as Arc<dyn Broker>;

        let lifecycle = Lifecycle::new(Arc::clone(&storage_dyn), EventEmitter::new());
        let mut ctx = EngineContext::new(self.name, lifecycle, root.path())
            .with_executors(fakes.registry())
            .with_dag_workers(self.dag_workers);
        if let Some(policy) = self.default_retry {
            ctx = ctx.with_default_retry(Some(policy));
        }
        let node = Node::new(ctx, Arc::clone(&broker_dyn), self.pool_size);
        let service = TaskService::new(storage_dyn, broker_dyn, Duration::from_secs(3600))
            .expect("task service");

        TestNode {
            node,
            service,
            storage: self.storage,
            broker: self.broker,
            fakes,
            _root: root,
        }
    }

    pub async fn start(self) -> TestNode {
        let test = self.build();
        test.node.start().await.expect("node start");
        test
    }
}

impl TestNode {
    pub fn root(&self) -> &std::path::Path {
        self._root.path()
    }

    pub fn state(&self, task: &str) -> State {
        self.service
            .detail(task)
            .map(|d| d.task.status.state)
            .unwrap_or(State::Unknown)
    }

    pub fn step_state(&self, task: &str, step: &str) -> State {
        self.storage
            .step(task, step)
            .map(|s| s.status.state)
            .unwrap_or(State::Unknown)
    }

    /// Poll until the task is in `state`.
    pub async fn wait_for(&self, task: &str, state: State) -> TaskDetail {
        loop {
            if let Ok(detail) = self.service.detail(task) {
                if detail.task.status.state == state {
                    return detail;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until the task reaches any terminal state.
    pub async fn wait_terminal(&self, task: &str) -> TaskDetail {
        loop {
            if let Ok(detail) = self.service.detail(task) {
                if detail.task.status.state.is_terminal() {
                    return detail;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until a step is in `state`.
    pub async fn wait_for_step(&self, task: &str, step: &str, state: State) {
        while self.step_state(task, step) != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
