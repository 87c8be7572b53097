// src/dag/pool.rs

//! Bounded pool of long-lived workers.
//!
//! Workers pull jobs from one shared channel. `submit` is request/response:
//! the caller waits until a worker has picked the job up and finished it, and
//! gets the job's result back. When every worker is busy, submitters queue up
//! behind the channel, which is how back-pressure reaches the scheduler.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::{DagflowError, Result};

type Job = BoxFuture<'static, ()>;

struct WorkerSlot {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    name: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    waiting: Arc<AtomicUsize>,
}

/// Fixed-size, resizable worker pool.
pub struct WorkerPool {
    shared: Shared,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<WorkerSlot>>,
    // Stopped by a shrink but possibly still finishing a job.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(1);
        let pool = Self {
            shared: Shared {
                name: name.into(),
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                waiting: Arc::new(AtomicUsize::new(0)),
            },
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        };
        pool.set_size(size.max(1));
        pool
    }

    /// Run `job` on a pool worker and return its result.
    ///
    /// Blocks while every worker is busy. Fails with
    /// [`DagflowError::PoolClosed`] once [`close`](Self::close) was called.
    pub async fn submit<F, T>(&self, job: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let sender = lock(&self.tx).clone().ok_or(DagflowError::PoolClosed)?;

        let (reply_tx, reply_rx) = oneshot::channel::<Result<T>>();
        let wrapped: Job = Box::pin(async move {
            let res = job.await;
            let _ = reply_tx.send(res);
        });

        self.shared.waiting.fetch_add(1, Ordering::SeqCst);
        if sender.send(wrapped).await.is_err() {
            self.shared.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(DagflowError::PoolClosed);
        }
        drop(sender);

        match reply_rx.await {
            Ok(res) => res,
            Err(_) => Err(DagflowError::Other(anyhow::anyhow!(
                "job on pool '{}' aborted before reporting a result",
                self.shared.name
            ))),
        }
    }

    /// Grow or shrink the number of live workers.
    ///
    /// Workers removed by a shrink finish their current job first.
    pub fn set_size(&self, size: usize) {
        let mut workers = lock(&self.workers);
        if lock(&self.tx).is_none() {
            return;
        }

        while workers.len() < size {
            let id = workers.len();
            workers.push(self.spawn_worker(id));
        }
        let mut retired = lock(&self.retired);
        retired.retain(|handle| !handle.is_finished());
        while workers.len() > size {
            if let Some(slot) = workers.pop() {
                slot.stop.cancel();
                retired.push(slot.handle);
            }
        }
        debug!(pool = %self.shared.name, size, "worker pool resized");
    }

    /// Current number of workers.
    pub fn size(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Jobs submitted but not yet picked up by a worker.
    pub fn queue_length(&self) -> usize {
        self.shared.waiting.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.tx).is_none()
    }

    /// Stop accepting jobs and wait for queued and in-flight jobs to finish,
    /// including jobs still running on workers retired by a shrink.
    pub async fn close(&self) {
        drop(lock(&self.tx).take());
        let mut handles: Vec<JoinHandle<()>> =
            lock(&self.workers).drain(..).map(|slot| slot.handle).collect();
        handles.append(&mut lock(&self.retired));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(pool = %self.shared.name, error = %e, "worker task failed");
            }
        }
        debug!(pool = %self.shared.name, "worker pool closed");
    }

    fn spawn_worker(&self, id: usize) -> WorkerSlot {
        let stop = CancellationToken::new();
        let rx = Arc::clone(&self.shared.rx);
        let waiting = Arc::clone(&self.shared.waiting);
        let name = self.shared.name.clone();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    job = async { rx.lock().await.recv().await } => job,
                };
                let Some(job) = next else { break };
                waiting.fetch_sub(1, Ordering::SeqCst);

                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!(pool = %name, worker = id, "job panicked; worker keeps running");
                }
            }
            debug!(pool = %name, worker = id, "worker stopped");
        });

        WorkerSlot { stop, handle }
    }
}
