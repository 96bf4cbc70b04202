//! Bounded, autoscaling worker pool.
//!
//! Tasks are boxed futures rather than bare closures, so that dispatch work
//! which itself awaits — a REST call
//! made from inside a handler, say — doesn't have to block a worker thread
//! synchronously.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A parameterless, side-effecting unit of work queued for later execution.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct Shared {
    tasks_tx: async_channel::Sender<Task>,
    tasks_rx: async_channel::Receiver<Task>,
    active_workers: AtomicI64,
    min_workers: i64,
    capacity: usize,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    shutting_down: std::sync::atomic::AtomicBool,
}

/// Bounded FIFO task queue with an autoscaled worker count.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(initial_workers: i64, min_workers: i64) -> Self {
        Self::with_capacity(initial_workers, min_workers, 256)
    }

    pub fn with_capacity(initial_workers: i64, min_workers: i64, capacity: usize) -> Self {
        let (tasks_tx, tasks_rx) = async_channel::bounded(capacity);
        let shared = Arc::new(Shared {
            tasks_tx,
            tasks_rx,
            active_workers: AtomicI64::new(0),
            min_workers,
            capacity,
            handles: StdMutex::new(Vec::new()),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        });
        let pool = Self { shared };
        for _ in 0..initial_workers.max(min_workers) {
            pool.add_worker();
        }
        pool
    }

    /// Enqueue a task. Before enqueueing, scales up if the queue is ≥70% full.
    /// Only blocks the caller when the queue is truly at capacity.
    pub async fn submit(&self, task: Task) {
        let occupancy = self.shared.tasks_rx.len() as f64 / self.shared.capacity.max(1) as f64;
        if occupancy >= 0.7 {
            let add = ((self.shared.capacity as f64 / 2.0).ceil() as i64).max(1);
            for _ in 0..add {
                self.add_worker();
            }
        }
        if self.shared.tasks_tx.send(task).await.is_err() {
            warn!("worker pool queue closed, dropping submitted task");
        }
    }

    /// Bypass the queue entirely: spawn a dedicated worker for this one task.
    pub fn submit_priority(&self, task: Task) {
        self.shared.active_workers.fetch_add(1, Ordering::SeqCst);
        let active = self.shared.clone();
        let handle = tokio::spawn(async move {
            run_task(task).await;
            active.active_workers.fetch_sub(1, Ordering::SeqCst);
        });
        self.shared.handles.lock().unwrap().push(handle);
    }

    fn add_worker(&self) {
        self.shared.active_workers.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared.clone();
        let handle = tokio::spawn(worker_loop(shared));
        self.shared.handles.lock().unwrap().push(handle);
    }

    /// Signal termination, close the task queue, and wait for outstanding
    /// workers bounded by `deadline`. Idempotent.
    pub async fn shutdown(&self, deadline: Duration) {
        if self
            .shared
            .shutting_down
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        self.shared.tasks_tx.close();
        let handles = std::mem::take(&mut *self.shared.handles.lock().unwrap());
        if tokio::time::timeout(deadline, futures_util::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("worker pool shutdown deadline exceeded, abandoning remaining tasks");
        }
    }

    pub fn active_worker_count(&self) -> i64 {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> usize {
        self.shared.tasks_rx.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.capacity
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            biased;
            task = shared.tasks_rx.recv() => {
                match task {
                    Ok(task) => run_task(task).await,
                    Err(_) => break,
                }
            }
            _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                if shared.active_workers.load(Ordering::SeqCst) > shared.min_workers {
                    debug!("worker idle past timeout, exiting");
                    shared.active_workers.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
    shared.active_workers.fetch_sub(1, Ordering::SeqCst);
}

async fn run_task(task: Task) {
    if std::panic::AssertUnwindSafe(task).catch_unwind().await.is_err() {
        error!("worker pool task panicked, worker survives");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn basic_execution_runs_every_task() {
        let pool = WorkerPool::new(4, 2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let c = counter.clone();
            pool.submit(Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        }
        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn active_workers_never_below_minimum() {
        let pool = WorkerPool::new(2, 2);
        assert!(pool.active_worker_count() >= 2);
        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn priority_task_runs_even_with_no_idle_worker() {
        let pool = WorkerPool::new(1, 1);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        pool.submit_priority(Box::pin(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = WorkerPool::new(2, 1);
        pool.shutdown(Duration::from_secs(1)).await;
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_poison_the_pool() {
        let pool = WorkerPool::new(2, 1);
        pool.submit(Box::pin(async move {
            panic!("boom");
        }))
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        pool.submit(Box::pin(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown(Duration::from_secs(5)).await;
    }
}
