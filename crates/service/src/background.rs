//! Bounded worker pool for post-commit side effects (cache writes, invalidation,
//! notifications). Submitting never blocks the caller; failures are logged and counted.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ServiceMetrics;

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

struct Job {
    name: &'static str,
    fut: TaskFuture,
}

/// Fixed set of tokio workers draining a bounded queue of named tasks.
pub struct TaskPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    metrics: Arc<ServiceMetrics>,
}

impl TaskPool {
    /// Spawn `workers` workers sharing a queue of `queue_size` tasks.
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, queue_size: usize, metrics: Arc<ServiceMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(queue_size.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let handles = (0..workers.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                let pending = pending.clone();
                let idle = idle.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else {
                            debug!(worker = id, "Task queue closed, worker exiting");
                            break;
                        };

                        let outcome = match tokio::spawn(job.fut).await {
                            Ok(Ok(())) => "ok",
                            Ok(Err(e)) => {
                                error!(task = job.name, error = %e, "Background task failed");
                                "failed"
                            }
                            Err(e) => {
                                error!(task = job.name, error = %e, "Background task panicked");
                                "failed"
                            }
                        };
                        metrics.record_task(job.name, outcome);

                        if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                            idle.notify_waiters();
                        }
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            pending,
            idle,
            metrics,
        }
    }

    /// Queue a task. Returns `false` when the queue is full or closed and the task
    /// was dropped.
    pub fn submit<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            warn!(task = name, "Task pool is shut down, dropping task");
            self.metrics.record_task(name, "dropped");
            return false;
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            name,
            fut: Box::pin(fut),
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.idle.notify_waiters();
                }
                warn!(task = name, error = %e, "Task queue rejected task, dropping it");
                self.metrics.record_task(name, "dropped");
                false
            }
        }
    }

    /// Number of queued or running tasks.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every submitted task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Close the queue and wait up to `timeout` for queued and running tasks.
    pub async fn shutdown(&self, timeout: Duration) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handles =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Task worker ended abnormally");
                }
            }
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => info!("Task pool drained"),
            Err(_) => warn!(pending = self.pending(), "Task pool shutdown timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn pool(workers: usize, queue: usize) -> (TaskPool, Arc<ServiceMetrics>) {
        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        (TaskPool::new(workers, queue, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_runs_and_counts_tasks() {
        let (pool, metrics) = pool(2, 16);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            assert!(pool.submit("count", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        assert!(pool.submit("fail", async { Err("boom".to_string()) }));

        pool.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.task_count("count", "ok"), 5);
        assert_eq!(metrics.task_count("fail", "failed"), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_worker() {
        let (pool, metrics) = pool(1, 4);
        pool.submit("panic", async {
            if true {
                panic!("task panicked");
            }
            Ok(())
        });
        pool.submit("after", async { Ok(()) });

        pool.wait_idle().await;
        assert_eq!(metrics.task_count("panic", "failed"), 1);
        assert_eq!(metrics.task_count("after", "ok"), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (pool, metrics) = pool(1, 1);
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        let (g, s) = (gate.clone(), started.clone());
        pool.submit("blocker", async move {
            s.notify_one();
            g.notified().await;
            Ok(())
        });
        // The only worker is now busy, so the single queue slot is free.
        started.notified().await;

        assert!(pool.submit("queued", async { Ok(()) }));
        assert!(!pool.submit("overflow", async { Ok(()) }));
        assert_eq!(metrics.task_count("overflow", "dropped"), 1);

        gate.notify_one();
        pool.wait_idle().await;
        assert_eq!(metrics.task_count("queued", "ok"), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let (pool, metrics) = pool(1, 4);
        pool.shutdown(Duration::from_secs(1)).await;
        assert!(!pool.submit("late", async { Ok(()) }));
        assert_eq!(metrics.task_count("late", "dropped"), 1);
    }
}
