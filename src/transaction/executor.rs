//! Per-dialog task executor: a keyed multi-queue built on
//! [`super::timer::Timer`]'s wheel. Tasks submitted under the same key
//! execute strictly in submission order (head-insert for ACK priority,
//! tail-insert otherwise); tasks under different keys run concurrently.
//! This replaces an explicit per-dialog lock with enqueue ordering.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Queue {
    tasks: AsyncMutex<VecDeque<BoxedTask>>,
    draining: std::sync::atomic::AtomicBool,
}

/// Dispatches tasks FIFO per key, on the ambient `tokio` runtime.
pub struct DialogExecutor {
    queues: DashMap<String, Arc<Queue>>,
}

impl DialogExecutor {
    pub fn new() -> Self {
        DialogExecutor {
            queues: DashMap::new(),
        }
    }

    fn queue_for(&self, key: &str) -> Arc<Queue> {
        self.queues
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Queue {
                    tasks: AsyncMutex::new(VecDeque::new()),
                    draining: std::sync::atomic::AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Enqueues at the tail: normal outbound sends and re-INVITE
    /// serialization.
    pub fn add_task_last<F>(&self, key: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let queue = self.queue_for(key);
        tokio::spawn(async move {
            let mut tasks = queue.tasks.lock().await;
            tasks.push_back(Box::pin(task));
            drop(tasks);
            Self::drain(queue).await;
        });
    }

    /// Enqueues at the head: used for ACK, which must jump ahead of queued
    /// non-ACK sends but still respect any earlier in-flight ACK.
    pub fn add_task_first<F>(&self, key: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let queue = self.queue_for(key);
        tokio::spawn(async move {
            let mut tasks = queue.tasks.lock().await;
            tasks.push_front(Box::pin(task));
            drop(tasks);
            Self::drain(queue).await;
        });
    }

    async fn drain(queue: Arc<Queue>) {
        if queue
            .draining
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        loop {
            let next = {
                let mut tasks = queue.tasks.lock().await;
                tasks.pop_front()
            };
            match next {
                Some(task) => task.await,
                None => break,
            }
        }
        queue.draining.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn remove_queue(&self, key: &str) {
        self.queues.remove(key);
        debug!(key, "dialog executor queue removed");
    }
}

impl Default for DialogExecutor {
    fn default() -> Self {
        Self::new()
    }
}
