use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::metrics_const::{INGEST_ITEMS_RETRIED, INGEST_QUEUE_DEPTH};

/// One deferred unit of ingest work. The closure must be re-runnable: a
/// failed item goes back to the tail of the queue.
pub struct WorkItem {
    pub label: &'static str,
    run: Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
}

impl WorkItem {
    pub fn new<F>(label: &'static str, run: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self {
            label,
            run: Arc::new(run),
        }
    }
}

/// Unbounded in-memory queue of work items, drained by a bounded set of
/// cooperative workers.
///
/// Failure handling follows the at-least-once contract: a failing item is
/// re-enqueued at the tail and the worker sleeps `100ms · error_count`
/// before picking up the next item. The error counter is shared across
/// workers and resets on any success, so backoff scales with how unhealthy
/// the downstream currently is. No item is dropped without a log line.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    depth: Arc<AtomicI64>,
    errors: Arc<AtomicU32>,
    name: &'static str,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            depth: Arc::new(AtomicI64::new(0)),
            errors: Arc::new(AtomicU32::new(0)),
            name,
        }
    }

    pub fn enqueue(&self, item: WorkItem) {
        if self.tx.send(item).is_err() {
            warn!(queue = self.name, "work queue closed, item dropped");
            return;
        }
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!(INGEST_QUEUE_DEPTH, &[("queue", self.name)]).set(depth as f64);
    }

    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Spawns `count` workers that run until the queue handle is dropped.
    pub fn spawn_workers(&self, count: usize) -> Vec<JoinHandle<()>> {
        (0..count).map(|_| self.spawn_worker()).collect()
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                let item = {
                    let mut rx = queue.rx.lock().await;
                    rx.recv().await
                };
                let Some(item) = item else {
                    return;
                };
                let depth = queue.depth.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics::gauge!(INGEST_QUEUE_DEPTH, &[("queue", queue.name)]).set(depth as f64);

                match (item.run)().await {
                    Ok(()) => {
                        queue.errors.store(0, Ordering::SeqCst);
                    }
                    Err(err) => {
                        let errors = queue.errors.fetch_add(1, Ordering::SeqCst) + 1;
                        metrics::counter!(INGEST_ITEMS_RETRIED, &[("queue", queue.name)])
                            .increment(1);
                        warn!(
                            queue = queue.name,
                            label = item.label,
                            errors,
                            "work item failed, re-enqueueing: {err:#}"
                        );
                        queue.enqueue(item);
                        tokio::time::sleep(Duration::from_millis(100 * errors as u64)).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_items_run_to_completion() {
        let queue = WorkQueue::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            queue.enqueue(WorkItem::new("count", move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }));
        }
        let _workers = queue.spawn_workers(4);
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("items did not finish");
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_failed_item_is_retried_until_success() {
        let queue = WorkQueue::new("test_retry");
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_item = attempts.clone();
        queue.enqueue(WorkItem::new("flaky", move || {
            let attempts = attempts_in_item.clone();
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(())
            })
        }));
        let _workers = queue.spawn_workers(1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while attempts.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("item was not retried to success");
    }
}
