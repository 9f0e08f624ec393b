//! Bounded executor for detached post-close upload tasks.
//!
//! `Cleanup` hands a snapshot of a closed file's write buffer to a
//! fire-and-forget background task: the filesystem call itself must return
//! immediately, and its outcome is only observable later, through reads
//! succeeding or the record never appearing. A bare `tokio::spawn` per close
//! would let an unbounded number of these accumulate under heavy write
//! traffic; this queue caps how many run concurrently and logs every
//! outcome instead of silently dropping it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Snapshot of how many background uploads have run, are running, or have
/// failed since the queue was created.
#[derive(Debug, Default)]
pub struct UploadQueueStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub in_flight: AtomicU64,
}

/// Bounds concurrent detached upload tasks with a counting semaphore.
pub struct UploadQueue {
    semaphore: Arc<Semaphore>,
    stats: Arc<UploadQueueStats>,
}

impl UploadQueue {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            stats: Arc::new(UploadQueueStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<UploadQueueStats> {
        Arc::clone(&self.stats)
    }

    /// Queue `fut` for detached background execution. Returns immediately;
    /// the task waits for a permit before running, so callers under heavy
    /// write load see uploads back up rather than spawn unboundedly.
    pub fn spawn<F>(&self, label: impl Into<String> + Send + 'static, fut: F)
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("upload queue semaphore is never closed");
            let label = label.into();
            stats.in_flight.fetch_add(1, Ordering::Relaxed);
            let result = fut.await;
            stats.in_flight.fetch_sub(1, Ordering::Relaxed);
            match result {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(label, "background upload task completed");
                }
                Err(err) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(label, error = %err, "background upload task failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering as O;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn successful_task_increments_completed() {
        let queue = UploadQueue::new(4);
        let stats = queue.stats();
        let done = Arc::new(Notify::new());
        let done2 = Arc::clone(&done);
        queue.spawn("ok", async move {
            done2.notify_one();
            Ok(())
        });
        done.notified().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stats.completed.load(O::Relaxed), 1);
        assert_eq!(stats.failed.load(O::Relaxed), 0);
    }

    #[tokio::test]
    async fn failing_task_increments_failed_not_completed() {
        let queue = UploadQueue::new(4);
        let stats = queue.stats();
        let done = Arc::new(Notify::new());
        let done2 = Arc::clone(&done);
        queue.spawn("fail", async move {
            done2.notify_one();
            Err("boom".into())
        });
        done.notified().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stats.failed.load(O::Relaxed), 1);
        assert_eq!(stats.completed.load(O::Relaxed), 0);
    }

    #[tokio::test]
    async fn respects_concurrency_bound() {
        let queue = UploadQueue::new(1);
        let stats = queue.stats();
        let gate = Arc::new(Notify::new());
        let gate2 = Arc::clone(&gate);
        queue.spawn("first", async move {
            gate2.notified().await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stats.in_flight.load(O::Relaxed), 1);

        queue.spawn("second", async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The second task is still waiting on the single permit.
        assert_eq!(stats.completed.load(O::Relaxed), 0);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.completed.load(O::Relaxed), 2);
    }
}
