//! Bridge between synchronous FUSE callbacks and the async storage engine.
//!
//! `fuser` invokes each callback from a dedicated worker thread with no
//! async context. This module runs a future to completion from that thread
//! via a spawn+oneshot pattern, bounded by a timeout so a stuck network call
//! cannot wedge a kernel thread forever.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
pub struct BridgeStats {
    pub operations_started: AtomicU64,
    pub operations_completed: AtomicU64,
    pub operations_timed_out: AtomicU64,
}

impl BridgeStats {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_start(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_complete(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.operations_timed_out.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation was cancelled")]
    Cancelled,
}

impl BridgeError {
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Timeout(_) => libc::ETIMEDOUT,
            Self::Cancelled => libc::ECANCELED,
        }
    }
}

/// Runs `future` to completion on `handle`, blocking the calling (sync)
/// thread on a oneshot channel. Aborts the spawned task on timeout so it
/// cannot keep holding locks or connections after the caller gives up.
pub fn execute<F, T>(handle: &Handle, timeout: Duration, stats: Option<&BridgeStats>, future: F) -> Result<T, BridgeError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    if let Some(s) = stats {
        s.record_start();
    }

    let (tx, rx) = oneshot::channel();
    let task_handle = handle.spawn(async move {
        let result = tokio::time::timeout(timeout, future).await;
        let _ = tx.send(result);
    });

    match rx.blocking_recv() {
        Ok(Ok(value)) => {
            if let Some(s) = stats {
                s.record_complete();
            }
            Ok(value)
        }
        Ok(Err(_elapsed)) => {
            task_handle.abort();
            if let Some(s) = stats {
                s.record_timeout();
            }
            Err(BridgeError::Timeout(timeout))
        }
        Err(_recv_error) => {
            task_handle.abort();
            Err(BridgeError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_simple_future_to_completion() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = execute(rt.handle(), Duration::from_secs(5), None, async { 42 });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn times_out_a_future_that_never_resolves_in_time() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = execute(rt.handle(), Duration::from_millis(10), None, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        });
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
    }

    #[test]
    fn stats_track_start_and_completion() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let stats = BridgeStats::new();
        let _ = execute(rt.handle(), Duration::from_secs(5), Some(&stats), async { 42 });
        assert_eq!(stats.operations_started.load(Ordering::Relaxed), 1);
        assert_eq!(stats.operations_completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stats_track_timeouts_separately_from_completions() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let stats = BridgeStats::new();
        let _ = execute(rt.handle(), Duration::from_millis(10), Some(&stats), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        assert_eq!(stats.operations_timed_out.load(Ordering::Relaxed), 1);
        assert_eq!(stats.operations_completed.load(Ordering::Relaxed), 0);
    }
}
