use anyhow::{bail, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

/// Long-lived bounded task scheduler.
///
/// At most `size` submitted tasks run at once; the rest wait for a permit inside the
/// runtime, so `submit` itself never blocks. Tasks cannot be cancelled once submitted.
/// `shutdown` stops admission and waits for every pending task to finish.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    size: usize,
    permits: Semaphore,
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

/// Decrements the pending count when a task ends, including by panic.
struct PendingGuard(Arc<Inner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl WorkerPool {
    /// `size` is clamped to at least one worker.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                size,
                permits: Semaphore::new(size),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.inner.name }
    pub fn size(&self) -> usize { self.inner.size }
    pub fn pending(&self) -> usize { self.inner.pending.load(Ordering::Acquire) }
    pub fn is_shut_down(&self) -> bool { self.inner.closed.load(Ordering::Acquire) }

    pub fn submit<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_shut_down() {
            bail!("worker pool `{}` is shut down", self.inner.name);
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(self.inner.clone());
        Ok(tokio::spawn(async move {
            // The semaphore is never closed, so acquisition only waits.
            let _permit = guard.0.permits.acquire().await.ok();
            task.await
        }))
    }

    /// Stop accepting tasks and wait until all submitted tasks have completed.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        loop {
            let idle = self.inner.idle.notified();
            if self.pending() == 0 { break; }
            idle.await;
        }
        debug!(pool = %self.inner.name, "worker pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_pool_size() {
        let pool = WorkerPool::new("test", 3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }).unwrap());
        }
        for h in handles { h.await.unwrap(); }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_pending_and_rejects_new() {
        let pool = WorkerPool::new("test", 1);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }).unwrap();
        }
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(pool.pending(), 0);
        assert!(pool.submit(async {}).is_err());
    }

    #[tokio::test]
    async fn panicking_task_releases_its_slot() {
        let pool = WorkerPool::new("test", 1);
        let bad = pool.submit(async { panic!("boom") }).unwrap();
        assert!(bad.await.is_err());
        let good = pool.submit(async { 7 }).unwrap();
        assert_eq!(good.await.unwrap(), 7);
        pool.shutdown().await;
    }

    #[test]
    fn size_is_at_least_one() {
        assert_eq!(WorkerPool::new("zero", 0).size(), 1);
    }
}
