//! Bounded worker pool with submit/await-all semantics.
//!
//! Each submitted job runs as its own tokio task, but at most `size` jobs
//! hold a permit at any time. Results come back in submission order, so
//! callers can pair them with their inputs without extra bookkeeping.
//!
//! # Features
//!
//! - Configurable number of concurrent workers
//! - Panics are contained and reported per job
//! - Pool statistics tracking

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The job panicked or was aborted before producing a result.
    #[error("Job {index} in pool '{pool}' did not complete: {reason}")]
    JobFailed {
        pool: String,
        index: usize,
        reason: String,
    },
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of concurrently running jobs.
    pub size: usize,
    /// Jobs currently holding a permit.
    pub active: u64,
    /// Jobs that returned a value.
    pub completed: u64,
    /// Jobs that panicked.
    pub failed: u64,
    /// Highest number of jobs observed running at once.
    pub peak_active: u64,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
struct SharedPoolStats {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    peak_active: AtomicU64,
}

impl SharedPoolStats {
    fn increment_active(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, size: usize) -> PoolStats {
        PoolStats {
            size,
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            peak_active: self.peak_active.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the active count even when the job panics.
struct ActiveGuard(Arc<SharedPoolStats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.decrement_active();
    }
}

/// A bounded pool of concurrently running async jobs.
///
/// Cloning is cheap; clones share the same permits and statistics.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    size: usize,
    permits: Arc<Semaphore>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a pool running at most `size` jobs at once (minimum 1).
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: name.into(),
            size,
            permits: Arc::new(Semaphore::new(size)),
            stats: Arc::new(SharedPoolStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.size)
    }

    /// Submits one job per item and waits for all of them.
    ///
    /// The returned vector has one entry per item, in input order. A job
    /// that panics yields `PoolError::JobFailed` in its slot; the other jobs
    /// are unaffected.
    pub async fn run_all<I, F, Fut, T>(&self, items: I, job: F) -> Vec<Result<T, PoolError>>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut set = JoinSet::new();
        let mut total = 0;

        for (index, item) in items.into_iter().enumerate() {
            total += 1;
            let permits = Arc::clone(&self.permits);
            let stats = Arc::clone(&self.stats);
            let fut = job(item);

            set.spawn(async move {
                // Never closed; acquisition cannot fail.
                let _permit = permits.acquire_owned().await.ok();
                stats.increment_active();
                let _active = ActiveGuard(Arc::clone(&stats));
                (index, fut.await)
            });
        }

        debug!(pool = %self.name, jobs = total, size = self.size, "Submitted jobs");

        let mut slots: Vec<Option<Result<T, PoolError>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, value)) => {
                    self.stats.completed.fetch_add(1, Ordering::SeqCst);
                    slots[index] = Some(Ok(value));
                }
                Err(join_error) => {
                    // The panicked job's slot stays empty and is reported below.
                    self.stats.failed.fetch_add(1, Ordering::SeqCst);
                    error!(pool = %self.name, error = %join_error, "Pool job panicked");
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(PoolError::JobFailed {
                        pool: self.name.clone(),
                        index,
                        reason: "job panicked".to_string(),
                    })
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let pool = WorkerPool::new("test", 3);
        let results = pool
            .run_all(vec![30u64, 10, 20], |ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ms
            })
            .await;

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![30, 10, 20]);
        assert_eq!(pool.stats().completed, 3);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("bounded", 2);
        pool.run_all(0..6, |_| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
        })
        .await;

        let stats = pool.stats();
        assert_eq!(stats.total_processed(), 6);
        assert!(stats.peak_active <= 2);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let pool = WorkerPool::new("panicky", 2);
        let results = pool
            .run_all(vec![1, 2, 3], |n| async move {
                if n == 2 {
                    panic!("boom");
                }
                n * 10
            })
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 10);
        assert!(matches!(results[1], Err(PoolError::JobFailed { index: 1, .. })));
        assert_eq!(*results[2].as_ref().unwrap(), 30);
        assert_eq!(pool.stats().failed, 1);
    }

    #[test]
    fn test_minimum_size() {
        assert_eq!(WorkerPool::new("zero", 0).size(), 1);
    }
}
