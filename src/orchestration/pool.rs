//! Bounded worker pool.
//!
//! The `WorkerPool` caps how many tasks are *working* at once. A worker
//! slot is a semaphore permit: tasks hold one while they execute, and
//! sensors hold one only while evaluating their predicate so that a week
//! of polling never starves the rest of the graph.

use crate::error::TaskError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A slot in the worker pool, released on drop.
pub type WorkerSlot = OwnedSemaphorePermit;

/// Shared pool of worker slots.
///
/// Cloning is cheap and every clone draws from the same slots.
///
/// # Example
///
/// ```ignore
/// use cadence::orchestration::WorkerPool;
///
/// let pool = WorkerPool::new(4);
/// let slot = pool.acquire().await?;
/// assert_eq!(pool.available(), 3);
/// drop(slot);
/// ```
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    /// Create a pool with `workers` slots. Zero is treated as one.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            slots: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<WorkerSlot, TaskError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::Cancelled)
    }

    /// Wait for a free slot unless `cancel` fires first.
    pub async fn acquire_until(&self, cancel: &CancellationToken) -> Result<WorkerSlot, TaskError> {
        tokio::select! {
            slot = self.acquire() => slot,
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }

    /// Number of free slots right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Total number of slots.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Number of slots currently held.
    pub fn busy(&self) -> usize {
        self.workers - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_new() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.workers(), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn test_pool_with_zero_workers_has_one_slot() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.workers(), 1);
    }

    #[tokio::test]
    async fn test_acquire_takes_a_slot() {
        let pool = WorkerPool::new(2);
        let slot = pool.acquire().await.unwrap();
        assert_eq!(pool.busy(), 1);
        drop(slot);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_slots() {
        let pool = WorkerPool::new(1);
        let clone = pool.clone();
        let _slot = pool.acquire().await.unwrap();
        assert_eq!(clone.available(), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_when_full() {
        let pool = WorkerPool::new(1);
        let slot = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err());

        drop(slot);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_until_cancelled() {
        let pool = WorkerPool::new(1);
        let _slot = pool.acquire().await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pool.acquire_until(&cancel).await;
        assert_eq!(result.unwrap_err(), TaskError::Cancelled);
    }
}
