//! Bounded pool of sandbox slots.

use super::{ExecutionSandbox, SandboxError, SandboxHandle};
use crate::cancellation::CancellationToken;
use crate::core::ExecutionEnvironment;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A handle plus the slot it occupies. Dropping the lease frees the slot
/// but does not release the sandbox; use [`SandboxPool::release`].
#[derive(Debug)]
pub struct Lease {
    /// The acquired sandbox.
    pub handle: SandboxHandle,
    _permit: OwnedSemaphorePermit,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Limits concurrently held sandboxes.
///
/// Acquisitions beyond `max_slots` wait in FIFO order. Once more than
/// `queue_depth` callers are already waiting, acquisition fails with
/// [`SandboxError::ResourceExhausted`].
pub struct SandboxPool {
    sandbox: Arc<dyn ExecutionSandbox>,
    slots: Arc<Semaphore>,
    max_slots: usize,
    queue_depth: usize,
    waiting: AtomicUsize,
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("max_slots", &self.max_slots)
            .field("queue_depth", &self.queue_depth)
            .field("in_use", &self.in_use())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl SandboxPool {
    /// Creates a pool over a sandbox.
    #[must_use]
    pub fn new(sandbox: Arc<dyn ExecutionSandbox>, max_slots: usize, queue_depth: usize) -> Self {
        let max_slots = max_slots.max(1);
        Self {
            sandbox,
            slots: Arc::new(Semaphore::new(max_slots)),
            max_slots,
            queue_depth,
            waiting: AtomicUsize::new(0),
        }
    }

    /// The wrapped sandbox.
    #[must_use]
    pub fn sandbox(&self) -> &Arc<dyn ExecutionSandbox> {
        &self.sandbox
    }

    /// Slots currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.max_slots - self.slots.available_permits()
    }

    /// Callers waiting for a slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn slot(&self) -> Result<OwnedSemaphorePermit, SandboxError> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(permit);
        }

        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(SandboxError::ResourceExhausted {
                reason: format!(
                    "all {} sandbox slots busy and {} callers already waiting",
                    self.max_slots, self.queue_depth
                ),
            });
        }
        let _guard = WaitGuard(&self.waiting);

        debug!(max_slots = self.max_slots, "Waiting for a sandbox slot");
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::ResourceExhausted {
                reason: "sandbox pool closed".to_string(),
            })
    }

    /// Waits for a slot and acquires a sandbox in it.
    pub async fn acquire(&self, env: &ExecutionEnvironment) -> Result<Lease, SandboxError> {
        let permit = self.slot().await?;
        let handle = self.sandbox.acquire(env).await?;
        Ok(Lease {
            handle,
            _permit: permit,
        })
    }

    /// Like [`acquire`](Self::acquire), but gives up waiting for a slot
    /// once `cancel` fires. Returns `None` when cancelled.
    pub async fn acquire_until(
        &self,
        env: &ExecutionEnvironment,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>, SandboxError> {
        let permit = tokio::select! {
            permit = self.slot() => permit?,
            () = cancel.cancelled() => return Ok(None),
        };
        let handle = self.sandbox.acquire(env).await?;
        Ok(Some(Lease {
            handle,
            _permit: permit,
        }))
    }

    /// Releases the sandbox and frees its slot.
    pub async fn release(&self, lease: Lease) -> Result<(), SandboxError> {
        let Lease { handle, _permit } = lease;
        self.sandbox.release(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSandbox;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release_tracks_slots() {
        let mock = Arc::new(MockSandbox::new());
        let pool = SandboxPool::new(mock.clone(), 2, 4);
        let env = ExecutionEnvironment::image("alpine");

        let a = pool.acquire(&env).await.unwrap();
        let b = pool.acquire(&env).await.unwrap();
        assert_eq!(pool.in_use(), 2);

        pool.release(a).await.unwrap();
        pool.release(b).await.unwrap();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(mock.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_waits_fifo_for_slot() {
        let mock = Arc::new(MockSandbox::new());
        let pool = Arc::new(SandboxPool::new(mock, 1, 4));
        let env = ExecutionEnvironment::image("alpine");

        let held = pool.acquire(&env).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let env = env.clone();
            tokio::spawn(async move { pool.acquire(&env).await.map(|lease| lease.handle.id) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.waiting(), 1);

        pool.release(held).await.unwrap();
        let id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(id > 0);
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_queue_depth_exceeded() {
        let mock = Arc::new(MockSandbox::new());
        let pool = SandboxPool::new(mock, 1, 0);
        let env = ExecutionEnvironment::image("alpine");

        let _held = pool.acquire(&env).await.unwrap();
        let err = pool.acquire(&env).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_acquire_until_cancelled_while_waiting() {
        let mock = Arc::new(MockSandbox::new());
        let pool = Arc::new(SandboxPool::new(mock.clone(), 1, 4));
        let env = ExecutionEnvironment::image("alpine");
        let cancel = Arc::new(CancellationToken::new());

        let held = pool.acquire(&env).await.unwrap();
        let waiter = {
            let (pool, env, cancel) = (pool.clone(), env.clone(), cancel.clone());
            tokio::spawn(async move { pool.acquire_until(&env, &cancel).await.map(|l| l.is_none()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel("stop");

        assert!(waiter.await.unwrap().unwrap());
        assert_eq!(pool.waiting(), 0);
        assert_eq!(mock.acquired(), 1);
        pool.release(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_acquire_frees_slot() {
        let mock = Arc::new(MockSandbox::new().with_unavailable_image("missing:latest"));
        let pool = SandboxPool::new(mock, 1, 0);

        let err = pool
            .acquire(&ExecutionEnvironment::image("missing:latest"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ImageUnavailable { .. }));
        assert_eq!(pool.in_use(), 0);
    }
}
