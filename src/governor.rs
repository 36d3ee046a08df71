//! Concurrency Governor
//!
//! Bounds the number of requests in flight. Admission beyond `max_concurrent`
//! suspends the caller on a FIFO-fair semaphore until a slot frees; nothing is
//! dropped, only delayed.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GovernorError {
    #[error("Governor closed")]
    Closed,
    #[error("No free slot")]
    Saturated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GovernorStats {
    pub max_concurrent: usize,
    pub current_concurrent: usize,
    pub peak_concurrent: usize,
    pub queued: usize,
    pub admitted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    current: AtomicUsize,
    peak: AtomicUsize,
    queued: AtomicUsize,
    admitted: AtomicU64,
}

/// Request admission control
pub struct ConcurrencyGovernor {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

/// A held slot; released on drop
#[derive(Debug)]
pub struct GovernorPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGovernor {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        info!("Concurrency governor: max {} in flight", max_concurrent);
        Self {
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a slot in arrival order
    pub async fn acquire(&self) -> Result<GovernorPermit, GovernorError> {
        if self.semaphore.available_permits() == 0 {
            debug!("Governor saturated, queueing request");
        }
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let permit = self.semaphore.clone().acquire_owned().await;
        self.counters.queued.fetch_sub(1, Ordering::SeqCst);

        let permit = permit.map_err(|_| GovernorError::Closed)?;
        Ok(self.admit(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Result<GovernorPermit, GovernorError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.admit(permit)),
            Err(TryAcquireError::NoPermits) => Err(GovernorError::Saturated),
            Err(TryAcquireError::Closed) => Err(GovernorError::Closed),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> GovernorPermit {
        let current = self.counters.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(current, Ordering::SeqCst);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        GovernorPermit {
            _permit: permit,
            counters: self.counters.clone(),
        }
    }

    /// Refuse new admissions; waiters are woken with `Closed`
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn current(&self) -> usize {
        self.counters.current.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            max_concurrent: self.max_concurrent,
            current_concurrent: self.counters.current.load(Ordering::SeqCst),
            peak_concurrent: self.counters.peak.load(Ordering::SeqCst),
            queued: self.counters.queued.load(Ordering::SeqCst),
            admitted: self.counters.admitted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let governor = ConcurrencyGovernor::new(2);
        let a = governor.acquire().await.unwrap();
        let _b = governor.try_acquire().unwrap();
        assert_eq!(governor.try_acquire().unwrap_err(), GovernorError::Saturated);
        assert_eq!(governor.current(), 2);

        drop(a);
        assert_eq!(governor.current(), 1);
        assert!(governor.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max() {
        let governor = Arc::new(ConcurrencyGovernor::new(3));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let governor = governor.clone();
            handles.push(tokio::spawn(async move {
                let _permit = governor.acquire().await.unwrap();
                assert!(governor.current() <= 3);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = governor.stats();
        assert_eq!(stats.peak_concurrent, 3);
        assert_eq!(stats.admitted, 20);
        assert_eq!(stats.current_concurrent, 0);
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let governor = Arc::new(ConcurrencyGovernor::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = governor.acquire().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let task_governor = governor.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = task_governor.acquire().await.unwrap();
                order.lock().push(i);
            }));
            // let each waiter enqueue before spawning the next
            while governor.stats().queued < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let governor = ConcurrencyGovernor::new(1);
        governor.close();
        assert_eq!(governor.acquire().await.unwrap_err(), GovernorError::Closed);
    }
}
