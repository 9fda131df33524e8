//! Counting-semaphore gate bounding how many operations run at once.
//!
//! Waiting callers queue on the semaphore instead of being rejected. Permits
//! are RAII guards, so a slot is released on every exit path, including
//! unwinding out of a panicking handler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
#[error("concurrency limiter closed")]
pub struct LimiterClosed;

/// Shared concurrency gate for one job. Cloning shares the same slots.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with `capacity` slots. A capacity of 0 is raised to 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterClosed`] if [`close`](Self::close) was called.
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterClosed> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        Ok(LimiterPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Rejects all current and future waiters.
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of slots ever held at the same time.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn zero_capacity_is_raised_to_one() {
        assert_eq!(ConcurrencyLimiter::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn permit_drop_releases_slot() {
        let limiter = ConcurrencyLimiter::new(2);
        let first = limiter.acquire().await.unwrap();
        let second = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        drop(first);
        assert_eq!(limiter.in_flight(), 1);
        drop(second);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.peak(), 2);
    }

    #[tokio::test]
    async fn never_exceeds_capacity_under_contention() {
        let limiter = ConcurrencyLimiter::new(3);
        let observed_max = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let observed_max = Arc::clone(&observed_max);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                observed_max.fetch_max(limiter.in_flight(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(observed_max.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.peak(), 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn slot_released_when_holder_panics() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.clone();
        let result = tokio::spawn(async move {
            let _permit = held.acquire().await.unwrap();
            panic!("handler blew up");
        })
        .await;
        assert!(result.is_err());

        let permit = tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
            .await
            .expect("slot should be free again");
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn closed_limiter_rejects_waiters() {
        let limiter = ConcurrencyLimiter::new(1);
        limiter.close();
        assert!(limiter.acquire().await.is_err());
    }
}
