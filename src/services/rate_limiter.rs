use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Duration, Instant};

/// Caps how often and how concurrently a remote API is called.
///
/// The market data feed and the document database each get their own limiter.
/// Callers reserve the next free slot under the lock and sleep outside it, so
/// concurrent symbols queue up in order instead of all waking at once.
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    next_slot: Mutex<Instant>,
    spacing: Duration,
}

impl RateLimiter {
    /// `max_concurrent` in-flight requests, at most `requests_per_minute` started per minute.
    pub fn new(max_concurrent: usize, requests_per_minute: u32) -> Self {
        let spacing = Duration::from_millis(60_000 / requests_per_minute.max(1) as u64);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            next_slot: Mutex::new(Instant::now()),
            spacing,
        }
    }

    /// Wait for a concurrency permit and the next request slot.
    ///
    /// The permit is held until the returned guard is dropped.
    pub async fn acquire(&self) -> RateLimitGuard {
        // The semaphore is never closed, so this only fails if that changes.
        let permit = self.permits.clone().acquire_owned().await.ok();

        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.spacing;
            slot
        };
        sleep_until(slot).await;

        RateLimitGuard { _permit: permit }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Releases the concurrency permit on drop.
pub struct RateLimitGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spacing_between_requests() {
        // 120 per minute = one every 500ms
        let limiter = RateLimiter::new(2, 120);
        assert_eq!(limiter.spacing(), Duration::from_millis(500));

        let start = std::time::Instant::now();
        drop(limiter.acquire().await);
        assert!(start.elapsed().as_millis() < 100, "first request should not wait");

        drop(limiter.acquire().await);
        assert!(start.elapsed().as_millis() >= 450, "second request should wait ~500ms");
    }

    #[tokio::test]
    async fn test_concurrency_permits_are_released() {
        let limiter = Arc::new(RateLimiter::new(2, 6000));

        let guard_a = limiter.acquire().await;
        let _guard_b = limiter.acquire().await;
        assert_eq!(limiter.available_permits(), 0);

        drop(guard_a);
        assert_eq!(limiter.available_permits(), 1);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let _guard = limiter.acquire().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(limiter.available_permits(), 1);
    }
}
