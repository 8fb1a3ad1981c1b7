//! # Sliding Window Rate Limiter
//!
//! Admission control for calls to the upstream feed, shared by every worker
//! instance through the cache. Each resource key holds a sorted set of
//! admission timestamps (milliseconds since the epoch):
//!
//! 1.  Purge timestamps older than `now - window`.
//! 2.  Count what is left; at `limit` or above the call is denied.
//! 3.  Otherwise record `now` and push the key's expiry out to one window, so
//!     an idle resource cleans itself up.
//!
//! The window slides with `now` rather than resetting on fixed boundaries, so
//! there is no double burst around a bucket edge.
//!
//! The three steps are separate round trips. Two instances racing through
//! them may both be admitted at the boundary; the limiter is upstream
//! courtesy, not a hard quota, and mild over-admission is accepted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::connections::{CacheResult, CacheStore};

/// Source of "now" in Unix milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Admits or denies one unit of work against a shared quota.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Returns true when the call is admitted and has been recorded.
    async fn try_acquire(&self, resource: &str, limit: u64, window: Duration) -> CacheResult<bool>;
}

/// Store-backed sliding-window [`RateLimiter`].
pub struct SlidingWindowRateLimiter {
    store: Arc<dyn CacheStore>,
    clock: Clock,
}

impl SlidingWindowRateLimiter {
    /// Creates a limiter on `store` using the system clock.
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Replaces the clock, for tests that need to move time.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn try_acquire(&self, resource: &str, limit: u64, window: Duration) -> CacheResult<bool> {
        let now = (self.clock)();
        let lower_bound = now - window.as_millis() as i64;

        // Scores are whole milliseconds; everything strictly below the bound goes.
        self.store
            .zrem_range_by_score(resource, 0.0, (lower_bound - 1) as f64)
            .await?;

        let count = self.store.zcard(resource).await?;
        if count >= limit {
            log::debug!("Rate limit reached for '{}': {}/{}", resource, count, limit);
            return Ok(false);
        }

        // Unique member so two admissions in the same millisecond both count
        let member = format!("{}-{}", now, uuid::Uuid::new_v4().simple());
        self.store.zadd(resource, &member, now as f64).await?;
        self.store.expire(resource, window).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryCache;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn limiter_at(cache: &MemoryCache, now: Arc<AtomicI64>) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(Arc::new(cache.clone()))
            .with_clock(Arc::new(move || now.load(Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn test_third_call_in_window_is_denied() {
        let cache = MemoryCache::new();
        let now = Arc::new(AtomicI64::new(1_700_000_000_000));
        let limiter = limiter_at(&cache, now.clone());
        let window = Duration::from_secs(60);

        assert!(limiter.try_acquire("rl", 2, window).await.unwrap());
        now.fetch_add(300, Ordering::SeqCst);
        assert!(limiter.try_acquire("rl", 2, window).await.unwrap());
        now.fetch_add(300, Ordering::SeqCst);
        assert!(!limiter.try_acquire("rl", 2, window).await.unwrap());

        // Denied calls are not recorded
        assert_eq!(cache.zcard("rl").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_window_slides_instead_of_resetting() {
        let cache = MemoryCache::new();
        let start = 1_700_000_000_000;
        let now = Arc::new(AtomicI64::new(start));
        let limiter = limiter_at(&cache, now.clone());
        let window = Duration::from_secs(60);

        assert!(limiter.try_acquire("rl", 2, window).await.unwrap());
        now.store(start + 30_000, Ordering::SeqCst);
        assert!(limiter.try_acquire("rl", 2, window).await.unwrap());

        // First admission has left the window, the second has not
        now.store(start + 61_000, Ordering::SeqCst);
        assert!(limiter.try_acquire("rl", 2, window).await.unwrap());
        assert!(!limiter.try_acquire("rl", 2, window).await.unwrap());

        // Both older admissions gone
        now.store(start + 122_000, Ordering::SeqCst);
        assert!(limiter.try_acquire("rl", 2, window).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_millisecond_admissions_are_counted_separately() {
        let cache = MemoryCache::new();
        let now = Arc::new(AtomicI64::new(1_700_000_000_000));
        let limiter = limiter_at(&cache, now);

        for _ in 0..3 {
            assert!(limiter.try_acquire("rl", 3, Duration::from_secs(1)).await.unwrap());
        }
        assert!(!limiter.try_acquire("rl", 3, Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_key_gets_an_expiry() {
        let cache = MemoryCache::new();
        let limiter = SlidingWindowRateLimiter::new(Arc::new(cache.clone()));

        assert!(limiter.try_acquire("rl", 10, Duration::from_secs(60)).await.unwrap());
        let ttl = cache.ttl("rl").await.unwrap().expect("window key should expire");
        assert!(ttl <= Duration::from_secs(60));
    }
}
