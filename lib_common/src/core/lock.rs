//! # Distributed Lock
//!
//! A mutual-exclusion marker in the shared cache: `SET key token NX PX ttl`.
//! Only the holder of the random token may extend or release it, and the
//! expiry bounds how long a crashed holder can block everyone else.
//!
//! Acquisition never waits. A guard that was not acquired is returned as-is
//! and the caller decides what contention means (for the aggregation job:
//! "someone else is on it, return").

use std::sync::Arc;
use std::time::Duration;

use crate::connections::{CacheResult, CacheStore};

/// Factory for [`LockGuard`]s on one store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CacheStore>,
}

impl DistributedLock {
    /// Creates a lock factory on `store`.
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Tries once to take `key` for `ttl`.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> CacheResult<LockGuard> {
        let token = uuid::Uuid::new_v4().to_string();
        let acquired = self.store.set_nx(key, &token, ttl).await?;
        if acquired {
            log::debug!("Lock '{}' acquired", key);
        }
        Ok(LockGuard {
            store: Arc::clone(&self.store),
            key: key.to_string(),
            token,
            acquired,
            released: !acquired,
        })
    }
}

/// Handle to one acquisition attempt.
///
/// Release it with [`LockGuard::release`] on every exit path. A guard dropped
/// while still held (panic, aborted task) schedules a best-effort release on
/// the current Tokio runtime; failing that, the lock simply expires.
pub struct LockGuard {
    store: Arc<dyn CacheStore>,
    key: String,
    token: String,
    acquired: bool,
    released: bool,
}

impl LockGuard {
    /// Whether this attempt obtained the lock.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Pushes the expiry out to `ttl` from now. Returns false when the lock
    /// is no longer ours (it expired and someone else took it, or it is gone).
    pub async fn extend(&self, ttl: Duration) -> CacheResult<bool> {
        if !self.acquired || self.released {
            return Ok(false);
        }
        self.store.expire_if_eq(&self.key, &self.token, ttl).await
    }

    /// Releases the lock if we still hold it. Returns true when our token was
    /// removed; false when it had already expired or was never acquired.
    pub async fn release(mut self) -> CacheResult<bool> {
        if self.released {
            return Ok(false);
        }
        let removed = self.store.delete_if_eq(&self.key, &self.token).await?;
        self.released = true;
        log::debug!("Lock '{}' released (held: {})", self.key, removed);
        Ok(removed)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.delete_if_eq(&key, &token).await {
                log::warn!("Deferred release of lock '{}' failed: {}", key, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryCache;

    #[tokio::test]
    async fn test_second_acquire_is_denied_until_release() {
        let cache = MemoryCache::new();
        let lock = DistributedLock::new(Arc::new(cache.clone()));

        let first = lock.acquire("board:lock", Duration::from_secs(300)).await.unwrap();
        let second = lock.acquire("board:lock", Duration::from_secs(300)).await.unwrap();
        assert!(first.is_acquired());
        assert!(!second.is_acquired());

        assert!(!second.release().await.unwrap());
        assert!(first.release().await.unwrap());

        let third = lock.acquire("board:lock", Duration::from_secs(300)).await.unwrap();
        assert!(third.is_acquired());
        third.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_cannot_be_extended_or_released_by_old_holder() {
        let cache = MemoryCache::new();
        let lock = DistributedLock::new(Arc::new(cache.clone()));

        let stale = lock.acquire("board:lock", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let fresh = lock.acquire("board:lock", Duration::from_secs(60)).await.unwrap();
        assert!(fresh.is_acquired());

        assert!(!stale.extend(Duration::from_secs(60)).await.unwrap());
        assert!(!stale.release().await.unwrap());
        assert!(cache.exists("board:lock").await.unwrap());

        assert!(fresh.extend(Duration::from_secs(60)).await.unwrap());
        assert!(fresh.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let cache = MemoryCache::new();
        let lock = DistributedLock::new(Arc::new(cache.clone()));

        {
            let guard = lock.acquire("board:lock", Duration::from_secs(300)).await.unwrap();
            assert!(guard.is_acquired());
        }

        for _ in 0..100 {
            if !cache.exists("board:lock").await.unwrap() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!cache.exists("board:lock").await.unwrap());
    }
}
