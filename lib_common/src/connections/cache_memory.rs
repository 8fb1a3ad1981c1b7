//! # In-Process Cache
//!
//! A [`CacheStore`] held entirely in memory. It follows the Redis semantics the
//! services rely on closely enough to run the whole pipeline without a server:
//!
//! - Keys hold either a string or a sorted set; using one as the other is a
//!   `WrongType` error.
//! - Expiry is checked lazily on every access and eagerly by
//!   [`MemoryCache::purge_expired`] (or the background reaper). Both publish an
//!   `expired` event, like Redis' key-event notifications.
//! - Deletes publish a `del` event, including the implicit delete of a sorted
//!   set that became empty.
//!
//! Time is measured with `tokio::time::Instant`, so tests running on a paused
//! clock can move expiry forward with `tokio::time::advance`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CacheError, CacheResult, CacheStore, KeyEvent, KeyEventKind};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Entries = HashMap<String, Entry>;

/// Shared in-memory store. Clones share the same data and event bus.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<Entries>>,
    events: broadcast::Sender<KeyEvent>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribes to key-lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    /// Removes every expired key now and publishes one `expired` event per key.
    /// Returns how many keys were removed.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
            self.publish(KeyEventKind::Expired, key);
        }
        Ok(expired.len())
    }

    /// Runs [`purge_expired`](Self::purge_expired) every `period` until `shutdown`
    /// is cancelled, mimicking Redis' active expiry cycle.
    pub fn spawn_reaper(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.purge_expired() {
                            log::error!("Memory cache reaper failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Copies every notification into `tx` until `shutdown` is cancelled or the
    /// receiving side goes away. This is how the dispatcher is fed when running
    /// without Redis.
    pub fn spawn_event_forwarder(
        &self,
        tx: mpsc::Sender<KeyEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => received,
                };
                match event {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Memory cache event forwarder lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".to_string()))
    }

    fn publish(&self, kind: KeyEventKind, key: &str) {
        // No subscribers is fine
        let _ = self.events.send(KeyEvent::new(kind, key));
    }

    /// Drops `key` if its time-to-live has passed, publishing `expired`.
    fn evict_expired(&self, entries: &mut Entries, key: &str) {
        if entries.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            entries.remove(key);
            self.publish(KeyEventKind::Expired, key);
        }
    }

    fn live<'a>(&self, entries: &'a mut Entries, key: &str) -> Option<&'a mut Entry> {
        self.evict_expired(entries, key);
        entries.get_mut(key)
    }

    fn sorted_mut<'a>(
        &self,
        entries: &'a mut Entries,
        key: &str,
    ) -> CacheResult<&'a mut HashMap<String, f64>> {
        self.evict_expired(entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Sorted(set) => Ok(set),
            Value::Str(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut entries = self.lock()?;
        Ok(self.live(&mut entries, key).is_some())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut entries = self.lock()?;
        match self.live(&mut entries, key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut entries = self.lock()?;
        if self.live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut entries = self.lock()?;
        if self.live(&mut entries, key).is_none() {
            return Ok(false);
        }
        entries.remove(key);
        self.publish(KeyEventKind::Deleted, key);
        Ok(true)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let mut entries = self.lock()?;
        let matches = matches!(
            self.live(&mut entries, key),
            Some(Entry { value: Value::Str(s), .. }) if s.as_str() == expected
        );
        if matches {
            entries.remove(key);
            self.publish(KeyEventKind::Deleted, key);
        }
        Ok(matches)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut entries = self.lock()?;
        match self.live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> CacheResult<bool> {
        let mut entries = self.lock()?;
        match self.live(&mut entries, key) {
            Some(entry) if matches!(&entry.value, Value::Str(s) if s.as_str() == expected) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        Ok(self
            .live(&mut entries, key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn zincr(&self, key: &str, member: &str, delta: f64) -> CacheResult<f64> {
        let mut entries = self.lock()?;
        let set = self.sorted_mut(&mut entries, key)?;
        let score = set.entry(member.to_string()).or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let mut entries = self.lock()?;
        let set = self.sorted_mut(&mut entries, key)?;
        set.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<u64> {
        let mut entries = self.lock()?;
        let set = match self.live(&mut entries, key) {
            None => return Ok(0),
            Some(Entry { value: Value::Sorted(set), .. }) => set,
            Some(_) => return Err(CacheError::WrongType(key.to_string())),
        };
        let before = set.len();
        set.retain(|_, score| *score < min || *score > max);
        let removed = (before - set.len()) as u64;
        if removed > 0 && set.is_empty() {
            entries.remove(key);
            self.publish(KeyEventKind::Deleted, key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> CacheResult<u64> {
        let mut entries = self.lock()?;
        match self.live(&mut entries, key) {
            None => Ok(0),
            Some(Entry { value: Value::Sorted(set), .. }) => Ok(set.len() as u64),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn ztop(&self, key: &str, count: usize) -> CacheResult<Vec<(String, f64)>> {
        let mut entries = self.lock()?;
        let set = match self.live(&mut entries, key) {
            None => return Ok(Vec::new()),
            Some(Entry { value: Value::Sorted(set), .. }) => set,
            Some(_) => return Err(CacheError::WrongType(key.to_string())),
        };
        let mut ranked: Vec<(String, f64)> =
            set.iter().map(|(member, score)| (member.clone(), *score)).collect();
        // Same order as ZREVRANGE: score descending, ties by member descending
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        ranked.truncate(count);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_observed_and_published() {
        let cache = MemoryCache::new();
        let mut events = cache.subscribe();

        cache.set("board", "x", Some(Duration::from_secs(5))).await.unwrap();
        assert!(cache.exists("board").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cache.exists("board").await.unwrap());

        let event = events.recv().await.unwrap();
        assert_eq!(event, KeyEvent::new(KeyEventKind::Expired, "board"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_sweeps_untouched_keys() {
        let cache = MemoryCache::new();
        cache.zincr("board", "a", 1.0).await.unwrap();
        cache.expire("board", Duration::from_secs(1)).await.unwrap();
        cache.set("other", "keep", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(cache.exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_increments() {
        let cache = MemoryCache::new();
        cache.zincr("board", "a", 2.0).await.unwrap();
        cache.zincr("board", "b", 5.0).await.unwrap();
        assert_eq!(cache.zincr("board", "a", 4.0).await.unwrap(), 6.0);

        let top = cache.ztop("board", 10).await.unwrap();
        assert_eq!(top, vec![("a".to_string(), 6.0), ("b".to_string(), 5.0)]);
        assert_eq!(cache.ztop("board", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let cache = MemoryCache::new();
        cache.set("plain", "v", None).await.unwrap();
        let err = cache.zincr("plain", "a", 1.0).await.unwrap_err();
        assert!(matches!(err, CacheError::WrongType(_)));
    }

    #[tokio::test]
    async fn test_emptied_sorted_set_is_deleted() {
        let cache = MemoryCache::new();
        let mut events = cache.subscribe();
        cache.zadd("window", "t1", 10.0).await.unwrap();
        cache.zadd("window", "t2", 20.0).await.unwrap();

        assert_eq!(cache.zrem_range_by_score("window", 0.0, 15.0).await.unwrap(), 1);
        assert_eq!(cache.zcard("window").await.unwrap(), 1);
        assert_eq!(cache.zrem_range_by_score("window", 0.0, 25.0).await.unwrap(), 1);
        assert!(!cache.exists("window").await.unwrap());
        assert_eq!(events.recv().await.unwrap().kind, KeyEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_conditional_delete_and_expire() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("lock", "t1", Duration::from_secs(10)).await.unwrap());
        assert!(!cache.set_nx("lock", "t2", Duration::from_secs(10)).await.unwrap());

        assert!(!cache.expire_if_eq("lock", "t2", Duration::from_secs(30)).await.unwrap());
        assert!(cache.expire_if_eq("lock", "t1", Duration::from_secs(30)).await.unwrap());
        assert!(cache.ttl("lock").await.unwrap().unwrap() > Duration::from_secs(10));

        assert!(!cache.delete_if_eq("lock", "t2").await.unwrap());
        assert!(cache.delete_if_eq("lock", "t1").await.unwrap());
        assert!(!cache.exists("lock").await.unwrap());
    }
}
