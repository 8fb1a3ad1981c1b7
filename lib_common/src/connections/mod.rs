//! # Connections Module
//!
//! This module handles the shared key-value store every worker instance talks
//! to. The [`CacheStore`] trait is the contract the rest of the crate codes
//! against; two implementations are provided:
//!
//! - **`cache_redis`**: the production store, backed by a Redis
//!   `ConnectionManager`.
//! - **`cache_memory`**: an in-process store with the same semantics, including
//!   key expiry and key-lifecycle notifications. Used by tests and local runs.
//!
//! **`keyspace`** turns Redis key-event notifications into [`KeyEvent`]s for
//! the dispatcher.

#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Module for Redis cache operations and connection handling.
pub mod cache_redis;
/// In-process cache with expiry and key-lifecycle notifications.
pub mod cache_memory;
/// Redis key-event subscription.
pub mod keyspace;

pub use cache_memory::MemoryCache;
pub use cache_redis::CacheHandler;
pub use keyspace::KeyspaceListener;

/// Failures raised by a cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The Redis driver reported an error (connection, protocol, type).
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A key holds a value of a different type than the operation expects.
    #[error("wrong type for key '{0}'")]
    WrongType(String),

    /// The store is not reachable or refused the operation.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// The two key-lifecycle notification classes the dispatcher listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyEventKind {
    /// The key reached its time-to-live and was removed by the store.
    Expired,
    /// The key was removed by an explicit delete.
    Deleted,
    /// Synthetic event used to kick every job once at worker start.
    Startup,
}

impl KeyEventKind {
    /// Parses the event class from a Redis key-event channel name such as
    /// `__keyevent@0__:expired`.
    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel.rsplit(':').next()? {
            "expired" => Some(Self::Expired),
            "del" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// The Redis event name (`expired`, `del`) or `startup`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Deleted => "del",
            Self::Startup => "startup",
        }
    }
}

impl fmt::Display for KeyEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single key-lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// What happened to the key.
    pub kind: KeyEventKind,
    /// The affected key name.
    pub key: String,
}

impl KeyEvent {
    /// Builds an event for `key`.
    pub fn new(kind: KeyEventKind, key: impl Into<String>) -> Self {
        Self { kind, key: key.into() }
    }
}

/// The operations the leaderboard services need from the shared store.
///
/// Durations are applied with millisecond precision. Sorted-set scores are
/// `f64` as in Redis.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns true when `key` exists and has not expired.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Reads a string value.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Writes a string value, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Writes a string value only when the key is absent. Returns true when
    /// the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// Deletes a key. Returns true when something was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Deletes `key` only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> CacheResult<bool>;

    /// Sets the time-to-live of an existing key. Returns false when the key
    /// does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Resets the time-to-live of `key` only while it still holds `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> CacheResult<bool>;

    /// Remaining time-to-live; `None` when the key is missing or persistent.
    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>>;

    /// Adds `delta` to the score of `member`, creating set and member as
    /// needed. Returns the new score.
    async fn zincr(&self, key: &str, member: &str, delta: f64) -> CacheResult<f64>;

    /// Adds or updates `member` with `score`.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()>;

    /// Removes members whose score lies in `[min, max]`. Returns the number removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<u64>;

    /// Number of members in a sorted set (0 when missing).
    async fn zcard(&self, key: &str) -> CacheResult<u64>;

    /// The `count` highest-scoring members, score descending.
    async fn ztop(&self, key: &str, count: usize) -> CacheResult<Vec<(String, f64)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_event_kind_from_channel() {
        assert_eq!(KeyEventKind::from_channel("__keyevent@0__:expired"), Some(KeyEventKind::Expired));
        assert_eq!(KeyEventKind::from_channel("__keyevent@3__:del"), Some(KeyEventKind::Deleted));
        assert_eq!(KeyEventKind::from_channel("__keyevent@0__:set"), None);
    }
}
