//! # Redis Cache Implementation
//!
//! Provides an asynchronous [`CacheStore`] over a Redis `ConnectionManager`.
//! The manager reconnects on its own and is cheap to clone, so every call
//! clones it instead of holding a lock.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::{CacheResult, CacheStore};

const RELEASE_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const EXPIRE_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// A handler for Redis cache interactions.
#[derive(Clone)]
pub struct CacheHandler {
    /// The internal Redis client instance, kept for pub/sub connections.
    client: Client,
    /// Multiplexed, auto-reconnecting connection used for commands.
    conn: ConnectionManager,
    release_script: Script,
    extend_script: Script,
}

impl CacheHandler {
    /// Creates a new CacheHandler from a connection string.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn new(url: &str) -> CacheResult<Self> {
        // Open the connection to the redis server
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            release_script: Script::new(RELEASE_IF_EQ),
            extend_script: Script::new(EXPIRE_IF_EQ),
        })
    }

    /// The underlying client, used to open dedicated pub/sub connections.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Round-trips a PING to verify the server is reachable.
    pub async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Turns on key-event notifications (`CONFIG SET notify-keyspace-events`).
    ///
    /// Managed Redis offerings often forbid `CONFIG`; callers treat a failure
    /// here as a warning and rely on the server being preconfigured.
    pub async fn enable_keyspace_events(&self, flags: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(flags)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX/PEXPIRE reject 0
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for CacheHandler {
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let found: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found)
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let applied: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .extend_script
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(applied > 0)
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        // -2: missing, -1: no expiry
        let remaining: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok((remaining >= 0).then(|| Duration::from_millis(remaining as u64)))
    }

    async fn zincr(&self, key: &str, member: &str, delta: f64) -> CacheResult<f64> {
        let mut conn = self.conn.clone();
        let score: f64 = redis::cmd("ZINCRBY")
            .arg(key)
            .arg(delta)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn ztop(&self, key: &str, count: usize) -> CacheResult<Vec<(String, f64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        // ZREVRANGE stop index is inclusive
        let entries: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(0)
            .arg(i64::try_from(count).unwrap_or(i64::MAX) - 1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }
}
