//! # Leaderboard Aggregation Job
//!
//! Computes, or resumes computing, one leaderboard of agents ranked by listing
//! count. Any number of worker instances may receive the trigger; the
//! distributed lock lets exactly one of them page through the feed.
//!
//! ## Run Workflow:
//!
//! 1.  **Exclusivity**: take the lock without waiting. Contention returns
//!     [`JobOutcome::Contended`].
//! 2.  **Idempotency**: a leaderboard that exists with no checkpoint is
//!     complete ([`JobOutcome::AlreadyComplete`]). A checkpoint, even an empty
//!     one, means an interrupted run and wins over that check.
//! 3.  **Pagination** from the checkpoint (or the first page). Per page:
//!     renew the lock, ask the rate limiter, fetch, add per-agent counts to
//!     the leaderboard, then store the next token as the checkpoint. The
//!     checkpoint is only written after the page's increments, so it always
//!     reads "processed through here".
//! 4.  **Finalize**: when the feed is exhausted, set the leaderboard's expiry
//!     (its expiry is the next trigger) and delete the checkpoint. Rate
//!     limiting, cancellation, a lost lock or an error leave the checkpoint for
//!     the next trigger.
//! 5.  **Release** the lock on every path.
//! 6.  **Re-arm**: a run that stopped early or failed sets a short-lived retry
//!     key after releasing the lock. Its expiry is a trigger, so every
//!     unfinished board keeps a live key that will resume it.
//!
//! ```text
//! Idle -> LockAcquired -> AlreadyComplete -> Idle
//!                      -> Paginating -> Exhausted -> Complete (expire board, drop checkpoint)
//!                                    -> RateLimited | Cancelled | LockLost | Error -> Incomplete
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::connections::{CacheError, CacheStore, KeyEvent, KeyEventKind};
use crate::core::dispatcher::{HandlerError, KeyEventHandler};
use crate::core::lock::{DistributedLock, LockGuard};
use crate::core::rate_limiter::RateLimiter;
use crate::feeds::{FeedClient, FeedError, FeedPage};

/// The cache keys of one leaderboard, all derived from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardKeys {
    /// Sorted set of agent name -> listing count.
    pub leaderboard: String,
    /// Continuation token of an interrupted run.
    pub checkpoint: String,
    /// Sliding-window timestamps for upstream calls.
    pub rate_limit: String,
    /// Distributed lock.
    pub lock: String,
    /// Set after an unfinished run; its expiry retries the job.
    pub retry: String,
}

impl LeaderboardKeys {
    /// Derives the key set from `prefix` (e.g. `funda:Makelaar:top10`).
    pub fn new(prefix: &str) -> Self {
        Self {
            leaderboard: prefix.to_string(),
            checkpoint: format!("{}:progress", prefix),
            rate_limit: format!("{}:rate-limit", prefix),
            lock: format!("{}:lock", prefix),
            retry: format!("{}:retry", prefix),
        }
    }

    /// Keys whose expiry or deletion should trigger this job: the leaderboard
    /// itself, the rate-limit window, which lapses one window after a
    /// rate-limited run stopped, and the retry key.
    pub fn trigger_keys(&self) -> Vec<String> {
        vec![self.leaderboard.clone(), self.rate_limit.clone(), self.retry.clone()]
    }
}

/// Tunables of one job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Lock expiry, renewed before every page after the first.
    pub lock_ttl: Duration,
    /// Expiry set on the leaderboard after a complete run.
    pub leaderboard_ttl: Duration,
    /// Upstream calls admitted per window.
    pub rate_limit: u64,
    /// Rate-limit window. Also the delay before an unfinished run is retried.
    pub rate_window: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5 * 60),
            leaderboard_ttl: Duration::from_secs(720 * 60),
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
        }
    }
}

/// Why a run stopped before the feed was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
    /// The rate limiter denied the next upstream call.
    RateLimited,
    /// The cancellation token fired between pages.
    Cancelled,
    /// Renewing the lock failed; another instance may own it now.
    LockLost,
}

impl fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RateLimited => "rate limited",
            Self::Cancelled => "cancelled",
            Self::LockLost => "lock lost",
        })
    }
}

/// Result of one [`LeaderboardJob::run`] that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another instance holds the lock.
    Contended,
    /// The leaderboard exists and no checkpoint is pending.
    AlreadyComplete,
    /// The feed was exhausted; leaderboard expiry set, checkpoint removed.
    Completed {
        /// Pages aggregated in this run.
        pages: u64,
    },
    /// The run stopped early; the checkpoint is kept for the next trigger.
    Incomplete {
        /// What stopped it.
        reason: IncompleteReason,
        /// Pages aggregated in this run.
        pages: u64,
    },
}

/// Unexpected failures. The lock is released and the checkpoint left as it
/// was before these are returned.
#[derive(Debug, Error)]
pub enum JobError {
    /// The shared cache failed.
    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),

    /// A page could not be fetched.
    #[error("feed failure: {0}")]
    Feed(#[from] FeedError),
}

enum Pagination {
    Exhausted { pages: u64 },
    Stopped { reason: IncompleteReason, pages: u64 },
}

/// Aggregation job for one leaderboard.
pub struct LeaderboardJob {
    name: String,
    keys: LeaderboardKeys,
    trigger_keys: Vec<String>,
    settings: JobSettings,
    store: Arc<dyn CacheStore>,
    feed: Arc<dyn FeedClient>,
    limiter: Arc<dyn RateLimiter>,
    lock: DistributedLock,
}

impl LeaderboardJob {
    /// Assembles a job. `name` only appears in logs.
    pub fn new(
        name: impl Into<String>,
        keys: LeaderboardKeys,
        settings: JobSettings,
        store: Arc<dyn CacheStore>,
        feed: Arc<dyn FeedClient>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            name: name.into(),
            trigger_keys: keys.trigger_keys(),
            keys,
            settings,
            lock: DistributedLock::new(Arc::clone(&store)),
            store,
            feed,
            limiter,
        }
    }

    /// Runs one attempt. See the module docs for the workflow.
    pub async fn run(
        &self,
        event: KeyEventKind,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let guard = self.lock.acquire(&self.keys.lock, self.settings.lock_ttl).await?;
        if !guard.is_acquired() {
            log::warn!("[{}] Could not acquire lock '{}', another instance is processing.", self.name, self.keys.lock);
            return Ok(JobOutcome::Contended);
        }

        let result = self.run_locked(&guard, event, cancel).await;

        if let Err(e) = guard.release().await {
            log::warn!("[{}] Failed to release lock '{}', it will expire: {}", self.name, self.keys.lock, e);
        }

        if let Err(e) = &result {
            log::error!("[{}] Run failed, checkpoint retained for retry: {}", self.name, e);
        }
        if matches!(result, Ok(JobOutcome::Incomplete { .. }) | Err(_)) {
            self.arm_retry().await;
        }
        result
    }

    /// Leaves a trigger behind for an unfinished board. Must run after the
    /// lock is released, or the expiry could be lost as contention.
    async fn arm_retry(&self) {
        let delay = self.settings.rate_window;
        match self.store.set(&self.keys.retry, "1", Some(delay)).await {
            Ok(()) => log::info!("[{}] Retry scheduled in {:?} via '{}'.", self.name, delay, self.keys.retry),
            Err(e) => log::warn!("[{}] Could not schedule retry '{}': {}", self.name, self.keys.retry, e),
        }
    }

    async fn run_locked(
        &self,
        guard: &LockGuard,
        event: KeyEventKind,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let checkpoint = self.store.get(&self.keys.checkpoint).await?;

        if checkpoint.is_none() && self.store.exists(&self.keys.leaderboard).await? {
            log::info!("[{}] Leaderboard '{}' already processed, skipping.", self.name, self.keys.leaderboard);
            return Ok(JobOutcome::AlreadyComplete);
        }

        let resume = checkpoint.filter(|token| !token.trim().is_empty());
        log::info!(
            "[{}] Processing '{}' for event '{}', starting at {}",
            self.name,
            self.keys.leaderboard,
            event,
            resume.as_deref().unwrap_or("first page")
        );

        match self.paginate(guard, resume, cancel).await? {
            Pagination::Exhausted { pages } => {
                self.store
                    .expire(&self.keys.leaderboard, self.settings.leaderboard_ttl)
                    .await?;
                self.store.delete(&self.keys.checkpoint).await?;
                log::info!(
                    "[{}] Stored leaderboard '{}' from {} page(s).",
                    self.name,
                    self.keys.leaderboard,
                    pages
                );
                Ok(JobOutcome::Completed { pages })
            }
            Pagination::Stopped { reason, pages } => {
                log::info!(
                    "[{}] Processing did not complete ({}) after {} page(s); checkpoint retained for retry.",
                    self.name,
                    reason,
                    pages
                );
                Ok(JobOutcome::Incomplete { reason, pages })
            }
        }
    }

    async fn paginate(
        &self,
        guard: &LockGuard,
        mut token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Pagination, JobError> {
        let mut pages = 0u64;

        loop {
            if cancel.is_cancelled() {
                self.save_checkpoint(token.as_deref()).await?;
                return Ok(Pagination::Stopped { reason: IncompleteReason::Cancelled, pages });
            }

            // Heartbeat: the lock must outlive the whole loop, not just its start.
            if pages > 0 && !guard.extend(self.settings.lock_ttl).await? {
                log::warn!("[{}] Lock '{}' lost mid-run, stopping.", self.name, guard.key());
                return Ok(Pagination::Stopped { reason: IncompleteReason::LockLost, pages });
            }

            let admitted = self
                .limiter
                .try_acquire(&self.keys.rate_limit, self.settings.rate_limit, self.settings.rate_window)
                .await?;
            if !admitted {
                log::warn!(
                    "[{}] Rate limit exceeded for '{}' at {}",
                    self.name,
                    self.keys.leaderboard,
                    token.as_deref().unwrap_or("first page")
                );
                self.save_checkpoint(token.as_deref()).await?;
                return Ok(Pagination::Stopped { reason: IncompleteReason::RateLimited, pages });
            }

            let page = self.feed.fetch_page(token.as_deref()).await?;
            if page.records.is_empty() {
                return Ok(Pagination::Exhausted { pages });
            }

            self.apply_page(&page).await?;
            pages += 1;

            token = page.next_token.filter(|t| !t.trim().is_empty());
            self.save_checkpoint(token.as_deref()).await?;

            if token.is_none() {
                return Ok(Pagination::Exhausted { pages });
            }
        }
    }

    /// Adds one page's per-agent counts to the leaderboard.
    async fn apply_page(&self, page: &FeedPage) -> Result<(), JobError> {
        for (name, count) in count_by_agent(page) {
            self.store
                .zincr(&self.keys.leaderboard, &name, count as f64)
                .await?;
        }
        Ok(())
    }

    async fn save_checkpoint(&self, token: Option<&str>) -> Result<(), JobError> {
        self.store
            .set(&self.keys.checkpoint, token.unwrap_or_default(), None)
            .await?;
        Ok(())
    }
}

/// Groups a page by agent id, skipping blank names. Each group is named after
/// its first record and keeps first-seen order.
fn count_by_agent(page: &FeedPage) -> Vec<(String, u64)> {
    let mut order: Vec<(String, u64)> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();

    for record in &page.records {
        let Some(name) = record.agent_name.as_deref().filter(|n| !n.trim().is_empty()) else {
            continue;
        };
        match index.get(&record.agent_id) {
            Some(&i) => order[i].1 += 1,
            None => {
                index.insert(record.agent_id, order.len());
                order.push((name.to_string(), 1));
            }
        }
    }
    order
}

#[async_trait]
impl KeyEventHandler for LeaderboardJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_patterns(&self) -> &[String] {
        &self.trigger_keys
    }

    async fn handle(&self, event: &KeyEvent, cancel: CancellationToken) -> Result<(), HandlerError> {
        self.run(event.kind, &cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryCache;
    use crate::core::rate_limiter::SlidingWindowRateLimiter;
    use crate::feeds::FeedRecord;

    /// Feed whose every fetch first deletes the lock, as if it had expired
    /// and been taken over elsewhere.
    struct LockStealingFeed {
        cache: MemoryCache,
        lock_key: String,
    }

    #[async_trait]
    impl FeedClient for LockStealingFeed {
        async fn fetch_page(&self, token: Option<&str>) -> Result<FeedPage, FeedError> {
            self.cache.delete(&self.lock_key).await.map_err(|e| FeedError::InvalidQuery(e.to_string()))?;
            let next = match token {
                None => Some("page2".to_string()),
                Some(_) => None,
            };
            Ok(FeedPage { records: vec![FeedRecord::new(1, "Makelaar1")], next_token: next })
        }
    }

    #[test]
    fn test_keys_share_the_prefix() {
        let keys = LeaderboardKeys::new("funda:Makelaar:top10");
        assert_eq!(keys.checkpoint, "funda:Makelaar:top10:progress");
        assert_eq!(keys.rate_limit, "funda:Makelaar:top10:rate-limit");
        assert_eq!(keys.lock, "funda:Makelaar:top10:lock");
        assert_eq!(keys.retry, "funda:Makelaar:top10:retry");
        assert_eq!(
            keys.trigger_keys(),
            vec![
                "funda:Makelaar:top10".to_string(),
                "funda:Makelaar:top10:rate-limit".to_string(),
                "funda:Makelaar:top10:retry".to_string(),
            ]
        );
    }

    #[test]
    fn test_count_by_agent_groups_by_id_and_skips_blank_names() {
        let page = FeedPage {
            records: vec![
                FeedRecord::new(123, "Makelaar1"),
                FeedRecord::new(456, "Makelaar2"),
                FeedRecord::new(123, "Makelaar1"),
                FeedRecord::new(789, "  "),
                FeedRecord { agent_id: 790, agent_name: None },
            ],
            next_token: None,
        };

        assert_eq!(
            count_by_agent(&page),
            vec![("Makelaar1".to_string(), 2), ("Makelaar2".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_lost_lock_stops_the_run_and_keeps_the_checkpoint() {
        let cache = MemoryCache::new();
        let keys = LeaderboardKeys::new("lb");
        let store: Arc<dyn CacheStore> = Arc::new(cache.clone());
        let feed = Arc::new(LockStealingFeed { cache: cache.clone(), lock_key: keys.lock.clone() });
        let limiter = Arc::new(SlidingWindowRateLimiter::new(Arc::clone(&store)));
        let job = LeaderboardJob::new("lb", keys.clone(), JobSettings::default(), store, feed, limiter);

        let outcome = job.run(KeyEventKind::Expired, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, JobOutcome::Incomplete { reason: IncompleteReason::LockLost, pages: 1 });
        assert_eq!(cache.get(&keys.checkpoint).await.unwrap().as_deref(), Some("page2"));
        assert_eq!(cache.ttl(&keys.leaderboard).await.unwrap(), None);
        assert!(cache.ttl(&keys.retry).await.unwrap().is_some());
    }
}
