//! Fixtures for the scenario tests: a scripted feed, a controllable clock and
//! a helper that wires a job to an in-process cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use lib_common::connections::{CacheStore, MemoryCache};
use lib_common::core::{JobSettings, LeaderboardJob, LeaderboardKeys, SlidingWindowRateLimiter};
use lib_common::feeds::{FeedClient, FeedError, FeedPage, FeedRecord};

/// What the scripted feed answers for one token.
#[derive(Debug, Clone)]
pub enum Step {
    Page(FeedPage),
    /// Fails with this HTTP status.
    Fail(u16),
}

/// Builds a page from `(agent id, agent name)` pairs.
pub fn page(records: &[(i64, &str)], next: Option<&str>) -> Step {
    Step::Page(FeedPage {
        records: records
            .iter()
            .map(|(id, name)| FeedRecord::new(*id, name))
            .collect(),
        next_token: next.map(str::to_string),
    })
}

/// A feed answering from a token -> step table and recording every call.
#[derive(Default)]
pub struct ScriptedFeed {
    steps: HashMap<Option<String>, Step>,
    calls: Mutex<Vec<Option<String>>>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    stalls: Mutex<HashMap<Option<String>, (Duration, u16)>>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `step` for `token` (`None` is the first page).
    pub fn on(mut self, token: Option<&str>, step: Step) -> Self {
        self.steps.insert(token.map(str::to_string), step);
        self
    }

    /// Makes the first fetch of `token` hang for `delay` and then fail with
    /// `status`; later fetches answer from the table.
    pub fn stall_once(self, token: Option<&str>, delay: Duration, status: u16) -> Self {
        if let Ok(mut stalls) = self.stalls.lock() {
            stalls.insert(token.map(str::to_string), (delay, status));
        }
        self
    }

    /// Makes every fetch signal `entered` and then wait for `release`.
    pub fn gated(mut self, entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.gate = Some((entered, release));
        self
    }

    /// Tokens of every fetch so far, in order.
    pub fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FeedClient for ScriptedFeed {
    async fn fetch_page(&self, token: Option<&str>) -> Result<FeedPage, FeedError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(token.map(str::to_string));
        }
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        let stall = self
            .stalls
            .lock()
            .ok()
            .and_then(|mut s| s.remove(&token.map(str::to_string)));
        if let Some((delay, status)) = stall {
            tokio::time::sleep(delay).await;
            return Err(FeedError::Status {
                status,
                body: "gateway timeout".to_string(),
            });
        }
        // Unscripted tokens read as the end of the feed
        match self.steps.get(&token.map(str::to_string)) {
            Some(Step::Page(p)) => Ok(p.clone()),
            Some(Step::Fail(status)) => Err(FeedError::Status {
                status: *status,
                body: "scripted failure".to_string(),
            }),
            None => Ok(FeedPage::default()),
        }
    }
}

/// Manually advanced wall clock in Unix milliseconds.
#[derive(Clone)]
pub struct TestClock(Arc<AtomicI64>);

impl TestClock {
    pub fn new(start_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start_ms)))
    }

    pub fn advance_ms(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn limiter(&self, store: Arc<dyn CacheStore>) -> SlidingWindowRateLimiter {
        let now = Arc::clone(&self.0);
        SlidingWindowRateLimiter::new(store).with_clock(Arc::new(move || now.load(Ordering::SeqCst)))
    }
}

/// Everything a scenario needs around one job.
pub struct Harness {
    pub cache: MemoryCache,
    pub keys: LeaderboardKeys,
    pub feed: Arc<ScriptedFeed>,
    pub clock: TestClock,
    pub job: Arc<LeaderboardJob>,
}

impl Harness {
    pub fn new(feed: ScriptedFeed, settings: JobSettings) -> Self {
        Self::on_cache(MemoryCache::new(), feed, settings)
    }

    /// Wires a job for `test:board` onto an existing cache.
    pub fn on_cache(cache: MemoryCache, feed: ScriptedFeed, settings: JobSettings) -> Self {
        let keys = LeaderboardKeys::new("test:board");
        let store: Arc<dyn CacheStore> = Arc::new(cache.clone());
        let feed = Arc::new(feed);
        let clock = TestClock::new(1_700_000_000_000);
        let limiter = Arc::new(clock.limiter(Arc::clone(&store)));
        let job = Arc::new(LeaderboardJob::new(
            "test:board",
            keys.clone(),
            settings,
            store,
            Arc::clone(&feed) as Arc<dyn FeedClient>,
            limiter,
        ));
        Self {
            cache,
            keys,
            feed,
            clock,
            job,
        }
    }

    /// Score of `agent`, if present.
    pub async fn score(&self, agent: &str) -> Option<f64> {
        self.cache
            .ztop(&self.keys.leaderboard, usize::MAX)
            .await
            .ok()?
            .into_iter()
            .find(|(name, _)| name == agent)
            .map(|(_, score)| score)
    }

    pub async fn checkpoint(&self) -> Option<String> {
        self.cache.get(&self.keys.checkpoint).await.ok().flatten()
    }
}
