//! Read side of a leaderboard. Never triggers or waits for a recomputation;
//! callers get whatever state exists, partial, stale or empty.

use std::sync::Arc;

use serde::Serialize;

use crate::connections::{CacheResult, CacheStore};

/// One ranked agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    /// Agent display name.
    pub name: String,
    /// Listing count.
    pub score: f64,
}

/// Reads the ranking stored under one key.
#[derive(Clone)]
pub struct LeaderboardReader {
    store: Arc<dyn CacheStore>,
    key: String,
}

impl LeaderboardReader {
    /// Creates a reader for the leaderboard at `key`.
    pub fn new(store: Arc<dyn CacheStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// The leaderboard key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The `n` highest-scoring agents, score descending. Empty when the
    /// leaderboard does not exist.
    pub async fn top(&self, n: usize) -> CacheResult<Vec<LeaderboardEntry>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let entries = self.store.ztop(&self.key, n).await?;
        Ok(entries
            .into_iter()
            .map(|(name, score)| LeaderboardEntry { name, score })
            .collect())
    }
}
