use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lib_common::connections::{CacheHandler, CacheStore, KeyspaceListener};
use lib_common::core::{
    KeyEventDispatcher, LeaderboardJob, RateLimiter, SlidingWindowRateLimiter,
};
use lib_common::feeds::{FeedClient, FundaClient, FundaQuery};

use crate::leaderboard_logic::config::WorkerSettings;

/// `E` key-event channels, `g` generic commands (del), `x` expirations.
const KEYSPACE_FLAGS: &str = "Egx";

/// Key events buffered between the subscription and the dispatcher.
const EVENT_BUFFER: usize = 256;

/// Registers one aggregation job per configured board.
pub fn build_dispatcher(settings: &WorkerSettings, store: Arc<dyn CacheStore>) -> Result<KeyEventDispatcher> {
    let limiter: Arc<dyn RateLimiter> = Arc::new(SlidingWindowRateLimiter::new(Arc::clone(&store)));
    let mut dispatcher = KeyEventDispatcher::new().with_startup_kick(true);

    for board in &settings.boards {
        let query = FundaQuery {
            area: board.area.clone(),
            ..settings.feed.clone()
        };
        let feed: Arc<dyn FeedClient> = Arc::new(
            FundaClient::new(query)
                .with_context(|| format!("Invalid feed settings for '{}'", board.keys.leaderboard))?,
        );
        let job = LeaderboardJob::new(
            board.keys.leaderboard.clone(),
            board.keys.clone(),
            settings.job.clone(),
            Arc::clone(&store),
            feed,
            Arc::clone(&limiter),
        );
        dispatcher.register(Arc::new(job));
    }

    Ok(dispatcher)
}

/// Connects to Redis and serves key events until `shutdown` fires.
pub async fn run(settings: WorkerSettings, shutdown: CancellationToken) -> Result<()> {
    let cache = CacheHandler::new(&settings.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))?;
    cache.ping().await.context("Redis did not answer PING")?;
    log::info!("Connected to Redis at {}", settings.redis_url);

    if settings.enable_keyspace_events {
        // Managed Redis often forbids CONFIG; notifications may already be on.
        match cache.enable_keyspace_events(KEYSPACE_FLAGS).await {
            Ok(()) => log::info!("Keyspace notifications enabled ({})", KEYSPACE_FLAGS),
            Err(e) => log::warn!("Could not enable keyspace notifications: {}", e),
        }
    }

    let store: Arc<dyn CacheStore> = Arc::new(cache.clone());
    let dispatcher = build_dispatcher(&settings, store)?;
    log::info!("{} leaderboard job(s) registered", dispatcher.len());

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let listener = KeyspaceListener::new(cache.client().clone(), settings.redis_db)
        .with_reconnect_delay(settings.reconnect_delay);
    let listener_handle = tokio::spawn(listener.run(tx, shutdown.clone()));

    dispatcher.run(rx, shutdown.clone()).await;

    // The dispatcher also stops when the listener gives up; make sure both end
    shutdown.cancel();
    if let Err(e) = listener_handle.await {
        log::warn!("Keyspace listener task ended abnormally: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard_logic::config::{BoardSettings, WorkerConfig};
    use lib_common::connections::MemoryCache;
    use lib_common::core::KeyEventHandler;

    #[test]
    fn test_build_dispatcher_routes_each_board() {
        let mut settings = WorkerConfig {
            api_key: Some("KEY".to_string()),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        settings.boards.push(BoardSettings::parse("funda:Makelaar:utrecht=/utrecht/").unwrap());

        let dispatcher = build_dispatcher(&settings, Arc::new(MemoryCache::new())).unwrap();

        assert_eq!(dispatcher.len(), 2);
        assert_eq!(
            dispatcher.handler_for("funda:Makelaar:top10").map(|h| h.name().to_string()),
            Some("funda:Makelaar:top10".to_string())
        );
        assert_eq!(
            dispatcher
                .handler_for("funda:Makelaar:utrecht:rate-limit")
                .map(|h| h.name().to_string()),
            Some("funda:Makelaar:utrecht".to_string())
        );
        assert!(dispatcher.handler_for("funda:Makelaar:top10:progress").is_none());
    }
}
