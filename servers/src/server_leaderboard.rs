use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use lib_common::connections::CacheHandler;
use lib_common::core::LeaderboardReader;
use servers::leaderboard_logic::{api, config, logger, signal};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_api_config();
    logger::setup_logging(&settings.log_dir, "server_leaderboard", &settings.log_level)?;

    let cache = CacheHandler::new(&settings.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))?;
    log::info!("Serving leaderboard '{}' (top {})", settings.leaderboard_key, settings.top_n);

    let state = api::ApiState {
        reader: LeaderboardReader::new(Arc::new(cache), settings.leaderboard_key.clone()),
        top_n: settings.top_n,
    };

    let shutdown = CancellationToken::new();
    let signal_handle = tokio::spawn(signal::cancel_on_signal(shutdown.clone()));

    let result = api::run(state, settings.port, shutdown.clone()).await;

    shutdown.cancel();
    let _ = signal_handle.await;

    log::info!("Shutdown complete.");
    result
}
