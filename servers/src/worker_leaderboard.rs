use anyhow::Result;
use tokio_util::sync::CancellationToken;

use servers::leaderboard_logic::{config, logger, signal, worker};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_worker_config()?;
    logger::setup_logging(&settings.log_dir, "worker_leaderboard", &settings.log_level)?;
    log::info!(
        "Starting leaderboard worker for {} board(s), rate limit {} calls / {:?}",
        settings.boards.len(),
        settings.job.rate_limit,
        settings.job.rate_window
    );

    let shutdown = CancellationToken::new();
    let signal_handle = tokio::spawn(signal::cancel_on_signal(shutdown.clone()));

    let result = worker::run(settings, shutdown.clone()).await;

    // Stop the signal watcher too if the worker ended on its own
    shutdown.cancel();
    let _ = signal_handle.await;

    if let Err(e) = &result {
        log::error!("Worker stopped with error: {:#}", e);
    }
    log::info!("Shutdown complete.");
    result
}
