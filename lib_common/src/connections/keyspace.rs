//! # Redis Key-Event Subscription
//!
//! Listens on `__keyevent@<db>__:expired` and `__keyevent@<db>__:del` and turns
//! every message into a [`KeyEvent`] pushed into an mpsc channel. The
//! dispatcher on the other end of that channel never sees Redis types.
//!
//! A dropped subscription is re-established after a fixed delay until the
//! shutdown token is cancelled. Notifications published while disconnected
//! are lost; the worker's startup kick and the lock-guarded idempotency check
//! cover that gap.

use std::time::Duration;

use futures_util::StreamExt;
use redis::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CacheResult, KeyEvent, KeyEventKind};

/// Subscribes to Redis key-lifecycle notifications.
pub struct KeyspaceListener {
    client: Client,
    db: i64,
    reconnect_delay: Duration,
}

impl KeyspaceListener {
    /// Creates a listener for database `db` of the server behind `client`.
    pub fn new(client: Client, db: i64) -> Self {
        Self {
            client,
            db,
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// Overrides the pause between reconnect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// The two channel names this listener subscribes to.
    pub fn channels(&self) -> [String; 2] {
        [
            format!("__keyevent@{}__:expired", self.db),
            format!("__keyevent@{}__:del", self.db),
        ]
    }

    /// Forwards notifications into `tx` until `shutdown` is cancelled or the
    /// receiver is dropped.
    pub async fn run(self, tx: mpsc::Sender<KeyEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listen(&tx) => match result {
                    Ok(true) => break,
                    Ok(false) => log::warn!("Key event subscription ended, reconnecting."),
                    Err(e) => log::error!("Key event subscription failed: {}", e),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        log::info!("Key event listener stopped.");
    }

    /// One subscription session. Returns `Ok(true)` when the receiving side is
    /// gone and listening should stop for good.
    async fn listen(&self, tx: &mpsc::Sender<KeyEvent>) -> CacheResult<bool> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in self.channels() {
            pubsub.subscribe(&channel).await?;
        }
        log::info!("Subscribed to key events: {:?}", self.channels());

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let Some(kind) = KeyEventKind::from_channel(msg.get_channel_name()) else {
                continue;
            };
            let key: String = match msg.get_payload() {
                Ok(key) => key,
                Err(e) => {
                    log::warn!("Undecodable key event payload: {}", e);
                    continue;
                }
            };
            log::debug!("Key event '{}' for '{}'", kind, key);
            if tx.send(KeyEvent::new(kind, key)).await.is_err() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
