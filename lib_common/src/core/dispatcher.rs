//! # Key Event Dispatcher
//!
//! Turns key-lifecycle notifications (expired, deleted) into handler
//! invocations. Each registered [`KeyEventHandler`] declares the exact keys it
//! cares about; an event for a key no handler declares is ignored.
//!
//! ## Core Design Principles:
//!
//! 1.  **Non-blocking loop**: every matched event runs on its own task, so a
//!     long aggregation for one leaderboard never delays events for another.
//!     Two events for the same handler may run concurrently; handlers are
//!     expected to guard themselves (the aggregation job takes a lock).
//!
//! 2.  **Fault isolation**: a handler that fails or panics is logged and the
//!     loop keeps serving. Nothing a handler does can end the subscription.
//!
//! 3.  **Orderly shutdown**: on cancellation the loop stops taking events,
//!     passes the cancellation to running handlers and waits for them, so the
//!     aggregation job gets to write its checkpoint and release its lock.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::connections::{KeyEvent, KeyEventKind};

/// Error type returned by handlers; the dispatcher only logs it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Something that reacts to the expiry or deletion of specific keys.
#[async_trait]
pub trait KeyEventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// The exact keys this handler is triggered by.
    fn key_patterns(&self) -> &[String];

    /// Handles one event. `cancel` fires when the process is shutting down.
    async fn handle(&self, event: &KeyEvent, cancel: CancellationToken) -> Result<(), HandlerError>;
}

/// Routes [`KeyEvent`]s to registered handlers.
#[derive(Default)]
pub struct KeyEventDispatcher {
    handlers: Vec<Arc<dyn KeyEventHandler>>,
    startup_kick: bool,
}

impl KeyEventDispatcher {
    /// Creates a dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler. Keys already claimed by an earlier handler stay with it.
    pub fn register(&mut self, handler: Arc<dyn KeyEventHandler>) {
        for key in handler.key_patterns() {
            if let Some(owner) = self.handler_for(key) {
                log::warn!(
                    "Key '{}' of handler '{}' is already handled by '{}'",
                    key,
                    handler.name(),
                    owner.name()
                );
            }
        }
        log::info!("Handler '{}' registered for {:?}", handler.name(), handler.key_patterns());
        self.handlers.push(handler);
    }

    /// When enabled, [`run`](Self::run) invokes every handler once with a
    /// [`KeyEventKind::Startup`] event before reading notifications. This
    /// covers keys that expired while no worker was listening.
    pub fn with_startup_kick(mut self, enabled: bool) -> Self {
        self.startup_kick = enabled;
        self
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The first handler whose key set contains `key` exactly.
    pub fn handler_for(&self, key: &str) -> Option<&Arc<dyn KeyEventHandler>> {
        self.handlers
            .iter()
            .find(|h| h.key_patterns().iter().any(|p| p == key))
    }

    /// Serves `events` until `shutdown` fires or the channel closes, then
    /// waits for in-flight handlers.
    pub async fn run(self, mut events: mpsc::Receiver<KeyEvent>, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        if self.is_empty() {
            log::warn!("Dispatcher started without handlers, every key event will be ignored");
        }

        if self.startup_kick {
            for handler in &self.handlers {
                let Some(key) = handler.key_patterns().first() else {
                    continue;
                };
                let event = KeyEvent::new(KeyEventKind::Startup, key.clone());
                spawn_handler(&mut tasks, Arc::clone(handler), event, shutdown.child_token());
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Dispatcher shutting down, waiting for {} running handler(s)", tasks.len());
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    report(joined);
                }
                received = events.recv() => {
                    let Some(event) = received else {
                        log::warn!("Key event channel closed, dispatcher stopping");
                        break;
                    };
                    match self.handler_for(&event.key) {
                        Some(handler) => {
                            log::info!("Key '{}' {} -> '{}'", event.key, event.kind, handler.name());
                            spawn_handler(&mut tasks, Arc::clone(handler), event, shutdown.child_token());
                        }
                        None => log::debug!("No handler for key '{}' ({})", event.key, event.kind),
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            report(joined);
        }
        log::info!("Dispatcher stopped");
    }
}

fn spawn_handler(
    tasks: &mut JoinSet<()>,
    handler: Arc<dyn KeyEventHandler>,
    event: KeyEvent,
    cancel: CancellationToken,
) {
    tasks.spawn(async move {
        if let Err(e) = handler.handle(&event, cancel).await {
            log::error!(
                "Handler '{}' failed on '{}' ({}): {}",
                handler.name(),
                event.key,
                event.kind,
                e
            );
        }
    });
}

fn report(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            log::error!("Handler task panicked: {}", e);
        } else {
            log::warn!("Handler task aborted: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        keys: Vec<String>,
        seen: Mutex<Vec<KeyEvent>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, keys: &[&str], fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                keys: keys.iter().map(|k| k.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn seen(&self) -> Vec<KeyEvent> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl KeyEventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn key_patterns(&self) -> &[String] {
            &self.keys
        }

        async fn handle(&self, event: &KeyEvent, _cancel: CancellationToken) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(event.clone());
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_matches_exact_keys_only() {
        let board = Recorder::new("board", &["lb", "lb:rate-limit"], false);
        let mut dispatcher = KeyEventDispatcher::new();
        dispatcher.register(board.clone());
        assert!(!dispatcher.is_empty());

        let (tx, rx) = mpsc::channel(8);
        for key in ["lb", "lb:rate-limit", "lb:progress", "l"] {
            tx.send(KeyEvent::new(KeyEventKind::Expired, key)).await.unwrap();
        }
        drop(tx);
        dispatcher.run(rx, CancellationToken::new()).await;

        let keys: Vec<String> = board.seen().into_iter().map(|e| e.key).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"lb".to_string()));
        assert!(keys.contains(&"lb:rate-limit".to_string()));
    }

    #[tokio::test]
    async fn test_run_survives_failing_handler() {
        let failing = Recorder::new("failing", &["a"], true);
        let healthy = Recorder::new("healthy", &["b"], false);
        let mut dispatcher = KeyEventDispatcher::new();
        dispatcher.register(failing.clone());
        dispatcher.register(healthy.clone());

        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let loop_task = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

        tx.send(KeyEvent::new(KeyEventKind::Expired, "a")).await.unwrap();
        tx.send(KeyEvent::new(KeyEventKind::Deleted, "b")).await.unwrap();
        tx.send(KeyEvent::new(KeyEventKind::Expired, "a")).await.unwrap();
        drop(tx);

        loop_task.await.unwrap();
        assert_eq!(failing.seen().len(), 2);
        assert_eq!(healthy.seen(), vec![KeyEvent::new(KeyEventKind::Deleted, "b")]);
    }

    #[tokio::test]
    async fn test_startup_kick_invokes_each_handler_once() {
        let first = Recorder::new("first", &["x", "x:rate-limit"], false);
        let second = Recorder::new("second", &["y"], false);
        let mut dispatcher = KeyEventDispatcher::new().with_startup_kick(true);
        dispatcher.register(first.clone());
        dispatcher.register(second.clone());

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        dispatcher.run(rx, CancellationToken::new()).await;

        assert_eq!(first.seen(), vec![KeyEvent::new(KeyEventKind::Startup, "x")]);
        assert_eq!(second.seen(), vec![KeyEvent::new(KeyEventKind::Startup, "y")]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let dispatcher = KeyEventDispatcher::new();
        let (_tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let loop_task = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), loop_task)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}
