use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lib_common::connections::{CacheStore, MemoryCache};
use lib_common::core::{JobSettings, KeyEventDispatcher, KeyEventHandler};
use project_tests::{Harness, ScriptedFeed, page};

/// Runs the dispatcher over the in-process cache's key events, with the
/// cache's reaper standing in for Redis' active expiry.
struct Pipeline {
    shutdown: CancellationToken,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl Pipeline {
    fn start(h: &Harness) -> Self {
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        h.cache.spawn_event_forwarder(tx, shutdown.clone());
        h.cache.spawn_reaper(Duration::from_millis(100), shutdown.clone());

        let mut dispatcher = KeyEventDispatcher::new().with_startup_kick(true);
        dispatcher.register(Arc::clone(&h.job) as Arc<dyn KeyEventHandler>);
        let dispatcher = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

        Self { shutdown, dispatcher }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.dispatcher.await.unwrap();
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_board_expiry_triggers_recomputation() {
    let feed = ScriptedFeed::new().on(None, page(&[(123, "Makelaar1")], None));
    let settings = JobSettings {
        leaderboard_ttl: Duration::from_secs(1),
        ..Default::default()
    };
    let h = Harness::new(feed, settings);
    let pipeline = Pipeline::start(&h);

    // Startup kick computes the board once, its expiry computes it again
    let hr = &h;
    wait_until(move || async move { hr.feed.calls().len() >= 2 }).await;
    pipeline.stop().await;

    assert!(h.feed.calls().iter().all(|t| t.is_none()));
    assert!(!h.cache.exists(&h.keys.lock).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_window_expiry_resumes_from_checkpoint() {
    let feed = ScriptedFeed::new()
        .on(None, page(&[(123, "Makelaar1")], Some("p2")))
        .on(Some("p2"), page(&[(456, "Makelaar2")], None));
    let settings = JobSettings {
        rate_limit: 1,
        rate_window: Duration::from_secs(1),
        ..Default::default()
    };
    let h = Harness::new(feed, settings);
    let pipeline = Pipeline::start(&h);

    let hr = &h;
    wait_until(move || async move { hr.score("Makelaar2").await.is_some() && hr.checkpoint().await.is_none() })
        .await;
    pipeline.stop().await;

    assert_eq!(h.feed.calls(), vec![None, Some("p2".to_string())]);
    assert_eq!(h.score("Makelaar1").await, Some(1.0));
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
    assert!(h.cache.ttl(&h.keys.leaderboard).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_slow_failure_past_the_window_is_retried() {
    // The failing fetch outlasts the default 60 s window, so the window's
    // expiry arrives while the lock is still held
    let feed = ScriptedFeed::new()
        .on(None, page(&[(123, "Makelaar1")], Some("p2")))
        .on(Some("p2"), page(&[(456, "Makelaar2")], None))
        .stall_once(Some("p2"), Duration::from_secs(61), 504);
    let h = Harness::new(feed, JobSettings::default());
    let pipeline = Pipeline::start(&h);

    let hr = &h;
    wait_until(move || async move { hr.score("Makelaar2").await.is_some() && hr.checkpoint().await.is_none() })
        .await;
    pipeline.stop().await;

    assert_eq!(
        h.feed.calls(),
        vec![None, Some("p2".to_string()), Some("p2".to_string())]
    );
    assert_eq!(h.score("Makelaar1").await, Some(1.0));
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
    assert!(h.cache.ttl(&h.keys.leaderboard).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_expiry_is_ignored() {
    let feed = ScriptedFeed::new().on(None, page(&[(1, "Makelaar1")], None));
    let h = Harness::on_cache(MemoryCache::new(), feed, JobSettings::default());
    h.cache.set("some:other:key", "x", Some(Duration::from_millis(200))).await.unwrap();
    let pipeline = Pipeline::start(&h);

    let hr = &h;
    wait_until(move || async move { hr.feed.calls().len() == 1 && hr.checkpoint().await.is_none() }).await;
    // Let the unrelated key expire and be reaped
    tokio::time::sleep(Duration::from_secs(2)).await;
    pipeline.stop().await;

    assert!(!h.cache.exists("some:other:key").await.unwrap());
    assert_eq!(h.feed.calls().len(), 1);
}
