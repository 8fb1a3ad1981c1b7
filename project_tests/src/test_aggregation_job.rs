use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use lib_common::connections::{CacheStore, KeyEventKind};
use lib_common::core::{IncompleteReason, JobError, JobOutcome, JobSettings};
use lib_common::feeds::FeedError;
use project_tests::{Harness, ScriptedFeed, Step, page};

fn settings(rate_limit: u64) -> JobSettings {
    JobSettings {
        rate_limit,
        ..Default::default()
    }
}

async fn run(h: &Harness) -> Result<JobOutcome, JobError> {
    h.job.run(KeyEventKind::Expired, &CancellationToken::new()).await
}

#[tokio::test]
async fn test_single_page_is_aggregated_and_finalized() {
    let feed = ScriptedFeed::new().on(
        None,
        page(&[(123, "Makelaar1"), (456, "Makelaar2"), (123, "Makelaar1")], None),
    );
    let h = Harness::new(feed, settings(100));

    let outcome = run(&h).await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed { pages: 1 });
    assert_eq!(h.score("Makelaar1").await, Some(2.0));
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
    assert_eq!(h.feed.calls(), vec![None]);
    assert_eq!(h.checkpoint().await, None);

    let ttl = h.cache.ttl(&h.keys.leaderboard).await.unwrap().expect("leaderboard should expire");
    assert!(ttl > Duration::from_secs(719 * 60));
    assert!(!h.cache.exists(&h.keys.lock).await.unwrap());
    assert!(!h.cache.exists(&h.keys.retry).await.unwrap());
}

#[tokio::test]
async fn test_pages_are_followed_in_order() {
    let feed = ScriptedFeed::new()
        .on(None, page(&[(123, "Makelaar1")], Some("page2")))
        .on(Some("page2"), page(&[(456, "Makelaar2")], None));
    let h = Harness::new(feed, settings(100));

    let outcome = run(&h).await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed { pages: 2 });
    assert_eq!(h.feed.calls(), vec![None, Some("page2".to_string())]);
    assert_eq!(h.score("Makelaar1").await, Some(1.0));
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
}

#[tokio::test]
async fn test_counts_accumulate_across_pages() {
    let feed = ScriptedFeed::new()
        .on(None, page(&[(1, "Makelaar1"), (1, "Makelaar1")], Some("p2")))
        .on(Some("p2"), page(&[(1, "Makelaar1"), (2, "Makelaar2")], None));
    let h = Harness::new(feed, settings(100));

    run(&h).await.unwrap();

    assert_eq!(h.score("Makelaar1").await, Some(3.0));
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
}

#[tokio::test]
async fn test_blank_names_are_not_counted() {
    let feed = ScriptedFeed::new().on(
        None,
        page(&[(1, ""), (2, "Makelaar2"), (3, "   ")], None),
    );
    let h = Harness::new(feed, settings(100));

    run(&h).await.unwrap();

    assert_eq!(h.cache.zcard(&h.keys.leaderboard).await.unwrap(), 1);
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
}

#[tokio::test]
async fn test_completed_board_is_not_recomputed() {
    let feed = ScriptedFeed::new().on(None, page(&[(1, "Makelaar1")], None));
    let h = Harness::new(feed, settings(100));
    h.cache.zincr(&h.keys.leaderboard, "Makelaar9", 4.0).await.unwrap();

    let outcome = run(&h).await.unwrap();

    assert_eq!(outcome, JobOutcome::AlreadyComplete);
    assert!(h.feed.calls().is_empty());
    assert_eq!(h.score("Makelaar1").await, None);
}

#[tokio::test]
async fn test_checkpoint_overrides_existing_board() {
    let feed = ScriptedFeed::new()
        .on(None, page(&[(1, "Makelaar1")], Some("p2")))
        .on(Some("p2"), page(&[(2, "Makelaar2")], None));
    let h = Harness::new(feed, settings(100));
    h.cache.zincr(&h.keys.leaderboard, "Makelaar1", 1.0).await.unwrap();
    h.cache.set(&h.keys.checkpoint, "p2", None).await.unwrap();

    let outcome = run(&h).await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed { pages: 1 });
    assert_eq!(h.feed.calls(), vec![Some("p2".to_string())]);
    assert_eq!(h.score("Makelaar1").await, Some(1.0));
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
}

#[tokio::test]
async fn test_empty_checkpoint_restarts_from_first_page() {
    let feed = ScriptedFeed::new().on(None, page(&[(1, "Makelaar1")], None));
    let h = Harness::new(feed, settings(100));
    h.cache.zincr(&h.keys.leaderboard, "Makelaar1", 0.0).await.unwrap();
    h.cache.set(&h.keys.checkpoint, "", None).await.unwrap();

    run(&h).await.unwrap();

    assert_eq!(h.feed.calls(), vec![None]);
    assert_eq!(h.checkpoint().await, None);
}

#[tokio::test]
async fn test_rate_limit_keeps_position_and_resume_does_not_recount() {
    let feed = ScriptedFeed::new()
        .on(None, page(&[(1, "Makelaar1"), (1, "Makelaar1")], Some("p2")))
        .on(Some("p2"), page(&[(2, "Makelaar2")], Some("p3")))
        .on(Some("p3"), page(&[(1, "Makelaar1")], None));
    let h = Harness::new(feed, settings(2));

    let first = run(&h).await.unwrap();

    assert_eq!(first, JobOutcome::Incomplete { reason: IncompleteReason::RateLimited, pages: 2 });
    assert_eq!(h.checkpoint().await.as_deref(), Some("p3"));
    assert_eq!(h.score("Makelaar1").await, Some(2.0));
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
    assert_eq!(h.cache.ttl(&h.keys.leaderboard).await.unwrap(), None);
    assert!(!h.cache.exists(&h.keys.lock).await.unwrap());

    // Still inside the window: nothing is fetched, position unchanged
    let denied = run(&h).await.unwrap();
    assert_eq!(denied, JobOutcome::Incomplete { reason: IncompleteReason::RateLimited, pages: 0 });
    assert_eq!(h.checkpoint().await.as_deref(), Some("p3"));

    h.clock.advance_ms(61_000);
    let resumed = run(&h).await.unwrap();

    assert_eq!(resumed, JobOutcome::Completed { pages: 1 });
    assert_eq!(
        h.feed.calls(),
        vec![None, Some("p2".to_string()), Some("p3".to_string())]
    );
    assert_eq!(h.score("Makelaar1").await, Some(3.0));
    assert_eq!(h.score("Makelaar2").await, Some(1.0));
    assert_eq!(h.checkpoint().await, None);
    assert!(h.cache.ttl(&h.keys.leaderboard).await.unwrap().is_some());
}

#[tokio::test]
async fn test_feed_failure_keeps_checkpoint_and_releases_lock() {
    let feed = ScriptedFeed::new()
        .on(None, page(&[(1, "Makelaar1")], Some("p2")))
        .on(Some("p2"), Step::Fail(503));
    let h = Harness::new(feed, settings(100));

    let err = run(&h).await.unwrap_err();

    assert!(matches!(err, JobError::Feed(FeedError::Status { status: 503, .. })));
    assert_eq!(h.checkpoint().await.as_deref(), Some("p2"));
    assert_eq!(h.score("Makelaar1").await, Some(1.0));
    assert_eq!(h.cache.ttl(&h.keys.leaderboard).await.unwrap(), None);
    assert!(!h.cache.exists(&h.keys.lock).await.unwrap());

    // A retry trigger outlives the run, one window long
    let retry = h.cache.ttl(&h.keys.retry).await.unwrap().expect("retry should be scheduled");
    assert!(retry <= Duration::from_secs(60));
}

#[tokio::test]
async fn test_failure_on_first_page_is_not_exhaustion() {
    let feed = ScriptedFeed::new().on(None, Step::Fail(500));
    let h = Harness::new(feed, settings(100));

    assert!(run(&h).await.is_err());
    assert!(!h.cache.exists(&h.keys.leaderboard).await.unwrap());

    // Nothing was checkpointed, so the next trigger starts over rather than
    // treating the board as complete
    assert_eq!(h.checkpoint().await, None);
}

#[tokio::test]
async fn test_cancelled_run_is_incomplete() {
    let feed = ScriptedFeed::new().on(None, page(&[(1, "Makelaar1")], None));
    let h = Harness::new(feed, settings(100));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h.job.run(KeyEventKind::Expired, &cancel).await.unwrap();

    assert_eq!(outcome, JobOutcome::Incomplete { reason: IncompleteReason::Cancelled, pages: 0 });
    assert!(h.feed.calls().is_empty());
    assert_eq!(h.checkpoint().await.as_deref(), Some(""));
    assert!(!h.cache.exists(&h.keys.lock).await.unwrap());

    let outcome = run(&h).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed { pages: 1 });
}

#[tokio::test]
async fn test_cancellation_between_pages_keeps_position() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let feed = ScriptedFeed::new()
        .on(None, page(&[(1, "Makelaar1")], Some("p2")))
        .on(Some("p2"), page(&[(2, "Makelaar2")], None))
        .gated(entered.clone(), release.clone());
    let h = Harness::new(feed, settings(100));
    let cancel = CancellationToken::new();

    let job = Arc::clone(&h.job);
    let token = cancel.clone();
    let running = tokio::spawn(async move { job.run(KeyEventKind::Expired, &token).await });

    // Cancel while the first page is in flight; it still completes
    entered.notified().await;
    cancel.cancel();
    release.notify_one();

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, JobOutcome::Incomplete { reason: IncompleteReason::Cancelled, pages: 1 });
    assert_eq!(h.checkpoint().await.as_deref(), Some("p2"));
    assert_eq!(h.score("Makelaar1").await, Some(1.0));
    assert_eq!(h.score("Makelaar2").await, None);
}

#[tokio::test]
async fn test_concurrent_runs_are_exclusive() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let feed = ScriptedFeed::new()
        .on(None, page(&[(1, "Makelaar1")], None))
        .gated(entered.clone(), release.clone());
    let h = Harness::new(feed, settings(100));

    let job = Arc::clone(&h.job);
    let first = tokio::spawn(async move { job.run(KeyEventKind::Expired, &CancellationToken::new()).await });
    entered.notified().await;

    let second = run(&h).await.unwrap();
    assert_eq!(second, JobOutcome::Contended);
    assert_eq!(h.feed.calls().len(), 1);
    assert!(!h.cache.exists(&h.keys.retry).await.unwrap());

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), JobOutcome::Completed { pages: 1 });
    assert_eq!(h.score("Makelaar1").await, Some(1.0));
}

#[tokio::test]
async fn test_empty_feed_completes_without_a_board() {
    let h = Harness::new(ScriptedFeed::new(), settings(100));

    let outcome = run(&h).await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed { pages: 0 });
    assert_eq!(h.checkpoint().await, None);
    assert!(!h.cache.exists(&h.keys.leaderboard).await.unwrap());
}
