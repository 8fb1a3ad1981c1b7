//! # Core Engine Module
//!
//! This module forms the heart of the leaderboard services: everything with
//! real concurrency, failure-recovery and consistency concerns lives here.
//!
//! ## Core Components:
//!
//! - **`rate_limiter`**: A sliding-window admission check whose state lives in
//!   the shared cache, so every worker instance draws from the same quota.
//!
//! - **`lock`**: A token-guarded distributed lock with expiry. Acquisition
//!   never waits; a denied lock means another instance is already working.
//!
//! - **`job`**: The aggregation job. Under the lock it decides whether a run
//!   is needed, pages through the feed from the last checkpoint, adds counts
//!   to the leaderboard and finalizes or leaves the checkpoint for a retry.
//!
//! - **`dispatcher`**: Routes key-lifecycle notifications to the job whose
//!   key patterns contain the affected key.
//!
//! - **`leaderboard`**: Read-only access to the finished ranking.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Shared sliding-window rate limiter.
pub mod rate_limiter;
/// Token-guarded distributed lock with expiry.
pub mod lock;
/// The resumable leaderboard aggregation job.
pub mod job;
/// Key event routing to registered handlers.
pub mod dispatcher;
/// Read side of the leaderboard.
pub mod leaderboard;

// --- Public API Re-exports ---
pub use dispatcher::{HandlerError, KeyEventDispatcher, KeyEventHandler};
pub use job::{IncompleteReason, JobError, JobOutcome, JobSettings, LeaderboardJob, LeaderboardKeys};
pub use leaderboard::{LeaderboardEntry, LeaderboardReader};
pub use lock::{DistributedLock, LockGuard};
pub use rate_limiter::{RateLimiter, SlidingWindowRateLimiter};
