//! # lib_common
//!
//! Shared library behind the makelaar leaderboard services. Each folder is a
//! feature-gated module so binaries only compile what they use:
//!
//! - **`connections`**: the cache store contract plus its Redis and in-process
//!   implementations, and the Redis key-event subscription.
//! - **`retrieve`**: a JSON HTTP client with transient-retry middleware.
//! - **`feeds`**: the paginated real-estate feed client.
//! - **`core`**: rate limiter, distributed lock, aggregation job, key event
//!   dispatcher and the leaderboard reader.

#![forbid(unsafe_code)]

#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "feeds")]
pub mod feeds;
#[cfg(feature = "retrieve")]
pub mod retrieve;
