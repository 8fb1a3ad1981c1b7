//! # Feeds Module
//!
//! The upstream real-estate feed, seen by the aggregation job only as "fetch
//! the next page given an opaque continuation token".
//!
//! - **`funda`**: the HTTP implementation of [`FeedClient`] for the Funda
//!   partner feed, built on `retrieve::ky_http`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use async_trait::async_trait;
use thiserror::Error;

use crate::retrieve::ApiClientError;

/// The Funda partner feed client.
pub mod funda;

pub use funda::{FundaClient, FundaQuery};

/// One listing as far as the leaderboard is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRecord {
    /// Stable identifier of the listing agent.
    pub agent_id: i64,
    /// Display name of the agent; blank or missing names are not counted.
    pub agent_name: Option<String>,
}

impl FeedRecord {
    /// Convenience constructor used by scripted feeds and tests.
    pub fn new(agent_id: i64, agent_name: &str) -> Self {
        Self {
            agent_id,
            agent_name: Some(agent_name.to_string()),
        }
    }
}

/// A page of records plus the token of the page after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedPage {
    /// Records in feed order.
    pub records: Vec<FeedRecord>,
    /// Opaque continuation token; `None` or empty on the last page.
    pub next_token: Option<String>,
}

/// Failures fetching a page. These are never confused with the end of the
/// feed: an exhausted feed is a successful page with no records.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Transport failure, timeout or undecodable body.
    #[error(transparent)]
    Client(#[from] ApiClientError),

    /// The upstream answered with a non-success status.
    #[error("feed returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated or empty.
        body: String,
    },

    /// The client was configured with an unusable query.
    #[error("invalid feed query: {0}")]
    InvalidQuery(String),
}

/// Fetches one page of the upstream feed.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetches the page identified by `token`, or the first page when `None`.
    async fn fetch_page(&self, token: Option<&str>) -> Result<FeedPage, FeedError>;
}
