use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use lib_common::core::{LeaderboardEntry, LeaderboardReader};

/// Shared state of the read API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub reader: LeaderboardReader,
    pub top_n: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/makelaars/top10", get(top_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serves the read API on `port` until `shutdown` fires.
pub async fn run(state: ApiState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("Read API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Read API shutting down.");
        })
        .await
        .context("Read API server failed")?;
    Ok(())
}

async fn top_handler(
    State(state): State<ApiState>,
) -> Result<Json<Vec<LeaderboardEntry>>, (StatusCode, String)> {
    match state.reader.top(state.top_n).await {
        Ok(entries) => Ok(Json(entries)),
        Err(e) => {
            log::error!("Failed to read leaderboard '{}': {}", state.reader.key(), e);
            Err((StatusCode::SERVICE_UNAVAILABLE, "Leaderboard temporarily unavailable".to_string()))
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lib_common::connections::{CacheError, CacheResult, CacheStore, MemoryCache};
    use std::sync::Arc;
    use std::time::Duration;

    /// Store that fails every call, as if Redis were down.
    struct DownStore;

    fn down<T>() -> CacheResult<T> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    #[async_trait]
    impl CacheStore for DownStore {
        async fn exists(&self, _key: &str) -> CacheResult<bool> {
            down()
        }

        async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
            down()
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> CacheResult<()> {
            down()
        }

        async fn set_nx(&self, _key: &str, _value: &str, _ttl: Duration) -> CacheResult<bool> {
            down()
        }

        async fn delete(&self, _key: &str) -> CacheResult<bool> {
            down()
        }

        async fn delete_if_eq(&self, _key: &str, _expected: &str) -> CacheResult<bool> {
            down()
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> CacheResult<bool> {
            down()
        }

        async fn expire_if_eq(&self, _key: &str, _expected: &str, _ttl: Duration) -> CacheResult<bool> {
            down()
        }

        async fn ttl(&self, _key: &str) -> CacheResult<Option<Duration>> {
            down()
        }

        async fn zincr(&self, _key: &str, _member: &str, _delta: f64) -> CacheResult<f64> {
            down()
        }

        async fn zadd(&self, _key: &str, _member: &str, _score: f64) -> CacheResult<()> {
            down()
        }

        async fn zrem_range_by_score(&self, _key: &str, _min: f64, _max: f64) -> CacheResult<u64> {
            down()
        }

        async fn zcard(&self, _key: &str) -> CacheResult<u64> {
            down()
        }

        async fn ztop(&self, _key: &str, _count: usize) -> CacheResult<Vec<(String, f64)>> {
            down()
        }
    }

    #[tokio::test]
    async fn test_top_returns_ranked_entries() {
        let cache = MemoryCache::new();
        cache.zincr("lb", "Makelaar1", 2.0).await.unwrap();
        cache.zincr("lb", "Makelaar2", 5.0).await.unwrap();
        cache.zincr("lb", "Makelaar3", 1.0).await.unwrap();
        let state = ApiState {
            reader: LeaderboardReader::new(Arc::new(cache), "lb"),
            top_n: 2,
        };

        let Json(entries) = top_handler(State(state)).await.unwrap();

        let json = serde_json::to_value(&entries).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"name": "Makelaar2", "score": 5.0},
                {"name": "Makelaar1", "score": 2.0}
            ])
        );
    }

    #[tokio::test]
    async fn test_missing_board_is_an_empty_list() {
        let state = ApiState {
            reader: LeaderboardReader::new(Arc::new(MemoryCache::new()), "lb"),
            top_n: 10,
        };
        let Json(entries) = top_handler(State(state)).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_maps_to_503() {
        let state = ApiState {
            reader: LeaderboardReader::new(Arc::new(DownStore), "lb"),
            top_n: 10,
        };
        let (status, _) = top_handler(State(state)).await.unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
