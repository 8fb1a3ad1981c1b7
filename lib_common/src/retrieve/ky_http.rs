//! # HTTP Retrieval Utilities
//!
//! This module provides a robust, asynchronous API client wrapper around `reqwest`.
//! It includes middleware support for exponential backoff retries and standardized
//! JSON response handling.

use std::time::Duration;

use reqwest::{header::HeaderMap, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Failures raised by [`ApiClient`].
#[derive(Debug, Error)]
pub enum ApiClientError {
    /// The base URL or a joined path is not a valid absolute URL.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The underlying HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),

    /// The request failed after all retries (connect, timeout, middleware).
    #[error("request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),

    /// A 2xx response body did not deserialize into the expected type.
    #[error("failed to decode response body: {0}")]
    Decode(#[source] reqwest::Error),
}

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs and automatic
/// retries of transient failures.
#[derive(Clone)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient` instance with a retry policy.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL for the API (e.g., "https://api.example.com/v1/").
    /// * `timeout` - Per-attempt request timeout.
    /// * `max_retries` - Retries of transient failures, with exponential backoff.
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> Result<Self, ApiClientError> {
        // Parse the base URL to ensure it is valid and absolute
        let url = Url::parse(base_url)?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("makelaar-leaderboard/1.0")
            .build()
            .map_err(ApiClientError::Build)?;

        // Construct the client with the retry middleware
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
        })
    }

    /// Resolves `path` against the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url, ApiClientError> {
        Ok(self.base_url.join(path)?)
    }

    /// Performs an HTTP request and decodes a JSON body on success.
    ///
    /// Non-2xx statuses are not errors at this level: the body is captured as
    /// text in `error_body` so the caller decides what a failure means.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The relative path (and query) to join to the base URL.
    /// * `headers` - Optional additional headers for this specific request.
    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> Result<ApiResponse<T>, ApiClientError>
    where
        T: DeserializeOwned,
    {
        // 1. Construct the full absolute URL
        let full_url = self.url_for(path)?;
        let mut req = self.inner.request(method, full_url);

        // 2. Add Custom Headers if provided
        if let Some(h) = headers {
            req = req.headers(h);
        }

        // 3. Execute the request and capture response metadata
        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        // 4. Handle the result based on success status
        if status.is_success() {
            let data = response.json::<T>().await.map_err(ApiClientError::Decode)?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            // Capture the error body as a string for debugging
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Shorthand for a `GET` without extra headers.
    pub async fn get_json<T>(&self, path: &str) -> Result<ApiResponse<T>, ApiClientError>
    where
        T: DeserializeOwned,
    {
        self.request(Method::GET, path, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_relative_base_url() {
        let result = ApiClient::new("not-a-url", Duration::from_secs(1), 0);
        assert!(matches!(result, Err(ApiClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_url_for_keeps_base_path_for_query_only_paths() {
        let client = ApiClient::new("http://feeds.example.com/json/KEY/", Duration::from_secs(1), 0).unwrap();
        let url = client.url_for("?type=koop&zo=/amsterdam/").unwrap();
        assert_eq!(url.path(), "/json/KEY/");
        assert_eq!(url.query(), Some("type=koop&zo=/amsterdam/"));
    }
}
