//! # Funda Partner Feed Client
//!
//! Pages through the Funda search feed. The first request carries the full
//! search (`type`, `zo`, `page`, `pagesize`); every following request is built
//! from the `VolgendeUrl` link of the previous page, which is the continuation
//! token handed to the aggregation job.
//!
//! ```text
//! {base}{key}/?type=koop&zo=/amsterdam/tuin/&page=1&pagesize=100
//! VolgendeUrl "/~/koop/amsterdam/tuin/p2/"  ->  {base}{key}/?type=koop&zo=/amsterdam/tuin/p2
//! ```

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::{FeedClient, FeedError, FeedPage, FeedRecord};
use crate::retrieve::ApiClient;

/// Search and transport settings for [`FundaClient`].
#[derive(Debug, Clone)]
pub struct FundaQuery {
    /// Feed root, ending in a slash (e.g. `http://partnerapi.funda.nl/feeds/Aanbod.svc/json/`).
    pub base_url: String,
    /// Partner API key, inserted as a path segment after the base URL.
    pub api_key: String,
    /// Listing type (`koop` or `huur`).
    pub search_type: String,
    /// Search path (`zo`), e.g. `/amsterdam/tuin/`.
    pub area: String,
    /// Records per page on the first request.
    pub page_size: u32,
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
    /// Retries of transient HTTP failures.
    pub max_retries: u32,
}

impl Default for FundaQuery {
    fn default() -> Self {
        Self {
            base_url: "http://partnerapi.funda.nl/feeds/Aanbod.svc/json/".to_string(),
            api_key: String::new(),
            search_type: "koop".to_string(),
            area: "/amsterdam/tuin/".to_string(),
            page_size: 100,
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FundaResponse {
    #[serde(rename = "Objects", alias = "objects", default)]
    objects: Vec<FundaObject>,
    #[serde(rename = "Paging", alias = "paging", default)]
    paging: Option<FundaPaging>,
}

#[derive(Debug, Deserialize)]
struct FundaObject {
    #[serde(rename = "MakelaarId", alias = "makelaarId")]
    makelaar_id: i64,
    #[serde(rename = "MakelaarNaam", alias = "makelaarNaam", default)]
    makelaar_naam: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FundaPaging {
    #[serde(rename = "VolgendeUrl", alias = "volgendeUrl", default)]
    volgende_url: Option<String>,
}

impl From<FundaResponse> for FeedPage {
    fn from(response: FundaResponse) -> Self {
        FeedPage {
            records: response
                .objects
                .into_iter()
                .map(|o| FeedRecord {
                    agent_id: o.makelaar_id,
                    agent_name: o.makelaar_naam,
                })
                .collect(),
            next_token: response
                .paging
                .and_then(|p| p.volgende_url)
                .filter(|url| !url.trim().is_empty()),
        }
    }
}

/// HTTP [`FeedClient`] for the Funda partner feed.
pub struct FundaClient {
    client: ApiClient,
    query: FundaQuery,
    next_link: Regex,
}

impl FundaClient {
    /// Builds a client for `query`.
    pub fn new(query: FundaQuery) -> Result<Self, FeedError> {
        if query.api_key.trim().is_empty() {
            return Err(FeedError::InvalidQuery("api key is empty".to_string()));
        }
        let root = format!("{}{}/", with_trailing_slash(&query.base_url), query.api_key);
        let client = ApiClient::new(&root, query.timeout, query.max_retries)?;
        let next_link = Regex::new(&format!(
            r"^/~/{}(?P<zo>/.+?)/?$",
            regex::escape(&query.search_type)
        ))
        .map_err(|e| FeedError::InvalidQuery(e.to_string()))?;

        Ok(Self {
            client,
            query,
            next_link,
        })
    }

    /// The relative request (query string only) for the page behind `token`.
    pub fn request_path(&self, token: Option<&str>) -> String {
        match token.filter(|t| !t.trim().is_empty()) {
            None => format!(
                "?type={}&zo={}&page=1&pagesize={}",
                self.query.search_type, self.query.area, self.query.page_size
            ),
            Some(link) => format!("?type={}&zo={}", self.query.search_type, self.search_path(link)),
        }
    }

    /// Reduces a `VolgendeUrl` link to its search path. Links that do not
    /// look like `/~/<type>/...` fall back to the configured area.
    fn search_path<'a>(&'a self, link: &'a str) -> &'a str {
        match self.next_link.captures(link).and_then(|c| c.name("zo")) {
            Some(zo) => zo.as_str(),
            None => {
                log::warn!("Unrecognised next page link '{}', using configured area", link);
                self.query.area.trim_end_matches('/')
            }
        }
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

#[async_trait]
impl FeedClient for FundaClient {
    async fn fetch_page(&self, token: Option<&str>) -> Result<FeedPage, FeedError> {
        let path = self.request_path(token);
        log::debug!("Fetching feed page {}", path);

        let response = self.client.get_json::<FundaResponse>(&path).await?;
        match response.data {
            Some(body) if response.success => Ok(body.into()),
            _ => Err(FeedError::Status {
                status: response.status,
                body: response.error_body.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Serves one canned HTTP response on a random local port and reports the
    /// request line it received.
    fn serve_once(status: &str, body: &str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let _ = tx.send(request.lines().next().unwrap_or_default().to_string());
                stream.write_all(response.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });

        (format!("http://127.0.0.1:{}/feeds/json", port), rx)
    }

    fn query(base_url: String) -> FundaQuery {
        FundaQuery {
            base_url,
            api_key: "KEY".to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_request_path_for_first_and_next_pages() {
        let client = FundaClient::new(query("http://localhost/json/".to_string())).unwrap();
        assert_eq!(
            client.request_path(None),
            "?type=koop&zo=/amsterdam/tuin/&page=1&pagesize=100"
        );
        assert_eq!(
            client.request_path(Some("/~/koop/amsterdam/tuin/p2/")),
            "?type=koop&zo=/amsterdam/tuin/p2"
        );
        assert_eq!(
            client.request_path(Some("/something/else")),
            "?type=koop&zo=/amsterdam/tuin"
        );
    }

    #[test]
    fn test_new_requires_api_key() {
        let mut q = query("http://localhost/json/".to_string());
        q.api_key = " ".to_string();
        assert!(matches!(FundaClient::new(q), Err(FeedError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_fetch_page_decodes_records_and_next_link() {
        let body = r#"{
            "Objects": [
                {"MakelaarId": 123, "MakelaarNaam": "Makelaar1"},
                {"MakelaarId": 456, "MakelaarNaam": ""}
            ],
            "Paging": {"VolgendeUrl": "/~/koop/amsterdam/tuin/p2/"}
        }"#;
        let (base, requests) = serve_once("200 OK", body);
        let client = FundaClient::new(query(base)).unwrap();

        let page = client.fetch_page(None).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0], FeedRecord::new(123, "Makelaar1"));
        assert_eq!(page.next_token.as_deref(), Some("/~/koop/amsterdam/tuin/p2/"));

        let request_line = requests.recv().unwrap();
        assert!(request_line.starts_with("GET /feeds/json/KEY/?type=koop&zo=/amsterdam/tuin/&page=1"));
    }

    #[tokio::test]
    async fn test_fetch_page_without_paging_has_no_token() {
        let (base, _requests) = serve_once("200 OK", r#"{"Objects": []}"#);
        let client = FundaClient::new(query(base)).unwrap();

        let page = client.fetch_page(Some("/~/koop/amsterdam/tuin/p9/")).await.unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.next_token, None);
    }

    #[tokio::test]
    async fn test_fetch_page_surfaces_http_errors() {
        let (base, _requests) = serve_once("401 Unauthorized", r#"{"message":"bad key"}"#);
        let client = FundaClient::new(query(base)).unwrap();

        let err = client.fetch_page(None).await.unwrap_err();
        assert!(matches!(err, FeedError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_fetch_page_surfaces_decode_errors() {
        let (base, _requests) = serve_once("200 OK", "not json");
        let client = FundaClient::new(query(base)).unwrap();

        let err = client.fetch_page(None).await.unwrap_err();
        assert!(matches!(err, FeedError::Client(_)));
    }
}
