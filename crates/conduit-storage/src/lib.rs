//! Feed fetching and document store backends for conduit.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};

mod documents;
mod mongo;
mod postgres;

pub use documents::{
    open_document_store, DocumentStore, GuardedStore, MemoryDocumentStore, StoreCallPolicy, StoreError, StoreTarget,
};
pub use mongo::MongoDocumentStore;
pub use postgres::PgDocumentStore;

pub const CRATE_NAME: &str = "conduit-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Errors while streaming a successful response: a dropped connection or a short body
/// surfaces as a body or decode error.
pub fn classify_body_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_body() || err.is_decode() {
        RetryDisposition::Retryable
    } else {
        classify_reqwest_error(err)
    }
}

/// Bounded retry budget with linearly growing, capped spacing between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index.saturating_add(1)).unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    /// Pause after every request, successful or not.
    pub request_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
            request_delay: Duration::from_secs(1),
        }
    }
}

/// One GET against a feed endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("giving up on {url} after {attempts} attempts (last error: {last_error})")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        last_error: String,
    },
    #[error("reading payload file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that can produce the raw bytes of a feed.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, source_id: &str, request: &FetchRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    request_delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
            request_delay: config.request_delay,
        })
    }

    async fn fetch_with_retries(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let max_retries = self.retry.max_retries;
        let mut attempt = 0;

        loop {
            let mut builder = self.client.get(&request.url).query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let result = builder.send().await;

            // (hint from Retry-After, reason) when this attempt may be repeated.
            let retry: (Option<Duration>, String) = match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(bytes) => {
                                self.pause().await;
                                debug!(attempt, bytes = bytes.len(), "fetch succeeded");
                                return Ok(FetchedResponse {
                                    status: status.as_u16(),
                                    final_url,
                                    body: bytes.to_vec(),
                                });
                            }
                            Err(err) if classify_body_error(&err) == RetryDisposition::Retryable => {
                                (None, format!("reading body: {err}"))
                            }
                            Err(err) => {
                                self.pause().await;
                                return Err(FetchError::Request(err));
                            }
                        }
                    } else if classify_status(status) == RetryDisposition::Retryable {
                        (retry_after(&resp), format!("http status {}", status.as_u16()))
                    } else {
                        self.pause().await;
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) if classify_reqwest_error(&err) == RetryDisposition::Retryable => (None, err.to_string()),
                Err(err) => {
                    self.pause().await;
                    return Err(FetchError::Request(err));
                }
            };

            self.pause().await;
            let (hint, reason) = retry;
            if attempt >= max_retries {
                return Err(FetchError::RetriesExhausted {
                    url: request.url.clone(),
                    attempts: attempt + 1,
                    last_error: reason,
                });
            }

            let wait = hint
                .unwrap_or_else(|| self.retry.delay_for_attempt(attempt))
                .min(self.retry.max_delay);
            warn!(attempt, reason = %reason, wait_ms = wait.as_millis() as u64, "retrying fetch");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    async fn pause(&self) {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl PayloadFetcher for HttpFetcher {
    async fn fetch(&self, source_id: &str, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %request.url);
        self.fetch_with_retries(request).instrument(span).await
    }
}

/// Reads a previously downloaded payload from disk instead of the network.
#[derive(Debug, Clone)]
pub struct FilePayloadFetcher {
    path: PathBuf,
}

impl FilePayloadFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PayloadFetcher for FilePayloadFetcher {
    async fn fetch(&self, source_id: &str, _request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        debug!(source_id, path = %self.path.display(), "reading payload from file");
        let body = fs::read(&self.path).await.map_err(|source| FetchError::File {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(FetchedResponse {
            status: 200,
            final_url: format!("file://{}", self.path.display()),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn retry_spacing_grows_monotonically_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(250));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UPGRADE_REQUIRED), RetryDisposition::NonRetryable);
    }

    /// Serves one scripted raw response per connection (the last one repeats) and
    /// closes the socket after writing. Returns the feed url and a connection counter.
    async fn scripted_server(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let response = responses[index.min(responses.len() - 1)];
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{addr}/online-valid.csv"), connections)
    }

    fn quick_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("conduit-test".into()),
            retry: RetryPolicy {
                max_retries,
                delay: Duration::from_millis(5),
                max_delay: Duration::from_secs(2),
            },
            request_delay: Duration::ZERO,
        })
        .expect("client")
    }

    const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 13\r\nConnection: close\r\n\r\nphish_id,url\n";
    const TRUNCATED: &str =
        "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\nphish_id,url\n1,";
    const UNAVAILABLE: &str = "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const UNAUTHORIZED: &str = "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const UPGRADE: &str = "HTTP/1.1 426 Upgrade Required\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const RATE_LIMITED: &str =
        "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    #[tokio::test]
    async fn server_errors_use_the_whole_budget_then_give_up() {
        let (url, connections) = scripted_server(vec![UNAVAILABLE]).await;

        let result = quick_fetcher(2).fetch("phishtank", &FetchRequest::get(&url)).await;

        match result {
            Err(FetchError::RetriesExhausted { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(connections.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_recover_within_budget() {
        let (url, connections) = scripted_server(vec![UNAVAILABLE, OK]).await;

        let fetched = quick_fetcher(2)
            .fetch("phishtank", &FetchRequest::get(&url))
            .await
            .expect("fetch");

        assert_eq!(fetched.status, 200);
        assert_eq!(fetched.body, b"phish_id,url\n");
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        for response in [UNAUTHORIZED, UPGRADE] {
            let (url, connections) = scripted_server(vec![response]).await;

            let result = quick_fetcher(3).fetch("newsapi", &FetchRequest::get(&url)).await;

            assert!(matches!(result, Err(FetchError::HttpStatus { status: 401 | 426, .. })));
            assert_eq!(connections.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn body_cut_short_is_retried() {
        let (url, connections) = scripted_server(vec![TRUNCATED, OK]).await;

        let fetched = quick_fetcher(2)
            .fetch("phishtank", &FetchRequest::get(&url))
            .await
            .expect("fetch");

        assert_eq!(fetched.body, b"phish_id,url\n");
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn body_cut_short_every_time_exhausts_the_budget() {
        let (url, connections) = scripted_server(vec![TRUNCATED]).await;

        let result = quick_fetcher(2).fetch("phishtank", &FetchRequest::get(&url)).await;

        assert!(matches!(result, Err(FetchError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(connections.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_after_overrides_the_policy_delay() {
        let (url, connections) = scripted_server(vec![RATE_LIMITED, OK]).await;
        let started = std::time::Instant::now();

        quick_fetcher(1)
            .fetch("newsapi", &FetchRequest::get(&url))
            .await
            .expect("fetch");

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fetch_request_builder_collects_query_and_headers() {
        let request = FetchRequest::get("https://feeds.test/top")
            .with_query("country", "us")
            .with_header("X-Api-Key", "k");
        assert_eq!(request.query, vec![("country".to_string(), "us".to_string())]);
        assert_eq!(request.headers, vec![("X-Api-Key".to_string(), "k".to_string())]);
    }

    #[tokio::test]
    async fn file_fetcher_reads_payload_and_reports_missing_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("feed.json");
        std::fs::write(&path, br#"{"status":"ok","articles":[]}"#).expect("write");

        let fetched = FilePayloadFetcher::new(&path)
            .fetch("newsapi", &FetchRequest::get("unused"))
            .await
            .expect("fetch");
        assert_eq!(fetched.status, 200);
        assert!(fetched.body.starts_with(b"{\"status\""));

        let missing = FilePayloadFetcher::new(dir.path().join("absent.json"))
            .fetch("newsapi", &FetchRequest::get("unused"))
            .await;
        assert!(matches!(missing, Err(FetchError::File { .. })));
    }
}
