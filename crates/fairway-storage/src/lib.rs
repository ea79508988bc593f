//! HTTP fetch utilities, circuit breaker and document storage for Fairway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod breaker;
mod document;

pub use breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use document::{
    DocumentStore, JsonFileStore, MemoryDocumentStore, StoreError, StoredDocument, WriteOp,
    DEFAULT_MAX_BATCH_OPS,
};

pub const CRATE_NAME: &str = "fairway-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Full jitter: uniform in `[0, delay_for_attempt]`.
    pub fn jittered_delay<R: Rng>(&self, attempt_index: usize, rng: &mut R) -> Duration {
        let ceiling_ms = self.delay_for_attempt(attempt_index).as_millis() as u64;
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: Option<String>,
    /// Keep a cookie jar for the lifetime of the client (session-bootstrapped sources).
    pub cookie_store: bool,
    pub accept_invalid_certs: bool,
    pub pool_max_idle_per_host: usize,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(20),
            user_agent: None,
            cookie_store: false,
            accept_invalid_certs: false,
            pool_max_idle_per_host: 40,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            form: None,
        }
    }

    pub fn post_form<K, V>(url: impl Into<String>, form: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            form: Some(form.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    pub fn with_headers<'a>(
        mut self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("connection error for {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server error {status} for {url} after retries")]
    ServerError { status: u16, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_server_error(&self) -> bool {
        matches!(self, FetchError::ServerError { .. })
    }
}

/// Pooled HTTP client with bounded retries. One instance is one session (cookie jar).
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .cookie_store(config.cookie_store)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);
        self.fetch_with_retries(request).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        for attempt in 0..=self.backoff.max_retries {
            let can_retry = attempt < self.backoff.max_retries;

            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable {
                        if can_retry {
                            debug!(attempt, status = status.as_u16(), "retryable status");
                            self.pause(attempt).await;
                            continue;
                        }
                        return Err(FetchError::ServerError {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    if can_retry {
                        debug!(attempt, error = %err, "retryable request error");
                        self.pause(attempt).await;
                        continue;
                    }
                    if err.is_timeout() {
                        return Err(FetchError::Timeout {
                            url: request.url.clone(),
                        });
                    }
                    return Err(FetchError::Connection {
                        url: request.url.clone(),
                        source: err,
                    });
                }
            }
        }

        // The final iteration always returns; this only satisfies the type checker.
        Err(FetchError::Timeout {
            url: request.url.clone(),
        })
    }

    fn build(&self, request: &FetchRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }
        builder
    }

    async fn pause(&self, attempt: usize) {
        let delay = self.backoff.jittered_delay(attempt, &mut rand::thread_rng());
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_backoff_doubles_until_ten_seconds() {
        let policy = BackoffPolicy::default();
        let ceilings: Vec<u64> = (0..7)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis() as u64)
            .collect();
        assert_eq!(ceilings, vec![400, 800, 1_600, 3_200, 6_400, 10_000, 10_000]);
        assert_eq!(policy.delay_for_attempt(40), policy.max_delay);
    }

    #[test]
    fn jitter_never_exceeds_capped_delay() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..8 {
            let ceiling = policy.delay_for_attempt(attempt);
            for _ in 0..50 {
                let d = policy.jittered_delay(attempt, &mut rng);
                assert!(d <= ceiling, "attempt {attempt}: {d:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn retryable_statuses_are_429_and_5xx() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn post_form_request_carries_fields_and_headers() {
        let req = FetchRequest::post_form(
            "https://example.test/list",
            [("pageNum", "2"), ("sector", "5")],
        )
        .with_headers([("X-Requested-With", "XMLHttpRequest")]);
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.form.as_ref().map(Vec::len), Some(2));
        assert_eq!(req.headers[0].0, "X-Requested-With");
    }

    #[test]
    fn fetcher_builds_with_session_options() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            cookie_store: true,
            user_agent: Some("fairway-test".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
