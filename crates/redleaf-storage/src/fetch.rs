use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

/// Raw source page as handed to the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    async fn read(resp: Response) -> Result<Self, FetchError> {
        let url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_default();
        let body = resp.bytes().await?;
        Ok(Self {
            url,
            content_type,
            body: body.to_vec(),
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to source failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("source answered {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are worth another try; anything else is the source's final answer.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    let transient = err.is_timeout() || err.is_connect() || err.is_request();
    if transient {
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delay for the given zero-based retry, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retrying after `err`, or `None` when the error is final.
    fn next_delay(&self, attempt_index: usize, err: &FetchError) -> Option<Duration> {
        if attempt_index >= self.max_retries {
            return None;
        }
        match err.disposition() {
            RetryDisposition::Retryable => Some(self.delay_for_attempt(attempt_index)),
            RetryDisposition::NonRetryable => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// reqwest-backed fetcher with per-request timeout and bounded retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        let builder = match config.user_agent {
            Some(agent) => builder.user_agent(agent),
            None => builder,
        };
        Ok(Self {
            client: builder.build().context("building source http client")?,
            backoff: config.backoff,
        })
    }

    async fn attempt(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        FetchedPage::read(resp).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut retry = 0;
        loop {
            let err = match self.attempt(url).await {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };
            let Some(delay) = self.backoff.next_delay(retry, &err) else {
                return Err(err);
            };
            warn!(error = %err, retry, delay_ms = delay.as_millis() as u64, "transient fetch failure");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}
