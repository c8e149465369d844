use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use mkwr_core::EngineClass;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const DEFAULT_BASE_URL: &str = "https://mkwrs.com/mk8dx/display.php";

/// Fixed-delay bounded retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` attempts have failed,
/// sleeping `policy.delay` between attempts. The last error is returned.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                warn!(attempt, max_attempts, error = %err, "attempt failed; retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid base url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Anything that can produce the History page for a course/engine-class pair.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, course: &str, class: EngineClass) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(base_url: &str, config: HttpClientConfig) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            base_url,
            retry: config.retry,
        })
    }

    /// `?track=<course, spaces as +>` plus `m=200` for the high engine class.
    pub fn page_url(&self, course: &str, class: EngineClass) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("track", course);
            if class.is_high() {
                query.append_pair("m", "200");
            }
        }
        url
    }

    async fn get_once(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        Ok(FetchedPage {
            status,
            final_url,
            body,
        })
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, course: &str, class: EngineClass) -> Result<FetchedPage, FetchError> {
        let url = self.page_url(course, class);
        let span = info_span!("http_fetch", course, class = %class, url = %url);
        retry(self.retry, |_attempt| self.get_once(&url))
            .instrument(span)
            .await
    }
}
