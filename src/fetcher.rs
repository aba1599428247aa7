use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::{Config, MAX_RETRY_AFTER_SECS};
use crate::error::{FetchError, Result};

/// One page as delivered by the source, before extraction.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub page: u32,
    pub payload: serde_json::Value,
    /// Wall time of the successful attempt.
    pub latency: Duration,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Anything that can hand out pages by number. The HTTP fetcher is the production
/// implementation; tests use in-memory sources.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32) -> std::result::Result<RawPage, FetchError>;

    fn page_size(&self) -> u32;
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based): `base * 2^(retry-1)`, raised to a
    /// server-supplied Retry-After, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        let wait = match retry_after {
            Some(ra) => backoff.max(ra),
            None => backoff,
        };
        wait.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// HttpPageFetcher
// ---------------------------------------------------------------------------

/// Fetches `GET {base_url}?limit={page_size}&page={page}` with bounded retries.
#[derive(Clone)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    policy: RetryPolicy,
}

impl HttpPageFetcher {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.fetch_timeout)
            .user_agent(cfg.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            base_url: cfg.api_url.clone(),
            page_size: cfg.page_size,
            policy: RetryPolicy {
                max_retries: cfg.fetch_max_retries,
                base_delay: cfg.retry_base_delay,
                max_delay: cfg.retry_max_delay,
            },
        })
    }

    async fn fetch_once(&self, page: u32) -> std::result::Result<serde_json::Value, FetchError> {
        let resp = self
            .client
            .get(&self.base_url)
            .header("Accept", "application/json")
            .query(&[("limit", self.page_size), ("page", page)])
            .send()
            .await
            .map_err(|e| FetchError::Transient { page, reason: e.to_string() })?;

        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs <= MAX_RETRY_AFTER_SECS);
            return Err(FetchError::RateLimited { page, retry_after_secs });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound { page });
        }

        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(FetchError::Transient { page, reason: format!("HTTP {status}") });
        }

        if !status.is_success() {
            return Err(FetchError::Malformed { page, reason: format!("unexpected HTTP {status}") });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transient { page, reason: e.to_string() })?;

        serde_json::from_slice(&body).map_err(|e| FetchError::Malformed {
            page,
            reason: format!("body is not JSON: {e}"),
        })
    }
}

#[async_trait]
impl PageSource for HttpPageFetcher {
    async fn fetch_page(&self, page: u32) -> std::result::Result<RawPage, FetchError> {
        let mut retry = 0u32;

        loop {
            let started = Instant::now();
            match self.fetch_once(page).await {
                Ok(payload) => {
                    debug!(page, attempts = retry + 1, "page fetched");
                    return Ok(RawPage {
                        page,
                        payload,
                        latency: started.elapsed(),
                        attempts: retry + 1,
                    });
                }
                Err(e) if e.is_retryable() && retry < self.policy.max_retries => {
                    retry += 1;
                    let retry_after = match &e {
                        FetchError::RateLimited { retry_after_secs: Some(s), .. } => {
                            Some(Duration::from_secs(*s))
                        }
                        _ => None,
                    };
                    let delay = self.policy.delay_for(retry, retry_after);
                    warn!(
                        page,
                        retry,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }
}
