//! Media download: one streamed attempt per call, retried by [`RetryPolicy`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;

use crate::error::{PipelineError, PipelineResult};

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_DOWNLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// A single download attempt. Any error counts as a failed attempt.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> PipelineResult<Downloaded>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `fetcher` under `policy`. Returns `None` once every attempt failed.
pub async fn download_with_retry(
    fetcher: &dyn MediaFetcher,
    url: &str,
    policy: &RetryPolicy,
) -> Option<Downloaded> {
    for attempt in 1..=policy.max_attempts {
        metrics::counter!("media_downloads_total").increment(1);
        match fetcher.fetch(url).await {
            Ok(d) => {
                tracing::debug!(target: "media", url, attempt, bytes = d.bytes.len(), "downloaded");
                return Some(d);
            }
            Err(e) => {
                tracing::warn!(target: "media", url, attempt, error = %e, "download attempt failed");
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }
    }
    metrics::counter!("media_download_failures_total").increment(1);
    None
}

/// HTTP fetcher with a per-attempt timeout, a content-type check and a hard
/// size ceiling enforced while streaming.
#[derive(Clone)]
pub struct HttpMediaFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl HttpMediaFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DOWNLOAD_TIMEOUT,
            max_bytes: MAX_DOWNLOAD_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    async fn fetch_inner(&self, url: &str) -> PipelineResult<Downloaded> {
        let mut req = self
            .client
            .get(url)
            .header(header::USER_AGENT, "Mozilla/5.0 (compatible; news-relay/0.1)")
            .header(header::ACCEPT, "image/webp,image/apng,image/*,*/*;q=0.8");
        if let Ok(u) = url::Url::parse(url) {
            req = req.header(header::REFERER, u.origin().ascii_serialization());
        }
        let mut rsp = req.send().await?;

        if !rsp.status().is_success() {
            return Err(PipelineError::Network(format!("HTTP {}", rsp.status())));
        }
        let content_type = rsp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(PipelineError::MediaProcessing(format!(
                "not an image: {content_type:?}"
            )));
        }
        if rsp.content_length().is_some_and(|n| n as usize > self.max_bytes) {
            return Err(PipelineError::MediaProcessing("declared size over limit".into()));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = rsp.chunk().await? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(PipelineError::MediaProcessing(format!(
                    "body exceeds {} bytes",
                    self.max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        if bytes.is_empty() {
            return Err(PipelineError::MediaProcessing("empty body".into()));
        }
        Ok(Downloaded {
            bytes,
            content_type,
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> PipelineResult<Downloaded> {
        match tokio::time::timeout(self.timeout, self.fetch_inner(url)).await {
            Ok(r) => r,
            Err(_) => Err(PipelineError::Network(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
