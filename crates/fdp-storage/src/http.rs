//! HTTP access for remote sources: bounded global and per-source
//! concurrency, retried through [`RetryPolicy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{CONTENT_LENGTH, ETAG, LAST_MODIFIED, RETRY_AFTER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info_span, Instrument};

use crate::retry::{Classify, RetryDisposition, RetryPolicy};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Header-level description of a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

impl RemoteMetadata {
    /// Stable hash of size + modification time (+ etag when present).
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}|{}|{}",
                self.content_length.map(|n| n.to_string()).unwrap_or_default(),
                self.last_modified.as_deref().unwrap_or_default(),
                self.etag.as_deref().unwrap_or_default()
            )
            .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("rate limited by {url}")]
    RateLimited { url: String, retry_after: Option<Duration> },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http fetcher is shut down")]
    Closed,
}

impl FetchError {
    /// Maps a non-success response; 429 carries its `Retry-After` seconds.
    fn from_response(resp: &reqwest::Response) -> Self {
        let url = resp.url().to_string();
        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return FetchError::RateLimited { url, retry_after };
        }
        FetchError::HttpStatus {
            status: resp.status().as_u16(),
            url,
        }
    }
}

impl Classify for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) if err.is_timeout() || err.is_connect() => RetryDisposition::Retryable,
            FetchError::RateLimited { .. } => RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } if *status >= 500 => RetryDisposition::Retryable,
            FetchError::Request(_) | FetchError::HttpStatus { .. } | FetchError::Closed => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn permits(&self, source_key: &str) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = {
            let mut map = self.per_source.lock().await;
            map.entry(source_key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
                .clone()
        };
        let source = per_source.acquire_owned().await.map_err(|_| FetchError::Closed)?;
        Ok((global, source))
    }

    /// HEAD request; a 404 means the resource is not published yet and maps
    /// to `Ok(None)`.
    pub async fn head(&self, source_key: &str, url: &str) -> Result<Option<RemoteMetadata>, FetchError> {
        let _permits = self.permits(source_key).await?;
        let client = &self.client;
        self.retry
            .run(move |_attempt| async move {
                let resp = client.head(url).send().await?;
                let status = resp.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    return Err(FetchError::from_response(&resp));
                }
                let headers = resp.headers();
                let header = |name: reqwest::header::HeaderName| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                Ok(Some(RemoteMetadata {
                    content_length: header(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
                    last_modified: header(LAST_MODIFIED),
                    etag: header(ETAG),
                }))
            })
            .instrument(info_span!("http_head", source_key, url))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16) -> FetchError {
        FetchError::HttpStatus {
            status,
            url: "https://disclosures.example/2024FD.zip".into(),
        }
    }

    #[test]
    fn server_errors_and_rate_limits_are_retried() {
        assert_eq!(status_error(503).disposition(), RetryDisposition::Retryable);
        assert_eq!(status_error(403).disposition(), RetryDisposition::NonRetryable);
        assert_eq!(FetchError::Closed.disposition(), RetryDisposition::NonRetryable);
        let limited = FetchError::RateLimited {
            url: "https://disclosures.example/2024FD.zip".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(limited.disposition(), RetryDisposition::Retryable);
        assert!(limited.to_string().starts_with("rate limited"));
    }

    #[test]
    fn fingerprint_tracks_size_and_mtime() {
        let a = RemoteMetadata {
            content_length: Some(1024),
            last_modified: Some("Tue, 01 Oct 2024 10:00:00 GMT".into()),
            etag: None,
        };
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.content_length = Some(2048);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
