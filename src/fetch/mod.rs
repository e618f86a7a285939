//! Fetching of rule sources.
//!
//! [`SourceFetcher`] downloads the raw bytes of one [`RuleSource`] through a
//! [`Transport`], which handles:
//! - Per-request timeout and retries with exponential backoff
//! - Permanent failures (404/410 and other client errors) without retry
//! - Gzip decompression
//! - An optional on-disk cache with TTL and ETag revalidation
//! - Cancellation between attempts and during backoff

mod cache;
mod http;

pub use cache::{CacheEntry, CacheMetadata, CacheStats, FetchCache};
pub use http::HttpTransport;

pub(crate) use cache::write_atomic;

use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::FetchError;
use crate::source::{FetchStatus, RawFetchResult, RuleSource};

/// Response of a single HTTP GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub etag: Option<String>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            etag: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            etag: None,
        }
    }
}

/// Failure below the HTTP layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Issues HTTP GET requests.
pub trait Transport: Send + Sync {
    /// GET `url`, sending `If-None-Match` when `etag` is given.
    ///
    /// Any HTTP status is a successful response; only failures to obtain a
    /// response are errors.
    fn get(
        &self,
        url: &str,
        timeout: Duration,
        etag: Option<&str>,
    ) -> Result<HttpResponse, TransportError>;
}

/// Retry count and exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any single delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// Whether a non-2xx status is worth retrying.
///
/// Client errors are permanent except 408 and 429. Everything else,
/// including an unfollowed 3xx or a 304 with nothing cached, is retried.
fn is_retryable_status(status: u16) -> bool {
    !(400..=499).contains(&status) || matches!(status, 408 | 429)
}

/// Check if data is gzip compressed.
fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Decompress gzip bodies, pass anything else through.
fn decode_body(body: Vec<u8>) -> std::io::Result<Vec<u8>> {
    if !is_gzip(&body) {
        return Ok(body);
    }
    let mut decoder = GzDecoder::new(&body[..]);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data)?;
    log::debug!(
        "decompressed gzip body: {} -> {} bytes",
        body.len(),
        data.len()
    );
    Ok(data)
}

/// Downloads rule sources.
#[derive(Clone)]
pub struct SourceFetcher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    retry: RetryPolicy,
    cache: Option<FetchCache>,
}

impl SourceFetcher {
    /// Create a fetcher with a 30s timeout, the default retry policy and no cache.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            cache: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: FetchCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn cache(&self) -> Option<&FetchCache> {
        self.cache.as_ref()
    }

    /// Fetch with the configured timeout and retry count.
    pub fn fetch(
        &self,
        source: &RuleSource,
        cancel: &CancelToken,
    ) -> Result<RawFetchResult, FetchError> {
        self.fetch_with(source, self.timeout, self.retry.max_retries, cancel)
    }

    /// Fetch one source.
    ///
    /// A fresh cache entry is returned without touching the network. A stale
    /// one is revalidated with its ETag. Retryable failures (timeouts,
    /// connection errors and any status but a permanent 4xx) are retried up
    /// to `max_retries` times.
    pub fn fetch_with(
        &self,
        source: &RuleSource,
        timeout: Duration,
        max_retries: u32,
        cancel: &CancelToken,
    ) -> Result<RawFetchResult, FetchError> {
        let url = source.url();
        let cancelled = || FetchError::Cancelled {
            url: url.to_string(),
        };
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let cached = self.cache.as_ref().and_then(|c| c.lookup(url));
        if let (Some(cache), Some(entry)) = (&self.cache, &cached) {
            if entry.meta.is_fresh(cache.ttl()) {
                log::debug!("{}: served from cache", url);
                return Ok(RawFetchResult {
                    source: source.clone(),
                    content: entry.body.clone(),
                    fetched_at: entry.meta.fetched_at.unwrap_or_else(SystemTime::now),
                    status: FetchStatus::Cached { revalidated: false },
                });
            }
        }
        let etag = cached.as_ref().and_then(|e| e.meta.etag.as_deref());

        let mut attempts = 0u32;
        let mut last_timeout = false;
        let mut last_detail = String::new();
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            attempts += 1;

            match self.transport.get(url, timeout, etag) {
                Ok(response) => match response.status {
                    200..=299 => {
                        return self.accept(source, response, attempts);
                    }
                    304 if cached.is_some() => {
                        return Ok(self.revalidated(source, cached.as_ref(), response.etag));
                    }
                    status @ (404 | 410) => {
                        return Err(FetchError::NotFound {
                            url: url.to_string(),
                            status,
                        });
                    }
                    status if is_retryable_status(status) => {
                        last_timeout = false;
                        last_detail = format!("HTTP {}", status);
                    }
                    status => {
                        return Err(FetchError::TransportFailure {
                            url: url.to_string(),
                            detail: format!("HTTP {}", status),
                        });
                    }
                },
                Err(TransportError::Timeout(detail)) => {
                    last_timeout = true;
                    last_detail = detail;
                }
                Err(TransportError::Connection(detail)) => {
                    last_timeout = false;
                    last_detail = detail;
                }
            }

            if attempts > max_retries {
                break;
            }
            let delay = self.retry.delay(attempts - 1);
            log::warn!(
                "{}: attempt {} failed ({}), retrying in {:?}",
                url,
                attempts,
                last_detail,
                delay
            );
            if !cancel.sleep(delay) {
                return Err(cancelled());
            }
        }

        if last_timeout {
            Err(FetchError::Timeout {
                url: url.to_string(),
                attempts,
            })
        } else {
            Err(FetchError::TransportFailure {
                url: url.to_string(),
                detail: format!("{} after {} attempt(s)", last_detail, attempts),
            })
        }
    }

    fn accept(
        &self,
        source: &RuleSource,
        response: HttpResponse,
        attempts: u32,
    ) -> Result<RawFetchResult, FetchError> {
        let raw_len = response.body.len();
        let content = decode_body(response.body).map_err(|e| FetchError::TransportFailure {
            url: source.url().to_string(),
            detail: format!("gzip decompression failed: {}", e),
        })?;
        log::info!(
            "fetched {} ({} bytes, {} attempt(s))",
            source.url(),
            raw_len,
            attempts
        );

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(source.url(), &content, response.etag) {
                log::warn!("{}: failed to write cache entry: {}", source.url(), e);
            }
        }

        Ok(RawFetchResult {
            source: source.clone(),
            content,
            fetched_at: SystemTime::now(),
            status: FetchStatus::Fetched {
                http_status: response.status,
                attempts,
            },
        })
    }

    fn revalidated(
        &self,
        source: &RuleSource,
        cached: Option<&CacheEntry>,
        etag: Option<String>,
    ) -> RawFetchResult {
        log::debug!("{}: not modified (304)", source.url());
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.touch(source.url(), etag) {
                log::warn!("{}: failed to refresh cache entry: {}", source.url(), e);
            }
        }
        RawFetchResult {
            source: source.clone(),
            content: cached.map(|e| e.body.clone()).unwrap_or_default(),
            fetched_at: SystemTime::now(),
            status: FetchStatus::Cached { revalidated: true },
        }
    }
}
