//! Fetching the raw bytes of an artifact.
//!
//! The loader only needs "the bytes behind a URL", which is what the [`Fetcher`] trait models.
//! The [`DownloadService`] is the default fetcher. It dispatches by URL scheme to the HTTP or the
//! filesystem fetcher, retries transient failures and enforces an overall timeout.

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;

use crate::caching::{CacheEntry, CacheError};
use crate::config::Config;
use crate::utils::http::{DownloadTimeouts, create_client};

mod filesystem;
mod http;

pub use self::filesystem::FilesystemFetcher;
pub use self::http::HttpFetcher;

pub(crate) const USER_AGENT: &str = concat!("lazyload/", env!("CARGO_PKG_VERSION"));

/// Fetches the bytes of an artifact.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheEntry<Bytes>>;
}

/// The default [`Fetcher`], supporting `http`, `https` and `file` URLs.
#[derive(Debug)]
pub struct DownloadService {
    timeouts: DownloadTimeouts,
    attempts: usize,
    http: HttpFetcher,
    fs: FilesystemFetcher,
}

impl DownloadService {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts)?;

        Ok(Self {
            timeouts,
            attempts: config.download_attempts.max(1),
            http: HttpFetcher::new(client),
            fs: FilesystemFetcher::new(),
        })
    }

    async fn dispatch(&self, url: &Url) -> CacheEntry<Bytes> {
        match url.scheme() {
            "http" | "https" => self.http.fetch_url(url).await,
            "file" => self.fs.fetch_url(url).await,
            scheme => Err(CacheError::DownloadError(format!(
                "unsupported URL scheme `{scheme}`"
            ))),
        }
    }

    /// Fetches `url`, retrying transient failures.
    pub async fn download(&self, url: &str) -> CacheEntry<Bytes> {
        let parsed = Url::parse(url).map_err(|e| CacheError::DownloadError(e.to_string()))?;

        let start = Instant::now();
        let timeout = self.timeouts.max_download;
        let job = retry(self.attempts, || self.dispatch(&parsed));
        let result = match tokio::time::timeout(timeout, job).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.metrics_tag(),
        };
        metric!(timer("loader.fetch") = start.elapsed(), "status" => status);

        match &result {
            Ok(bytes) => {
                tracing::debug!(url, bytes = bytes.len(), "Artifact fetched successfully");
            }
            Err(e) => {
                metric!(counter("loader.fetch.failure") += 1, "status" => status);
                tracing::debug!(
                    url,
                    error = e as &dyn std::error::Error,
                    "Artifact fetching failed"
                );
            }
        }

        result
    }
}

impl Fetcher for DownloadService {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheEntry<Bytes>> {
        Box::pin(self.download(url))
    }
}

/// Runs the future produced by `task_gen` up to `attempts` times, until it succeeds or fails
/// with an error that is not worth retrying.
pub async fn retry<G, F, T>(attempts: usize, task_gen: G) -> CacheEntry<T>
where
    G: Fn() -> F,
    F: Future<Output = CacheEntry<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        let should_not_retry = match &result {
            Ok(_) => true,
            Err(e) => !e.is_retryable(),
        };

        if should_not_retry || tries >= attempts {
            break result;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
