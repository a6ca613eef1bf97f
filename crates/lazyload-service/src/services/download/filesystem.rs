//! Support to fetch artifacts from the local filesystem through `file://` URLs.

use std::io;

use bytes::Bytes;
use url::Url;

use crate::caching::{CacheEntry, CacheError};

/// Fetcher implementation for `file` URLs.
#[derive(Debug, Default)]
pub struct FilesystemFetcher {}

impl FilesystemFetcher {
    pub fn new() -> Self {
        Self {}
    }

    pub async fn fetch_url(&self, url: &Url) -> CacheEntry<Bytes> {
        let path = url
            .to_file_path()
            .map_err(|_| CacheError::DownloadError(format!("invalid file URL `{url}`")))?;
        tracing::debug!("Fetching artifact from {:?}", path);

        let data = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound,
            _ => e.into(),
        })?;
        Ok(Bytes::from(data))
    }
}
