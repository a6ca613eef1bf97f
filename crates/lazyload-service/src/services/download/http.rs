//! Support to fetch artifacts from HTTP servers.

use bytes::Bytes;
use reqwest::{Client, StatusCode, header};
use url::Url;

use crate::caching::{CacheEntry, CacheError};

use super::USER_AGENT;

/// Fetcher implementation for `http` and `https` URLs.
#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn fetch_url(&self, url: &Url) -> CacheEntry<Bytes> {
        tracing::debug!("Fetching artifact from `{}`", url);

        let response = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::trace!("Success hitting `{}`", url);
            Ok(response.bytes().await?)
        } else {
            Err(status_error(url, status))
        }
    }
}

/// Infers the [`CacheError`] from an unsuccessful HTTP status code.
fn status_error(url: &Url, status: StatusCode) -> CacheError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to fetch `{}`: {}", url, status);
        CacheError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{}`: {}", url, status);
        CacheError::NotFound
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when fetching `{}`", url);
        CacheError::PermissionDenied("Potential login page detected".to_string())
    } else {
        tracing::debug!("Unexpected status code from `{}`: {}", url, status);
        CacheError::DownloadError(status.to_string())
    }
}
