use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching or decoding an artifact.
///
/// None of these are ever returned to the caller of a load. A failed artifact is dropped from the
/// request table so that the next load for its URL starts over.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The artifact was not found at the remote location.
    #[error("not found")]
    NotFound,
    /// The artifact could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The artifact could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The artifact could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The artifact was fetched, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the loader itself, such as a file system error.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

impl CacheError {
    /// Reports the innermost cause of `error` as a [`DownloadError`](Self::DownloadError).
    pub(crate) fn download_error(mut error: &dyn StdError) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }

    #[track_caller]
    pub fn from_std_error<E: StdError + 'static>(e: E) -> Self {
        let dynerr: &dyn StdError = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Whether retrying the same download may yield a different result.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound | Self::PermissionDenied(_) | Self::Malformed(_))
    }

    /// A short name suitable as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internal",
        }
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the reason why an
/// artifact could not be fetched or is otherwise unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

/// A load call that was rejected before any work was scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("artifact URL is empty")]
    EmptyUrl,
}
