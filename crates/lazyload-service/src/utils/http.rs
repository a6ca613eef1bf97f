use std::time::Duration;

use reqwest::{StatusCode, redirect};

use crate::config::Config;

/// Timeouts applied to every fetch.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one fetch, including retries.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            max_download: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// A `302 Found` is only followed while at most one redirect has been taken so far. Longer
/// chains of temporary redirects tend to end on a login page instead of the artifact.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::custom(|attempt: redirect::Attempt| {
            // `previous` includes the original URL
            if attempt.status() == StatusCode::FOUND && attempt.previous().len() > 2 {
                return attempt.stop();
            }
            redirect::Policy::default().redirect(attempt)
        }))
        .build()
}
