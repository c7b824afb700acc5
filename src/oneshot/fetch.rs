//! Outbound HTTP GET.

use bytes::Bytes;
use reqwest::{StatusCode, Url};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::RequestError;

/// A fetched response. Non-2xx statuses are returned, not treated as errors.
#[derive(Debug)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// HTTP client for one-shot fetches.
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("netplex/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RequestError::Client)?;
        Ok(Fetcher { client })
    }

    /// Issue a GET for `url` and read the whole body. Not retried.
    pub async fn fetch(&self, url: &str) -> Result<FetchResponse, RequestError> {
        let parsed = Url::parse(url).map_err(|e| RequestError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RequestError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let start = Instant::now();
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|source| RequestError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|source| RequestError::Body {
            url: url.to_string(),
            source,
        })?;

        let elapsed = start.elapsed();
        debug!(url, status = status.as_u16(), bytes = body.len(), ?elapsed, "Fetched URL");

        Ok(FetchResponse {
            status,
            body,
            elapsed,
        })
    }
}

/// Fetch `url` with a fresh client.
pub async fn fetch(url: &str, timeout: Duration) -> Result<FetchResponse, RequestError> {
    Fetcher::new(timeout)?.fetch(url).await
}
