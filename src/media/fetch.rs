//! Network capability consumed by the media cache.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::error::{CacheError, Result};

/// Fetch raw bytes for a URL.
///
/// Timeouts and retries are the implementor's business; the media cache
/// only distinguishes bytes from a [`CacheError::Network`] failure.
#[async_trait]
pub trait FetchBytes: Send + Sync {
  async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// HTTP(S) fetcher backed by `reqwest`.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| CacheError::Network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl FetchBytes for HttpFetcher {
  async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
    let parsed =
      Url::parse(url).map_err(|e| CacheError::Network(format!("Invalid URL {}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
      return Err(CacheError::Network(format!(
        "Unsupported URL scheme {}: {}",
        parsed.scheme(),
        url
      )));
    }

    let response = self
      .client
      .get(parsed)
      .send()
      .await
      .map_err(|e| CacheError::Network(format!("Failed to fetch {}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
      return Err(CacheError::Network(format!(
        "Failed to fetch {}: HTTP {}",
        url, status
      )));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| CacheError::Network(format!("Failed to read body of {}: {}", url, e)))?;

    Ok(bytes.to_vec())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_rejects_invalid_urls_without_network() {
    let fetcher = HttpFetcher::new(Duration::from_secs(1)).unwrap();

    let err = fetcher.fetch("not a url").await.unwrap_err();
    assert!(err.is_network());

    let err = fetcher.fetch("file:///etc/passwd").await.unwrap_err();
    assert!(err.to_string().contains("Unsupported URL scheme"));
  }
}
