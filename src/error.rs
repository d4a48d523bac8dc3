//! Error taxonomy shared by the media and entity caches.

use thiserror::Error;

/// Failure kinds surfaced by cache operations.
///
/// Payloads are plain strings so a single result can be cloned out to every
/// caller waiting on the same in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// Fetch timeout, DNS failure, non-success status.
  #[error("network error: {0}")]
  Network(String),
  /// Bytes are not a valid image, or a record is not valid JSON for an entity.
  #[error("decode error: {0}")]
  Decode(String),
  /// Disk read, write or delete failure.
  #[error("io error: {0}")]
  Io(String),
}

impl CacheError {
  pub fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
    Self::Io(format!("{}: {}", context, err))
  }

  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network(_))
  }

  pub fn is_decode(&self) -> bool {
    matches!(self, Self::Decode(_))
  }
}

impl From<std::io::Error> for CacheError {
  fn from(err: std::io::Error) -> Self {
    Self::Io(err.to_string())
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(err: serde_json::Error) -> Self {
    Self::Decode(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, CacheError>;
