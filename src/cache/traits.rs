//! Core traits and types for the entity cache.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for entities that can be mirrored into the offline cache.
///
/// Any serde type qualifies; the cache never needs per-type persistence code.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Default collection key for this entity type (e.g. "photos", "notes").
  fn collection() -> &'static str;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Wrap a snapshot delivered by the live feed.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Wrap a snapshot read back from the offline cache.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }

  pub fn is_from_cache(&self) -> bool {
    !matches!(self.source, CacheSource::Network)
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Delivered by the live feed
  Network,
  /// From the offline cache, still considered fresh
  CacheFresh,
  /// From the offline cache, older than the freshness threshold
  CacheStale,
}
