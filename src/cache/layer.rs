//! Glue between a live entity feed and the offline entity cache.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::entity::EntityCache;
use super::traits::{CacheResult, Cacheable};
use crate::config::EntityConfig;

/// A push-based source of ordered collection snapshots.
pub trait FeedSource<T>: Send + Sync {
  /// Subscribe to `key`; every item is one complete snapshot of the collection.
  fn subscribe(&self, key: &str) -> BoxStream<'static, Vec<T>>;
}

/// Mirrors a feed into the entity cache.
///
/// A screen first paints from [`FeedMirror::cold_start`], then attaches the
/// live feed with [`FeedMirror::follow`]; every delivered snapshot is saved
/// before it is handed on.
#[derive(Clone)]
pub struct FeedMirror {
  cache: Arc<EntityCache>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl FeedMirror {
  pub fn new(cache: Arc<EntityCache>) -> Self {
    Self::from_config(cache, &EntityConfig::default())
  }

  /// Mirror whose stale time comes from `entities.stale_after_secs`.
  pub fn from_config(cache: Arc<EntityCache>, config: &EntityConfig) -> Self {
    Self {
      cache,
      stale_time: config.stale_after(),
    }
  }

  /// Set the stale time for cold-start snapshots.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn cache(&self) -> &Arc<EntityCache> {
    &self.cache
  }

  /// Last known snapshot for `key`, tagged fresh or stale.
  ///
  /// `None` means the caller should wait for the live feed.
  pub async fn cold_start<T: Cacheable>(&self, key: &str) -> Option<CacheResult<Vec<T>>> {
    let data = self.cache.load::<T>(key).await?;
    let is_stale = self.cache.is_stale(key, self.stale_time);
    Some(CacheResult::from_cache(
      data,
      self.cache.last_saved_at(key),
      is_stale,
    ))
  }

  /// Consume the feed for `key` until it ends, persisting every snapshot.
  ///
  /// A snapshot whose save fails is still delivered. Returns the number of
  /// snapshots delivered.
  pub async fn follow<T, F>(
    &self,
    key: &str,
    feed: &F,
    mut on_snapshot: impl FnMut(CacheResult<Vec<T>>),
  ) -> usize
  where
    T: Cacheable,
    F: FeedSource<T> + ?Sized,
  {
    let mut snapshots = feed.subscribe(key);
    let mut delivered = 0usize;

    while let Some(snapshot) = snapshots.next().await {
      if let Err(e) = self.cache.save(&snapshot, key).await {
        warn!(key, error = %e, "failed to persist feed snapshot");
      }
      debug!(key, count = snapshot.len(), "feed snapshot");
      on_snapshot(CacheResult::from_network(snapshot));
      delivered += 1;
    }

    delivered
  }

  /// Cold start followed by the live feed, all delivered to one callback.
  pub async fn mirror<T, F>(
    &self,
    key: &str,
    feed: &F,
    mut on_snapshot: impl FnMut(CacheResult<Vec<T>>),
  ) -> usize
  where
    T: Cacheable,
    F: FeedSource<T> + ?Sized,
  {
    if let Some(cached) = self.cold_start::<T>(key).await {
      on_snapshot(cached);
    }
    self.follow(key, feed, on_snapshot).await
  }
}
