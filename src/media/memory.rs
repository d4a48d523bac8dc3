//! Memory tier: decoded images bounded by entry count and total cost.

use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::debug;

use super::key::MediaKey;
use super::raster::CachedImage;

/// Bounded table of decoded images.
///
/// Evicts least-recently-used entries when either the count limit or the
/// cost limit is exceeded. Callers should only rely on the bounds, not on
/// the eviction order.
pub struct MemoryTable {
  entries: LruCache<MediaKey, CachedImage>,
  total_cost: u64,
  cost_limit: u64,
}

impl MemoryTable {
  pub fn new(count_limit: usize, cost_limit: u64) -> Self {
    Self {
      entries: LruCache::new(NonZeroUsize::new(count_limit).unwrap_or(NonZeroUsize::MIN)),
      total_cost: 0,
      cost_limit,
    }
  }

  pub fn get(&mut self, key: &MediaKey) -> Option<CachedImage> {
    self.entries.get(key).cloned()
  }

  /// Membership check that leaves the eviction order untouched.
  pub fn contains(&self, key: &MediaKey) -> bool {
    self.entries.contains(key)
  }

  pub fn insert(&mut self, key: MediaKey, image: CachedImage) {
    let cost = image.cost();
    if cost > self.cost_limit {
      debug!(key = %key, cost, "image larger than memory budget, not retained");
      self.remove(&key);
      return;
    }

    // `push` hands back either the replaced value or the evicted LRU entry.
    if let Some((_, displaced)) = self.entries.push(key, image) {
      self.total_cost -= displaced.cost();
    }
    self.total_cost += cost;

    while self.total_cost > self.cost_limit {
      match self.entries.pop_lru() {
        Some((_, evicted)) => self.total_cost -= evicted.cost(),
        None => break,
      }
    }
  }

  pub fn remove(&mut self, key: &MediaKey) {
    if let Some(removed) = self.entries.pop(key) {
      self.total_cost -= removed.cost();
    }
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.total_cost = 0;
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn total_cost(&self) -> u64 {
    self.total_cost
  }
}
