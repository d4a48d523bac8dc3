//! Two-tier image cache with deduplicated network fetches.

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bandwidth::BandwidthGate;
use super::disk::DiskStore;
use super::fetch::{FetchBytes, HttpFetcher};
use super::key::{MediaKey, Variant};
use super::memory::MemoryTable;
use super::raster::{derive_thumbnail, CachedImage};
use crate::config::MediaConfig;
use crate::error::{CacheError, Result};

type LoadFuture = Shared<BoxFuture<'static, Result<CachedImage>>>;

/// State that must only change under the lock.
struct MediaState {
  memory: MemoryTable,
  /// One pending resolution per key, shared by every caller asking for it
  in_flight: HashMap<MediaKey, LoadFuture>,
}

struct Inner {
  state: Mutex<MediaState>,
  disk: DiskStore,
  fetcher: Arc<dyn FetchBytes>,
  thumbnail_max_dimension: u32,
  preload_batch_size: usize,
  preload_thumbnail_limit: usize,
  disk_max_age: Duration,
  hits: AtomicU64,
  misses: AtomicU64,
  disk_hits: AtomicU64,
}

/// Counters and memory-tier occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaCacheStats {
  /// Loads answered from memory
  pub hits: u64,
  /// Loads that went to the network
  pub misses: u64,
  /// Loads answered from disk
  pub disk_hits: u64,
  pub memory_entries: usize,
  pub memory_cost: u64,
}

impl MediaCacheStats {
  /// Share of loads served without the network.
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses + self.disk_hits;
    if total == 0 {
      0.0
    } else {
      (self.hits + self.disk_hits) as f64 / total as f64
    }
  }
}

/// Outcome of a preload run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadSummary {
  pub loaded: usize,
  pub failed: usize,
}

impl std::ops::Add for PreloadSummary {
  type Output = Self;

  fn add(self, other: Self) -> Self {
    Self {
      loaded: self.loaded + other.loaded,
      failed: self.failed + other.failed,
    }
  }
}

/// Image cache: memory, then disk, then a single shared network fetch per key.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MediaCache {
  inner: Arc<Inner>,
}

impl MediaCache {
  /// Create a cache rooted at `root`, creating its directories.
  pub fn new(root: &Path, fetcher: Arc<dyn FetchBytes>, config: &MediaConfig) -> Result<Self> {
    let disk = DiskStore::new(root);
    disk.ensure_dirs()?;

    Ok(Self {
      inner: Arc::new(Inner {
        state: Mutex::new(MediaState {
          memory: MemoryTable::new(config.memory_count_limit, config.memory_cost_limit),
          in_flight: HashMap::new(),
        }),
        disk,
        fetcher,
        thumbnail_max_dimension: config.thumbnail_max_dimension,
        preload_batch_size: config.preload_batch_size(),
        preload_thumbnail_limit: config.preload_thumbnail_limit,
        disk_max_age: config.disk_max_age(),
        hits: AtomicU64::new(0),
        misses: AtomicU64::new(0),
        disk_hits: AtomicU64::new(0),
      }),
    })
  }

  /// Create a cache from configuration, fetching over HTTP.
  pub fn open(config: &MediaConfig) -> color_eyre::Result<Self> {
    let root = config.cache_root()?;
    let fetcher = HttpFetcher::new(config.fetch_timeout())?;
    Ok(Self::new(&root, Arc::new(fetcher), config)?)
  }

  /// Load an image, consulting memory, disk and finally the network.
  ///
  /// Concurrent loads of the same key share one resolution and receive the
  /// same image or the same error.
  pub async fn load(&self, url: &str, variant: Variant) -> Result<CachedImage> {
    let key = MediaKey::new(url, variant);

    let pending = {
      let mut state = self.inner.state();
      if let Some(image) = state.memory.get(&key) {
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "memory hit");
        return Ok(image);
      }

      match state.in_flight.get(&key) {
        Some(load) => {
          debug!(key = %key, "joining in-flight load");
          load.clone()
        }
        None => {
          // Registered before the lock is released, so the task's guard
          // always finds this entry when it runs.
          let task = tokio::spawn(Arc::clone(&self.inner).resolve(key.clone()));
          let load: LoadFuture = async move {
            task
              .await
              .map_err(|e| CacheError::Io(format!("Media load task failed: {}", e)))?
          }
          .boxed()
          .shared();

          state.in_flight.insert(key, load.clone());
          load
        }
      }
    };

    pending.await
  }

  /// Load `urls` in fixed-size batches, one batch at a time.
  ///
  /// Failures are logged and skipped. The returned handle may be dropped.
  pub fn preload(&self, urls: Vec<String>, variant: Variant) -> JoinHandle<PreloadSummary> {
    let cache = self.clone();
    tokio::spawn(async move { cache.preload_batches(&urls, variant).await })
  }

  /// Preload for a freshly delivered feed.
  ///
  /// On cheap bandwidth every URL is preloaded in both variants for offline
  /// use; otherwise only the first few thumbnails are.
  pub fn preload_for_feed(
    &self,
    urls: Vec<String>,
    gate: &dyn BandwidthGate,
  ) -> JoinHandle<PreloadSummary> {
    let cache = self.clone();
    if gate.is_cheap_to_download_large_media() {
      tokio::spawn(async move {
        let full = cache.preload_batches(&urls, Variant::Full).await;
        let thumbnails = cache.preload_batches(&urls, Variant::Thumbnail).await;
        full + thumbnails
      })
    } else {
      let limit = self.inner.preload_thumbnail_limit;
      tokio::spawn(async move {
        let first = &urls[..urls.len().min(limit)];
        cache.preload_batches(first, Variant::Thumbnail).await
      })
    }
  }

  async fn preload_batches(&self, urls: &[String], variant: Variant) -> PreloadSummary {
    let mut summary = PreloadSummary::default();

    for batch in urls.chunks(self.inner.preload_batch_size) {
      let results = join_all(batch.iter().map(|url| self.load(url, variant))).await;
      for (url, result) in batch.iter().zip(results) {
        match result {
          Ok(_) => summary.loaded += 1,
          Err(e) => {
            summary.failed += 1;
            debug!(url = %url, variant = %variant, error = %e, "preload failed");
          }
        }
      }
    }

    debug!(
      variant = %variant,
      loaded = summary.loaded,
      failed = summary.failed,
      "preload finished"
    );
    summary
  }

  /// Whether `(url, variant)` is in memory or on disk. Never decodes.
  pub fn is_cached(&self, url: &str, variant: Variant) -> bool {
    let key = MediaKey::new(url, variant);
    self.inner.state().memory.contains(&key) || self.inner.disk.contains(&key)
  }

  /// Empty both tiers and reset the counters.
  pub async fn clear_cache(&self) -> Result<()> {
    self.inner.state().memory.clear();
    self.inner.disk.clear().await?;
    self.inner.hits.store(0, Ordering::Relaxed);
    self.inner.misses.store(0, Ordering::Relaxed);
    self.inner.disk_hits.store(0, Ordering::Relaxed);

    info!("media cache cleared");
    Ok(())
  }

  /// Delete disk entries not modified within `max_age`. Memory is untouched.
  pub async fn evict_stale(&self, max_age: Duration) -> Result<usize> {
    let removed = self.inner.disk.evict_older_than(max_age).await?;
    info!(removed, max_age_secs = max_age.as_secs(), "swept stale media");
    Ok(removed)
  }

  /// [`MediaCache::evict_stale`] with the configured maximum age.
  pub async fn evict_expired(&self) -> Result<usize> {
    self.evict_stale(self.inner.disk_max_age).await
  }

  /// Drop every decoded image; disk and in-flight loads are untouched.
  pub fn handle_memory_pressure(&self) {
    let mut state = self.inner.state();
    let dropped = state.memory.len();
    state.memory.clear();
    info!(dropped, "memory pressure, dropped decoded images");
  }

  pub fn stats(&self) -> MediaCacheStats {
    let state = self.inner.state();
    MediaCacheStats {
      hits: self.inner.hits.load(Ordering::Relaxed),
      misses: self.inner.misses.load(Ordering::Relaxed),
      disk_hits: self.inner.disk_hits.load(Ordering::Relaxed),
      memory_entries: state.memory.len(),
      memory_cost: state.memory.total_cost(),
    }
  }

  /// Number of keys currently being resolved.
  pub fn in_flight(&self) -> usize {
    self.inner.state().in_flight.len()
  }
}

impl Inner {
  fn state(&self) -> MutexGuard<'_, MediaState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Disk, then network. Runs as its own task so it completes even if every
  /// waiting caller goes away.
  async fn resolve(self: Arc<Self>, key: MediaKey) -> Result<CachedImage> {
    let _flight = FlightGuard {
      inner: Arc::clone(&self),
      key: key.clone(),
    };

    if let Some(image) = self.read_disk(&key).await {
      self.disk_hits.fetch_add(1, Ordering::Relaxed);
      debug!(key = %key, "disk hit");
      self.state().memory.insert(key, image.clone());
      return Ok(image);
    }

    self.misses.fetch_add(1, Ordering::Relaxed);
    debug!(key = %key, "fetching");
    let bytes = self.fetcher.fetch(&key.url).await?;

    // Thumbnails are derived locally from the full image.
    let variant = key.variant;
    let max_dimension = self.thumbnail_max_dimension;
    let (image, encoded) = tokio::task::spawn_blocking(move || match variant {
      Variant::Full => CachedImage::decode(&bytes).map(|image| (image, bytes)),
      Variant::Thumbnail => derive_thumbnail(&bytes, max_dimension),
    })
    .await
    .map_err(|e| CacheError::Decode(format!("Decode task failed: {}", e)))??;

    self.state().memory.insert(key.clone(), image.clone());

    let disk = self.disk.clone();
    tokio::spawn(async move {
      if let Err(e) = disk.write(&key, encoded).await {
        warn!(key = %key, error = %e, "background disk write failed");
      }
    });

    Ok(image)
  }

  /// Decoded disk entry, if present and valid. Corrupt entries are deleted.
  async fn read_disk(&self, key: &MediaKey) -> Option<CachedImage> {
    let bytes = match self.disk.read(key).await {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return None,
      Err(e) => {
        warn!(key = %key, error = %e, "disk read failed");
        return None;
      }
    };

    match tokio::task::spawn_blocking(move || CachedImage::decode(&bytes)).await {
      Ok(Ok(image)) => Some(image),
      Ok(Err(e)) => {
        warn!(key = %key, error = %e, "discarding undecodable disk entry");
        if let Err(e) = self.disk.remove(key).await {
          warn!(key = %key, error = %e, "failed to delete undecodable disk entry");
        }
        None
      }
      Err(e) => {
        warn!(key = %key, error = %e, "disk decode task failed");
        None
      }
    }
  }
}

/// Removes a ledger entry when its resolution ends, however it ends.
struct FlightGuard {
  inner: Arc<Inner>,
  key: MediaKey,
}

impl Drop for FlightGuard {
  fn drop(&mut self) {
    self.inner.state().in_flight.remove(&self.key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::media::bandwidth::FixedBandwidth;
  use crate::media::disk::tests::backdate;
  use crate::media::raster::tests::png;
  use async_trait::async_trait;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::Semaphore;

  const URL: &str = "https://x/img.jpg";

  /// Serves one canned body, counting calls and peak concurrency.
  struct StubFetcher {
    body: Vec<u8>,
    failing: Vec<String>,
    gate: Semaphore,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
  }

  impl StubFetcher {
    fn serving(body: Vec<u8>) -> Self {
      Self {
        body,
        failing: Vec::new(),
        gate: Semaphore::new(Semaphore::MAX_PERMITS),
        delay: Duration::ZERO,
        calls: AtomicUsize::new(0),
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
      }
    }

    /// Holds every fetch until `release` is called.
    fn gated(body: Vec<u8>) -> Self {
      Self {
        gate: Semaphore::new(0),
        ..Self::serving(body)
      }
    }

    fn failing_for(mut self, url: &str) -> Self {
      self.failing.push(url.to_string());
      self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
    }

    fn release(&self) {
      self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl FetchBytes for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);

      let _permit = self
        .gate
        .acquire()
        .await
        .map_err(|e| CacheError::Network(e.to_string()));
      tokio::time::sleep(self.delay).await;
      self.active.fetch_sub(1, Ordering::SeqCst);

      if self.failing.iter().any(|u| u == url) {
        return Err(CacheError::Network(format!("HTTP 503 for {}", url)));
      }
      Ok(self.body.clone())
    }
  }

  fn config() -> MediaConfig {
    MediaConfig {
      thumbnail_max_dimension: 100,
      preload_thumbnail_limit: 2,
      ..MediaConfig::default()
    }
  }

  fn cache(root: &Path, fetcher: &Arc<StubFetcher>) -> MediaCache {
    let fetcher: Arc<dyn FetchBytes> = fetcher.clone();
    MediaCache::new(root, fetcher, &config()).unwrap()
  }

  /// Background disk writes are fire-and-forget; wait for one to land.
  async fn wait_for_disk(cache: &MediaCache, url: &str, variant: Variant) {
    let key = MediaKey::new(url, variant);
    for _ in 0..200 {
      if cache.inner.disk.contains(&key) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("disk entry for {} never appeared", key);
  }

  #[tokio::test]
  async fn test_first_load_fetches_once_then_serves_memory() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::serving(png(64, 48)));
    let cache = cache(dir.path(), &fetcher);

    let first = cache.load(URL, Variant::Full).await.unwrap();
    assert_eq!(fetcher.calls(), 1);
    let stats = cache.stats();
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.memory_cost, 64 * 48 * 4);

    let second = cache.load(URL, Variant::Full).await.unwrap();
    assert_eq!(fetcher.calls(), 1);
    assert!(first.ptr_eq(&second));

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.disk_hits), (1, 1, 0));
    assert_eq!(stats.hit_rate(), 0.5);
  }

  #[tokio::test]
  async fn test_concurrent_loads_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::gated(png(10, 10)));
    let cache = cache(dir.path(), &fetcher);

    let loads: Vec<_> = (0..8)
      .map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.load(URL, Variant::Full).await })
      })
      .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.in_flight(), 1);
    fetcher.release();

    let images: Vec<CachedImage> = join_all(loads)
      .await
      .into_iter()
      .map(|joined| joined.unwrap().unwrap())
      .collect();

    assert_eq!(fetcher.calls(), 1);
    assert!(images.iter().all(|image| image.ptr_eq(&images[0])));
    assert_eq!(cache.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_concurrent_failures_share_one_error_and_clean_up() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::gated(png(10, 10)).failing_for(URL));
    let cache = cache(dir.path(), &fetcher);

    let loads: Vec<_> = (0..4)
      .map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.load(URL, Variant::Full).await })
      })
      .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    fetcher.release();

    let errors: Vec<CacheError> = join_all(loads)
      .await
      .into_iter()
      .map(|joined| joined.unwrap().unwrap_err())
      .collect();

    assert_eq!(fetcher.calls(), 1);
    assert!(errors.iter().all(|e| e.is_network() && *e == errors[0]));
    assert_eq!(cache.in_flight(), 0);
    assert!(!cache.is_cached(URL, Variant::Full));

    // The ledger is clear, so the next load tries again.
    assert!(cache.load(URL, Variant::Full).await.is_err());
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_memory_pressure_falls_back_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::serving(png(20, 20)));
    let cache = cache(dir.path(), &fetcher);

    cache.load(URL, Variant::Full).await.unwrap();
    assert!(cache.is_cached(URL, Variant::Full));
    wait_for_disk(&cache, URL, Variant::Full).await;

    cache.handle_memory_pressure();
    assert_eq!(cache.stats().memory_entries, 0);
    assert!(cache.is_cached(URL, Variant::Full));

    let image = cache.load(URL, Variant::Full).await.unwrap();
    assert_eq!((image.width(), image.height()), (20, 20));
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.stats().disk_hits, 1);
    assert_eq!(cache.stats().memory_entries, 1);
  }

  #[tokio::test]
  async fn test_clear_cache_empties_both_tiers_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::serving(png(20, 20)));
    let cache = cache(dir.path(), &fetcher);

    cache.load(URL, Variant::Full).await.unwrap();
    wait_for_disk(&cache, URL, Variant::Full).await;

    cache.clear_cache().await.unwrap();

    assert!(!cache.is_cached(URL, Variant::Full));
    assert_eq!(cache.stats(), MediaCacheStats::default());

    cache.load(URL, Variant::Full).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_thumbnail_is_derived_from_full_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::serving(png(400, 200)));
    let cache = cache(dir.path(), &fetcher);

    let thumb = cache.load(URL, Variant::Thumbnail).await.unwrap();
    assert_eq!((thumb.width(), thumb.height()), (100, 50));
    assert_eq!(fetcher.calls(), 1);
    assert!(cache.is_cached(URL, Variant::Thumbnail));
    assert!(!cache.is_cached(URL, Variant::Full));

    wait_for_disk(&cache, URL, Variant::Thumbnail).await;
    cache.handle_memory_pressure();
    let from_disk = cache.load(URL, Variant::Thumbnail).await.unwrap();
    assert_eq!((from_disk.width(), from_disk.height()), (100, 50));
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_evict_stale_keeps_recent_entries() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::serving(png(8, 8)));
    let cache = cache(dir.path(), &fetcher);
    let old = "https://x/old.png";
    let recent = "https://x/recent.png";

    for url in [old, recent] {
      cache.load(url, Variant::Full).await.unwrap();
      wait_for_disk(&cache, url, Variant::Full).await;
    }
    backdate(
      &cache.inner.disk.path_for(&MediaKey::new(old, Variant::Full)),
      Duration::from_secs(45 * 86_400),
    );
    cache.handle_memory_pressure();

    assert_eq!(cache.evict_expired().await.unwrap(), 1);
    assert!(!cache.is_cached(old, Variant::Full));
    assert!(cache.is_cached(recent, Variant::Full));

    cache.load(recent, Variant::Full).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
    cache.load(old, Variant::Full).await.unwrap();
    assert_eq!(fetcher.calls(), 3);
  }

  #[tokio::test]
  async fn test_undecodable_bytes_surface_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::serving(b"<html>oops</html>".to_vec()));
    let cache = cache(dir.path(), &fetcher);

    let err = cache.load(URL, Variant::Full).await.unwrap_err();
    assert!(err.is_decode());
    assert!(!cache.is_cached(URL, Variant::Full));
    assert_eq!(cache.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_corrupt_disk_entry_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::serving(png(5, 5)));
    let cache = cache(dir.path(), &fetcher);
    let key = MediaKey::new(URL, Variant::Full);
    std::fs::write(cache.inner.disk.path_for(&key), b"truncated").unwrap();

    let image = cache.load(URL, Variant::Full).await.unwrap();
    assert_eq!(image.width(), 5);
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_preload_skips_failures_and_bounds_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let urls: Vec<String> = (0..9).map(|n| format!("https://x/{}.png", n)).collect();
    let fetcher = Arc::new(
      StubFetcher::serving(png(4, 4))
        .failing_for(&urls[3])
        .with_delay(Duration::from_millis(20)),
    );
    let cache = cache(dir.path(), &fetcher);

    let summary = cache.preload(urls.clone(), Variant::Full).await.unwrap();

    assert_eq!(summary, PreloadSummary { loaded: 8, failed: 1 });
    assert_eq!(fetcher.calls(), 9);
    assert!(fetcher.peak.load(Ordering::SeqCst) <= config().preload_batch_size());
    for (n, url) in urls.iter().enumerate() {
      assert_eq!(cache.is_cached(url, Variant::Full), n != 3);
    }
  }

  #[tokio::test]
  async fn test_preload_for_feed_follows_bandwidth() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::serving(png(300, 300)));
    let cache = cache(dir.path(), &fetcher);
    let urls: Vec<String> = (0..3).map(|n| format!("https://x/{}.png", n)).collect();

    let metered = FixedBandwidth::new(false);
    let summary = cache
      .preload_for_feed(urls.clone(), &metered)
      .await
      .unwrap();
    assert_eq!(summary.loaded, 2);
    assert!(cache.is_cached(&urls[0], Variant::Thumbnail));
    assert!(cache.is_cached(&urls[1], Variant::Thumbnail));
    assert!(!cache.is_cached(&urls[2], Variant::Thumbnail));
    assert!(urls.iter().all(|u| !cache.is_cached(u, Variant::Full)));

    metered.set(true);
    let summary = cache
      .preload_for_feed(urls.clone(), &metered)
      .await
      .unwrap();
    assert_eq!(summary, PreloadSummary { loaded: 6, failed: 0 });
    for url in &urls {
      assert!(cache.is_cached(url, Variant::Full));
      assert!(cache.is_cached(url, Variant::Thumbnail));
    }
  }
}
