//! Per-collection JSON snapshots on disk, mirrored by an in-memory shadow.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::sanitize::{desanitize, sanitize};
use super::storage::{FreshnessStore, MemoryFreshness, SqliteFreshness};
use super::traits::Cacheable;
use crate::config::{EntityConfig, FreshnessBackend};
use crate::error::{CacheError, Result};
use crate::fs::{remove_if_exists, write_atomic};

const SNAPSHOT_EXTENSION: &str = "json";
const FRESHNESS_DB: &str = "freshness.db";

type Records = Arc<Vec<Value>>;

/// Generic offline mirror for entity collections.
///
/// Each collection key maps to `<root>/<key>.json`, a JSON array of
/// sanitized records. The shadow holds the same records for keys that have
/// been saved or loaded in this process.
pub struct EntityCache {
  root: PathBuf,
  shadow: RwLock<HashMap<String, Records>>,
  freshness: Box<dyn FreshnessStore>,
  /// Serializes file replacement and shadow updates across saves and clears
  write_lock: Mutex<()>,
}

impl EntityCache {
  pub fn new(root: impl Into<PathBuf>, freshness: impl FreshnessStore + 'static) -> Self {
    Self {
      root: root.into(),
      shadow: RwLock::new(HashMap::new()),
      freshness: Box::new(freshness),
      write_lock: Mutex::new(()),
    }
  }

  /// Open the cache described by `config`, creating the offline directory.
  pub fn open(config: &EntityConfig) -> color_eyre::Result<Self> {
    let root = config.offline_root()?;
    std::fs::create_dir_all(&root).map_err(|e| {
      color_eyre::eyre::eyre!(
        "Failed to create offline directory {}: {}",
        root.display(),
        e
      )
    })?;

    let cache = match config.freshness {
      FreshnessBackend::Sqlite => {
        let store = SqliteFreshness::open(&root.join(FRESHNESS_DB))?;
        Self::new(root, store)
      }
      FreshnessBackend::Memory => Self::new(root, MemoryFreshness::new()),
    };
    Ok(cache)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Persist a full snapshot for `key`, replacing whatever was there.
  ///
  /// The previous snapshot stays intact on disk and in memory if anything
  /// fails before the new file is in place.
  pub async fn save<T: Cacheable>(&self, items: &[T], key: &str) -> Result<()> {
    let records = items
      .iter()
      .map(|item| serde_json::to_value(item).map(sanitize))
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| CacheError::Decode(format!("Failed to encode {} record: {}", key, e)))?;
    let body = serde_json::to_vec(&records)
      .map_err(|e| CacheError::Decode(format!("Failed to encode {} snapshot: {}", key, e)))?;

    let _guard = self.write_lock.lock().await;

    let path = self.path_for(key);
    tokio::task::spawn_blocking(move || write_atomic(&path, &body))
      .await
      .map_err(|e| CacheError::Io(format!("Snapshot write for {} aborted: {}", key, e)))?
      .map_err(|e| CacheError::io(format!("Failed to write {} snapshot", key), e))?;

    let count = records.len();
    self.shadow_write().insert(key.to_string(), Arc::new(records));
    self.freshness.record(key, Utc::now(), count)?;

    debug!(key, count, "saved collection snapshot");
    Ok(())
  }

  /// Read the last snapshot for `key`.
  ///
  /// Records that no longer decode as `T` are skipped. Returns `None` when
  /// nothing is stored, the file is unreadable, or no record decodes.
  pub async fn load<T: Cacheable>(&self, key: &str) -> Option<Vec<T>> {
    let records = match self.shadow_read(key) {
      Some(records) => records,
      None => {
        // Cold reads fill the shadow under the write lock so a concurrent
        // clear cannot be undone by a read that started before it.
        let _guard = self.write_lock.lock().await;
        match self.shadow_read(key) {
          Some(records) => records,
          None => {
            let records = self.read_snapshot(key).await?;
            self
              .shadow_write()
              .insert(key.to_string(), Arc::clone(&records));
            records
          }
        }
      }
    };

    let mut skipped = 0usize;
    let items: Vec<T> = records
      .iter()
      .filter_map(|record| match serde_json::from_value(desanitize(record.clone())) {
        Ok(item) => Some(item),
        Err(e) => {
          skipped += 1;
          debug!(key, error = %e, "skipping undecodable record");
          None
        }
      })
      .collect();

    if skipped > 0 {
      warn!(key, skipped, kept = items.len(), "dropped undecodable records");
    }

    if items.is_empty() {
      None
    } else {
      Some(items)
    }
  }

  /// Save under the entity type's own collection key.
  pub async fn save_collection<T: Cacheable>(&self, items: &[T]) -> Result<()> {
    self.save(items, T::collection()).await
  }

  /// Load the entity type's own collection.
  pub async fn load_collection<T: Cacheable>(&self) -> Option<Vec<T>> {
    self.load(T::collection()).await
  }

  /// Whether a snapshot exists for `key`, regardless of whether it decodes.
  pub fn has_cached_data(&self, key: &str) -> bool {
    self.shadow_read(key).is_some() || self.path_for(key).is_file()
  }

  /// When `key` was last saved successfully.
  pub fn last_saved_at(&self, key: &str) -> Option<DateTime<Utc>> {
    match self.freshness.get(key) {
      Ok(stamp) => stamp.map(|s| s.saved_at),
      Err(e) => {
        warn!(key, error = %e, "failed to read freshness stamp");
        None
      }
    }
  }

  /// Time since the last successful save of `key`.
  pub fn cache_age(&self, key: &str) -> Option<Duration> {
    self
      .last_saved_at(key)
      .map(|at| (Utc::now() - at).to_std().unwrap_or(Duration::ZERO))
  }

  /// True when `key` was never saved or was saved longer than `max_age` ago.
  pub fn is_stale(&self, key: &str, max_age: Duration) -> bool {
    match self.cache_age(key) {
      Some(age) => age > max_age,
      None => true,
    }
  }

  /// Remove the snapshot, shadow entry and freshness stamp for `key`.
  pub async fn clear(&self, key: &str) -> Result<()> {
    let _guard = self.write_lock.lock().await;

    remove_if_exists(&self.path_for(key))
      .map_err(|e| CacheError::io(format!("Failed to delete {} snapshot", key), e))?;
    self.shadow_write().remove(key);
    self.freshness.remove(key)?;

    debug!(key, "cleared collection");
    Ok(())
  }

  /// Remove every collection (e.g. on logout).
  pub async fn clear_all(&self) -> Result<()> {
    let _guard = self.write_lock.lock().await;

    self.shadow_write().clear();
    self.freshness.clear()?;

    let mut entries = match tokio::fs::read_dir(&self.root).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
      Err(e) => return Err(CacheError::io("Failed to list offline directory", e)),
    };

    let mut removed = 0usize;
    while let Some(entry) = entries
      .next_entry()
      .await
      .map_err(|e| CacheError::io("Failed to list offline directory", e))?
    {
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_EXTENSION) {
        remove_if_exists(&path)
          .map_err(|e| CacheError::io(format!("Failed to delete {}", path.display()), e))?;
        removed += 1;
      }
    }

    info!(removed, "cleared all collections");
    Ok(())
  }

  async fn read_snapshot(&self, key: &str) -> Option<Records> {
    let path = self.path_for(key);
    let bytes = match tokio::fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == ErrorKind::NotFound => return None,
      Err(e) => {
        warn!(key, error = %e, "failed to read collection snapshot");
        return None;
      }
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
      return None;
    }

    match serde_json::from_slice::<Vec<Value>>(&bytes) {
      Ok(records) => Some(Arc::new(records)),
      Err(e) => {
        warn!(key, error = %e, "corrupt collection snapshot");
        None
      }
    }
  }

  fn path_for(&self, key: &str) -> PathBuf {
    self
      .root
      .join(format!("{}.{}", file_stem(key), SNAPSHOT_EXTENSION))
  }

  fn shadow_read(&self, key: &str) -> Option<Records> {
    self
      .shadow
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
  }

  fn shadow_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Records>> {
    self.shadow.write().unwrap_or_else(PoisonError::into_inner)
  }
}

fn is_plain_key_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Collection keys become file names.
///
/// Plain keys (`[A-Za-z0-9._-]`, no leading dot) are used as-is. Any other
/// key keeps a readable prefix followed by `~` and the sha256 of the key, so
/// no two keys share a file.
fn file_stem(key: &str) -> String {
  if !key.is_empty() && !key.starts_with('.') && key.chars().all(is_plain_key_char) {
    return key.to_string();
  }

  let readable: String = key
    .chars()
    .map(|c| if is_plain_key_char(c) { c } else { '_' })
    .collect();
  let digest = hex::encode(Sha256::digest(key.as_bytes()));
  format!("{}~{}", readable.trim_start_matches('.'), digest)
}
