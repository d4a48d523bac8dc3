//! Disk tier: encoded image bytes under two directories.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

use super::key::{MediaKey, Variant};
use crate::error::{CacheError, Result};
use crate::fs::{remove_if_exists, write_atomic};

pub const IMAGE_DIR: &str = "ImageCache";
pub const THUMBNAIL_DIR: &str = "ThumbnailCache";

/// Encoded bytes keyed by hashed `(url, variant)`.
#[derive(Debug, Clone)]
pub struct DiskStore {
  full_dir: PathBuf,
  thumbnail_dir: PathBuf,
}

impl DiskStore {
  pub fn new(root: &Path) -> Self {
    Self {
      full_dir: root.join(IMAGE_DIR),
      thumbnail_dir: root.join(THUMBNAIL_DIR),
    }
  }

  pub fn ensure_dirs(&self) -> Result<()> {
    for dir in self.dirs() {
      std::fs::create_dir_all(dir)
        .map_err(|e| CacheError::io(format!("Failed to create {}", dir.display()), e))?;
    }
    Ok(())
  }

  pub fn path_for(&self, key: &MediaKey) -> PathBuf {
    let dir = match key.variant {
      Variant::Full => &self.full_dir,
      Variant::Thumbnail => &self.thumbnail_dir,
    };
    dir.join(key.file_name())
  }

  pub fn contains(&self, key: &MediaKey) -> bool {
    self.path_for(key).is_file()
  }

  pub async fn read(&self, key: &MediaKey) -> Result<Option<Vec<u8>>> {
    let path = self.path_for(key);
    match tokio::fs::read(&path).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(CacheError::io(format!("Failed to read {}", path.display()), e)),
    }
  }

  pub async fn write(&self, key: &MediaKey, bytes: Vec<u8>) -> Result<()> {
    let path = self.path_for(key);
    tokio::task::spawn_blocking(move || {
      write_atomic(&path, &bytes)
        .map_err(|e| CacheError::io(format!("Failed to write {}", path.display()), e))
    })
    .await
    .map_err(|e| CacheError::Io(format!("Disk write aborted: {}", e)))?
  }

  pub async fn remove(&self, key: &MediaKey) -> Result<()> {
    let path = self.path_for(key);
    remove_if_exists(&path)
      .map_err(|e| CacheError::io(format!("Failed to delete {}", path.display()), e))
  }

  /// Delete and recreate both directories.
  pub async fn clear(&self) -> Result<()> {
    for dir in self.dirs() {
      match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != ErrorKind::NotFound => {
          return Err(CacheError::io(format!("Failed to delete {}", dir.display()), e));
        }
        _ => {}
      }
      tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| CacheError::io(format!("Failed to create {}", dir.display()), e))?;
    }
    Ok(())
  }

  /// Delete every entry last modified more than `max_age` ago.
  pub async fn evict_older_than(&self, max_age: Duration) -> Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0usize;

    for dir in self.dirs() {
      let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => continue,
        Err(e) => {
          return Err(CacheError::io(format!("Failed to list {}", dir.display()), e));
        }
      };

      while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CacheError::io(format!("Failed to list {}", dir.display()), e))?
      {
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
          Ok(modified) => modified,
          Err(e) => {
            debug!(path = %entry.path().display(), error = %e, "skipping entry without mtime");
            continue;
          }
        };

        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > max_age {
          let path = entry.path();
          remove_if_exists(&path)
            .map_err(|e| CacheError::io(format!("Failed to delete {}", path.display()), e))?;
          removed += 1;
        }
      }
    }

    Ok(removed)
  }

  fn dirs(&self) -> [&PathBuf; 2] {
    [&self.full_dir, &self.thumbnail_dir]
  }
}
