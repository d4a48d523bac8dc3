use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "hearth";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HearthConfig {
  #[serde(default)]
  pub media: MediaConfig,
  #[serde(default)]
  pub entities: EntityConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
  /// Root holding `ImageCache/` and `ThumbnailCache/` (defaults to the platform cache dir)
  pub cache_root: Option<PathBuf>,
  /// Maximum number of decoded images kept in memory
  pub memory_count_limit: usize,
  /// Maximum total decoded size (bytes) kept in memory
  pub memory_cost_limit: u64,
  /// Longest edge of a derived thumbnail, in pixels
  pub thumbnail_max_dimension: u32,
  /// Items loaded concurrently per preload batch (clamped to 3..=5)
  pub preload_batch_size: usize,
  /// Thumbnails preloaded when downloading large media is expensive
  pub preload_thumbnail_limit: usize,
  /// Age after which disk entries are swept
  pub disk_max_age_days: u64,
  /// Request timeout for the HTTP fetcher
  pub fetch_timeout_secs: u64,
}

impl Default for MediaConfig {
  fn default() -> Self {
    Self {
      cache_root: None,
      memory_count_limit: 200,
      memory_cost_limit: 100 * 1024 * 1024,
      thumbnail_max_dimension: 300,
      preload_batch_size: 4,
      preload_thumbnail_limit: 20,
      disk_max_age_days: 30,
      fetch_timeout_secs: 30,
    }
  }
}

impl MediaConfig {
  pub fn cache_root(&self) -> Result<PathBuf> {
    if let Ok(root) = std::env::var("HEARTH_CACHE_ROOT") {
      return Ok(PathBuf::from(root));
    }
    match &self.cache_root {
      Some(root) => Ok(root.clone()),
      None => {
        let cache_dir = dirs::cache_dir()
          .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
          .ok_or_else(|| eyre!("Could not determine cache directory"))?;
        Ok(cache_dir.join(APP_DIR))
      }
    }
  }

  pub fn preload_batch_size(&self) -> usize {
    self.preload_batch_size.clamp(3, 5)
  }

  pub fn disk_max_age(&self) -> Duration {
    Duration::from_secs(self.disk_max_age_days * 24 * 60 * 60)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessBackend {
  /// Stamps persisted in `<offline_root>/freshness.db`
  #[default]
  Sqlite,
  /// Stamps kept for the lifetime of the process
  Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
  /// Directory holding one `<collection>.json` per collection (defaults to the platform data dir)
  pub offline_root: Option<PathBuf>,
  pub freshness: FreshnessBackend,
  /// Age after which a cold-start snapshot is reported as stale
  pub stale_after_secs: u64,
}

impl Default for EntityConfig {
  fn default() -> Self {
    Self {
      offline_root: None,
      freshness: FreshnessBackend::default(),
      stale_after_secs: 300,
    }
  }
}

impl EntityConfig {
  pub fn offline_root(&self) -> Result<PathBuf> {
    if let Ok(root) = std::env::var("HEARTH_OFFLINE_ROOT") {
      return Ok(PathBuf::from(root));
    }
    match &self.offline_root {
      Some(root) => Ok(root.clone()),
      None => {
        let data_dir = dirs::data_dir()
          .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
          .ok_or_else(|| eyre!("Could not determine data directory"))?;
        Ok(data_dir.join(APP_DIR).join("offline"))
      }
    }
  }

  pub fn stale_after(&self) -> Duration {
    Duration::from_secs(self.stale_after_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when `HEARTH_LOG` is unset
  pub filter: String,
  /// Write daily-rolled log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
      directory: None,
    }
  }
}

impl HearthConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hearth.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hearth/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("hearth.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub(crate) fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_config_keeps_defaults() {
    let config = HearthConfig::parse(
      r#"
media:
  thumbnail_max_dimension: 128
  preload_batch_size: 9
entities:
  freshness: memory
"#,
    )
    .unwrap();

    assert_eq!(config.media.thumbnail_max_dimension, 128);
    assert_eq!(config.media.memory_count_limit, 200);
    assert_eq!(config.media.preload_batch_size(), 5);
    assert_eq!(config.media.disk_max_age(), Duration::from_secs(30 * 86_400));
    assert_eq!(config.entities.freshness, FreshnessBackend::Memory);
    assert_eq!(config.entities.stale_after_secs, 300);
    assert_eq!(config.logging.filter, "info");
  }

  #[test]
  fn test_empty_file_is_default() {
    let config = HearthConfig::parse("  \n").unwrap();
    assert_eq!(config.entities.freshness, FreshnessBackend::Sqlite);
    assert_eq!(config.media.preload_batch_size(), 4);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = HearthConfig::load(Some(Path::new("/nonexistent/hearth.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hearth.yaml");
    std::fs::write(&path, "logging:\n  filter: debug\n").unwrap();

    let config = HearthConfig::load(Some(&path)).unwrap();
    assert_eq!(config.logging.filter, "debug");
  }
}
