//! Freshness-stamp storage for cached collections.
//!
//! Snapshot bodies live in one JSON file per collection; this store only
//! remembers when each collection was last written and how many records it
//! held.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{CacheError, Result};

/// Freshness metadata for one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessRecord {
  /// When the last successful save completed
  pub saved_at: DateTime<Utc>,
  /// Number of records in that save
  pub record_count: usize,
}

/// Trait for freshness-stamp backends.
pub trait FreshnessStore: Send + Sync {
  /// Stamp a collection as written at `saved_at`.
  fn record(&self, key: &str, saved_at: DateTime<Utc>, record_count: usize) -> Result<()>;

  /// Look up the stamp for a collection.
  fn get(&self, key: &str) -> Result<Option<FreshnessRecord>>;

  /// Forget a single collection.
  fn remove(&self, key: &str) -> Result<()>;

  /// Forget every collection.
  fn clear(&self) -> Result<()>;
}

/// Freshness store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryFreshness {
  stamps: Mutex<HashMap<String, FreshnessRecord>>,
}

impl MemoryFreshness {
  pub fn new() -> Self {
    Self::default()
  }

  fn stamps(&self) -> MutexGuard<'_, HashMap<String, FreshnessRecord>> {
    self.stamps.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl FreshnessStore for MemoryFreshness {
  fn record(&self, key: &str, saved_at: DateTime<Utc>, record_count: usize) -> Result<()> {
    self.stamps().insert(
      key.to_string(),
      FreshnessRecord {
        saved_at,
        record_count,
      },
    );
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<FreshnessRecord>> {
    Ok(self.stamps().get(key).copied())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.stamps().remove(key);
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.stamps().clear();
    Ok(())
  }
}

/// SQLite-based freshness store.
pub struct SqliteFreshness {
  conn: Mutex<Connection>,
}

impl SqliteFreshness {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::io("Failed to create freshness directory", e))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::io(
        format!("Failed to open freshness database at {}", path.display()),
        e,
      )
    })?;

    Self::with_connection(conn)
  }

  /// Open a private, memory-backed database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| CacheError::io("Failed to open in-memory freshness database", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn conn(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run database migrations for the freshness table.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()
      .execute_batch(FRESHNESS_SCHEMA)
      .map_err(|e| CacheError::io("Failed to run freshness migrations", e))
  }
}

/// Schema for the freshness table.
const FRESHNESS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collection_freshness (
    cache_key TEXT PRIMARY KEY,
    saved_at TEXT NOT NULL,
    record_count INTEGER NOT NULL
);
"#;

impl FreshnessStore for SqliteFreshness {
  fn record(&self, key: &str, saved_at: DateTime<Utc>, record_count: usize) -> Result<()> {
    let saved_at = saved_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let record_count = i64::try_from(record_count).unwrap_or(i64::MAX);

    self
      .conn()
      .execute(
        "INSERT OR REPLACE INTO collection_freshness (cache_key, saved_at, record_count)
         VALUES (?, ?, ?)",
        params![key, saved_at, record_count],
      )
      .map_err(|e| CacheError::io(format!("Failed to stamp collection {}", key), e))?;

    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<FreshnessRecord>> {
    let conn = self.conn();

    let row: Option<(String, i64)> = conn
      .query_row(
        "SELECT saved_at, record_count FROM collection_freshness WHERE cache_key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| CacheError::io(format!("Failed to read stamp for {}", key), e))?;

    match row {
      Some((saved_at, record_count)) => Ok(Some(FreshnessRecord {
        saved_at: parse_datetime(&saved_at)?,
        record_count: usize::try_from(record_count).unwrap_or(0),
      })),
      None => Ok(None),
    }
  }

  fn remove(&self, key: &str) -> Result<()> {
    self
      .conn()
      .execute(
        "DELETE FROM collection_freshness WHERE cache_key = ?",
        params![key],
      )
      .map_err(|e| CacheError::io(format!("Failed to remove stamp for {}", key), e))?;
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self
      .conn()
      .execute("DELETE FROM collection_freshness", [])
      .map_err(|e| CacheError::io("Failed to clear freshness stamps", e))?;
    Ok(())
  }
}

/// Parse a stored RFC 3339 stamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| CacheError::Decode(format!("Failed to parse datetime '{}': {}", s, e)))
}
