//! Generic entity cache for offline-first collections.
//!
//! This module provides a feature-agnostic mirror that:
//! - Persists any serde entity collection as one JSON snapshot per key
//! - Rewrites backend timestamps into JSON-safe tagged records and back
//! - Tolerates records that no longer decode after schema changes
//! - Tracks when each collection was last written for staleness checks

mod entity;
mod layer;
mod sanitize;
mod storage;
mod traits;

pub use entity::EntityCache;
pub use layer::{FeedMirror, FeedSource};
pub use sanitize::{desanitize, sanitize, Primitive, SanitizedValue, Timestamp, TIMESTAMP_KIND};
pub use storage::{FreshnessRecord, FreshnessStore, MemoryFreshness, SqliteFreshness};
pub use traits::{CacheResult, CacheSource, Cacheable};
