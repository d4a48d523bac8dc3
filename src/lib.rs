//! Offline-first cache layer for live-feed companion apps.
//!
//! Two caches share this crate:
//! - [`media::MediaCache`]: decoded images in memory, encoded bytes on disk,
//!   one network fetch per `(url, variant)` no matter how many callers ask
//! - [`cache::EntityCache`]: one JSON snapshot per entity collection, so a
//!   screen can paint its last known state before the live feed attaches

pub mod cache;
pub mod config;
pub mod error;
mod fs;
pub mod logging;
pub mod media;

pub use cache::{CacheResult, CacheSource, Cacheable, EntityCache, FeedMirror, FeedSource, Timestamp};
pub use config::HearthConfig;
pub use error::{CacheError, Result};
pub use media::{CachedImage, MediaCache, Variant};
