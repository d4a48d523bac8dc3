//! Image cache for feed media.
//!
//! Lookups go memory, then disk, then network. Concurrent requests for the
//! same `(url, variant)` share a single fetch, and thumbnails are derived
//! locally from the full image.

mod bandwidth;
mod cache;
mod disk;
mod fetch;
mod key;
mod memory;
mod raster;

pub use bandwidth::{BandwidthGate, FixedBandwidth};
pub use cache::{MediaCache, MediaCacheStats, PreloadSummary};
pub use disk::{IMAGE_DIR, THUMBNAIL_DIR};
pub use fetch::{FetchBytes, HttpFetcher};
pub use key::{MediaKey, Variant};
pub use raster::CachedImage;
