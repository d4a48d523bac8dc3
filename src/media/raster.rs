//! Decoded images and thumbnail derivation.

use image::{DynamicImage, GenericImageView, ImageFormat};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use crate::error::{CacheError, Result};

/// A decoded image shared between the memory tier and callers.
///
/// Cloning is cheap; every clone points at the same pixels.
#[derive(Clone)]
pub struct CachedImage {
  pixels: Arc<DynamicImage>,
}

impl CachedImage {
  pub fn new(image: DynamicImage) -> Self {
    Self {
      pixels: Arc::new(image),
    }
  }

  /// Decode encoded bytes (PNG, JPEG).
  pub fn decode(bytes: &[u8]) -> Result<Self> {
    image::load_from_memory(bytes)
      .map(Self::new)
      .map_err(|e| CacheError::Decode(format!("Failed to decode image: {}", e)))
  }

  pub fn width(&self) -> u32 {
    self.pixels.width()
  }

  pub fn height(&self) -> u32 {
    self.pixels.height()
  }

  /// Approximate resident size: four bytes per pixel.
  pub fn cost(&self) -> u64 {
    u64::from(self.width()) * u64::from(self.height()) * 4
  }

  pub fn image(&self) -> &DynamicImage {
    &self.pixels
  }

  /// Whether both handles share the same decoded pixels.
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.pixels, &other.pixels)
  }
}

impl fmt::Debug for CachedImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CachedImage")
      .field("width", &self.width())
      .field("height", &self.height())
      .finish()
  }
}

/// Downscale full-image bytes so the longest edge fits `max_dimension`.
///
/// Never upscales. Returns the decoded thumbnail and its PNG encoding for the
/// thumbnail directory.
pub fn derive_thumbnail(full: &[u8], max_dimension: u32) -> Result<(CachedImage, Vec<u8>)> {
  let source = image::load_from_memory(full)
    .map_err(|e| CacheError::Decode(format!("Failed to decode image: {}", e)))?;

  let (width, height) = source.dimensions();
  let max_dimension = max_dimension.max(1);
  let thumbnail = if width > max_dimension || height > max_dimension {
    source.thumbnail(max_dimension, max_dimension)
  } else {
    source
  };

  let mut out = Cursor::new(Vec::new());
  thumbnail
    .write_to(&mut out, ImageFormat::Png)
    .map_err(|e| CacheError::Decode(format!("Failed to encode thumbnail: {}", e)))?;

  Ok((CachedImage::new(thumbnail), out.into_inner()))
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use image::{Rgba, RgbaImage};

  /// Solid-colour PNG of the given size.
  pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([200, 40, 90, 255]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
      .write_to(&mut out, ImageFormat::Png)
      .unwrap();
    out.into_inner()
  }

  #[test]
  fn test_decode_reports_cost() {
    let image = CachedImage::decode(&png(40, 25)).unwrap();
    assert_eq!((image.width(), image.height()), (40, 25));
    assert_eq!(image.cost(), 40 * 25 * 4);
  }

  #[test]
  fn test_decode_rejects_garbage() {
    let err = CachedImage::decode(b"definitely not an image").unwrap_err();
    assert!(err.is_decode());
  }

  #[test]
  fn test_thumbnail_fits_and_keeps_aspect() {
    let (thumb, encoded) = derive_thumbnail(&png(400, 200), 100).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (100, 50));

    let reread = CachedImage::decode(&encoded).unwrap();
    assert_eq!((reread.width(), reread.height()), (100, 50));
  }

  #[test]
  fn test_thumbnail_never_upscales() {
    let (thumb, _) = derive_thumbnail(&png(30, 20), 100).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (30, 20));
  }

  #[test]
  fn test_clones_share_pixels() {
    let a = CachedImage::decode(&png(2, 2)).unwrap();
    let b = a.clone();
    let c = CachedImage::decode(&png(2, 2)).unwrap();
    assert!(a.ptr_eq(&b));
    assert!(!a.ptr_eq(&c));
  }
}
