//! Cache keys for media entries.

use sha2::{Digest, Sha256};
use std::fmt;

/// Which representation of a URL is cached.
///
/// Full and thumbnail entries for the same URL are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
  Full,
  Thumbnail,
}

impl Variant {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Full => "full",
      Self::Thumbnail => "thumbnail",
    }
  }
}

impl fmt::Display for Variant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaKey {
  pub url: String,
  pub variant: Variant,
}

impl MediaKey {
  pub fn new(url: impl Into<String>, variant: Variant) -> Self {
    Self {
      url: url.into(),
      variant,
    }
  }

  /// Stable, fixed-length file name for this key.
  pub fn file_name(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.variant.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for MediaKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.url, self.variant)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_file_name_is_stable_hex() {
    let key = MediaKey::new("https://x/img.jpg", Variant::Full);
    let name = key.file_name();
    assert_eq!(name.len(), 64);
    assert!(name.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_eq!(name, MediaKey::new("https://x/img.jpg", Variant::Full).file_name());
  }

  #[test]
  fn test_variants_hash_apart() {
    let full = MediaKey::new("https://x/img.jpg", Variant::Full);
    let thumb = MediaKey::new("https://x/img.jpg", Variant::Thumbnail);
    assert_ne!(full, thumb);
    assert_ne!(full.file_name(), thumb.file_name());
  }
}
