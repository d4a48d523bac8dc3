//! Signal for whether large downloads are cheap right now.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait BandwidthGate: Send + Sync {
  /// True on unmetered, fast connections where aggressive preloading is fine.
  fn is_cheap_to_download_large_media(&self) -> bool;
}

/// Gate whose answer is set by the host (e.g. from a connectivity monitor).
#[derive(Debug, Default)]
pub struct FixedBandwidth {
  cheap: AtomicBool,
}

impl FixedBandwidth {
  pub fn new(cheap: bool) -> Self {
    Self {
      cheap: AtomicBool::new(cheap),
    }
  }

  pub fn set(&self, cheap: bool) {
    self.cheap.store(cheap, Ordering::Relaxed);
  }
}

impl BandwidthGate for FixedBandwidth {
  fn is_cheap_to_download_large_media(&self) -> bool {
    self.cheap.load(Ordering::Relaxed)
  }
}
