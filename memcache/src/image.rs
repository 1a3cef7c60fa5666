//! The values the pipeline caches.

use std::fmt;
use std::sync::Arc;

/// Compressed image bytes as fetched from the network.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedImage {
  bytes: Arc<[u8]>,
}

impl EncodedImage {
  pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
    Self { bytes: bytes.into() }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn size_in_bytes(&self) -> u64 {
    self.bytes.len() as u64
  }
}

impl fmt::Debug for EncodedImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EncodedImage")
      .field("len", &self.bytes.len())
      .finish()
  }
}

/// A decoded bitmap.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
  width: u32,
  height: u32,
  pixels: Arc<[u8]>,
  is_partial: bool,
}

impl DecodedImage {
  pub fn new(width: u32, height: u32, pixels: impl Into<Arc<[u8]>>) -> Self {
    Self {
      width,
      height,
      pixels: pixels.into(),
      is_partial: false,
    }
  }

  /// Marks the image as decoded from incomplete bytes.
  pub fn partial(mut self) -> Self {
    self.is_partial = true;
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn pixels(&self) -> &[u8] {
    &self.pixels
  }

  pub fn is_partial(&self) -> bool {
    self.is_partial
  }

  pub fn size_in_bytes(&self) -> u64 {
    self.pixels.len() as u64
  }
}

impl fmt::Debug for DecodedImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DecodedImage")
      .field("width", &self.width)
      .field("height", &self.height)
      .field("size_in_bytes", &self.pixels.len())
      .field("is_partial", &self.is_partial)
      .finish()
  }
}
