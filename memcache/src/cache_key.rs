//! Cache keys used by the image pipeline.
//!
//! [`CountingMemoryCache`](crate::cache::CountingMemoryCache) itself is generic
//! over any `Eq + Hash + Clone` key; the types here are the ones the pipeline
//! derives from an [`ImageRequest`].

use crate::producers::request::{ImageRequest, ResizeOptions, RotationOptions};

use std::fmt;
use std::sync::Arc;

/// A fingerprint of a requested resource.
pub trait CacheKey: fmt::Debug + Send + Sync {
  /// The source URI the key was derived from.
  fn uri(&self) -> &str;

  /// Returns `true` if this key refers to `uri`.
  fn contains_uri(&self, uri: &str) -> bool {
    self.uri() == uri
  }
}

/// A key made of the source URI only. Used for encoded bytes, which do not
/// depend on decode options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimpleCacheKey {
  uri: Arc<str>,
}

impl SimpleCacheKey {
  pub fn new(uri: impl Into<Arc<str>>) -> Self {
    Self { uri: uri.into() }
  }
}

impl CacheKey for SimpleCacheKey {
  fn uri(&self) -> &str {
    &self.uri
  }
}

impl fmt::Display for SimpleCacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.uri)
  }
}

/// A key for decoded images: the same source decoded with different options
/// yields different entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitmapMemoryCacheKey {
  source: SimpleCacheKey,
  resize_options: Option<ResizeOptions>,
  rotation_options: RotationOptions,
}

impl BitmapMemoryCacheKey {
  pub fn new(
    uri: impl Into<Arc<str>>,
    resize_options: Option<ResizeOptions>,
    rotation_options: RotationOptions,
  ) -> Self {
    Self {
      source: SimpleCacheKey::new(uri),
      resize_options,
      rotation_options,
    }
  }

  pub fn resize_options(&self) -> Option<ResizeOptions> {
    self.resize_options
  }

  pub fn rotation_options(&self) -> RotationOptions {
    self.rotation_options
  }
}

impl CacheKey for BitmapMemoryCacheKey {
  fn uri(&self) -> &str {
    self.source.uri()
  }
}

/// Derives cache keys from requests.
pub trait CacheKeyFactory: Send + Sync {
  fn bitmap_cache_key(&self, request: &ImageRequest) -> BitmapMemoryCacheKey;
  fn encoded_cache_key(&self, request: &ImageRequest) -> SimpleCacheKey;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCacheKeyFactory;

impl CacheKeyFactory for DefaultCacheKeyFactory {
  fn bitmap_cache_key(&self, request: &ImageRequest) -> BitmapMemoryCacheKey {
    BitmapMemoryCacheKey::new(
      request.source_uri(),
      request.resize_options(),
      request.rotation_options(),
    )
  }

  fn encoded_cache_key(&self, request: &ImageRequest) -> SimpleCacheKey {
    SimpleCacheKey::new(request.source_uri())
  }
}
