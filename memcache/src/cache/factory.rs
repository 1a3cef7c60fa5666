//! Ready-made caches for the two tiers of the image pipeline.

use super::instrumented::InstrumentedMemoryCache;
use super::params::ParamsSupplier;
use super::trim::{BitmapMemoryCacheTrimStrategy, NativeMemoryCacheTrimStrategy};
use super::{CountingMemoryCache, MemoryCache};
use crate::cache_key::{BitmapMemoryCacheKey, SimpleCacheKey};
use crate::error::ListenerResult;
use crate::image::{DecodedImage, EncodedImage};
use crate::listener::{CacheEventListener, EvictionReason, ImageCacheStatsTracker, MemoryCacheTracker};
use crate::trimmable::MemoryTrimmableRegistry;

use std::sync::Arc;

/// A cache of decoded images, sized by pixel bytes, that drops everything
/// evictable on system memory pressure. Registered with `registry`; removals
/// are reported to `stats_tracker` as bitmap-cache evictions.
pub fn bitmap_counting_memory_cache(
  params_supplier: ParamsSupplier,
  stats_tracker: Arc<dyn ImageCacheStatsTracker>,
  registry: &dyn MemoryTrimmableRegistry,
) -> CountingMemoryCache<BitmapMemoryCacheKey, DecodedImage> {
  let cache = CountingMemoryCache::builder()
    .params_supplier(move || params_supplier())
    .value_descriptor(DecodedImage::size_in_bytes)
    .trim_strategy(BitmapMemoryCacheTrimStrategy)
    .event_listener(BitmapCacheTracker(stats_tracker))
    .build();
  registry.register_memory_trimmable(cache.trim_handle());
  cache
}

/// A cache of encoded bytes that ignores heap pressure. Registered with
/// `registry`.
pub fn encoded_counting_memory_cache(
  params_supplier: ParamsSupplier,
  stats_tracker: Arc<dyn ImageCacheStatsTracker>,
  registry: &dyn MemoryTrimmableRegistry,
) -> CountingMemoryCache<SimpleCacheKey, EncodedImage> {
  let cache = CountingMemoryCache::builder()
    .params_supplier(move || params_supplier())
    .value_descriptor(EncodedImage::size_in_bytes)
    .trim_strategy(NativeMemoryCacheTrimStrategy)
    .event_listener(EncodedCacheTracker(stats_tracker))
    .build();
  registry.register_memory_trimmable(cache.trim_handle());
  cache
}

struct BitmapCacheTracker(Arc<dyn ImageCacheStatsTracker>);

impl MemoryCacheTracker<BitmapMemoryCacheKey> for BitmapCacheTracker {
  fn on_cache_hit(&self, key: &BitmapMemoryCacheKey) -> ListenerResult {
    self.0.on_bitmap_cache_hit(key)
  }

  fn on_cache_miss(&self, key: &BitmapMemoryCacheKey) -> ListenerResult {
    self.0.on_bitmap_cache_miss(key)
  }

  fn on_cache_put(&self, key: &BitmapMemoryCacheKey) -> ListenerResult {
    self.0.on_bitmap_cache_put(key)
  }
}

impl CacheEventListener<BitmapMemoryCacheKey> for BitmapCacheTracker {
  fn on_evict(&self, key: &BitmapMemoryCacheKey, _size_in_bytes: u64, reason: EvictionReason) -> ListenerResult {
    self.0.on_bitmap_cache_eviction(key, reason)
  }
}

struct EncodedCacheTracker(Arc<dyn ImageCacheStatsTracker>);

impl MemoryCacheTracker<SimpleCacheKey> for EncodedCacheTracker {
  fn on_cache_hit(&self, key: &SimpleCacheKey) -> ListenerResult {
    self.0.on_memory_cache_hit(key)
  }

  fn on_cache_miss(&self, key: &SimpleCacheKey) -> ListenerResult {
    self.0.on_memory_cache_miss(key)
  }

  fn on_cache_put(&self, key: &SimpleCacheKey) -> ListenerResult {
    self.0.on_memory_cache_put(key)
  }
}

impl CacheEventListener<SimpleCacheKey> for EncodedCacheTracker {
  fn on_evict(&self, key: &SimpleCacheKey, _size_in_bytes: u64, reason: EvictionReason) -> ListenerResult {
    self.0.on_memory_cache_eviction(key, reason)
  }
}

/// Wraps a bitmap cache so its traffic is reported as bitmap-cache stats.
pub fn instrumented_bitmap_memory_cache(
  cache: Arc<dyn MemoryCache<BitmapMemoryCacheKey, DecodedImage>>,
  stats_tracker: Arc<dyn ImageCacheStatsTracker>,
) -> InstrumentedMemoryCache<BitmapMemoryCacheKey, DecodedImage> {
  InstrumentedMemoryCache::new(cache, Arc::new(BitmapCacheTracker(stats_tracker)))
}

/// Wraps an encoded cache so its traffic is reported as memory-cache stats.
pub fn instrumented_encoded_memory_cache(
  cache: Arc<dyn MemoryCache<SimpleCacheKey, EncodedImage>>,
  stats_tracker: Arc<dyn ImageCacheStatsTracker>,
) -> InstrumentedMemoryCache<SimpleCacheKey, EncodedImage> {
  InstrumentedMemoryCache::new(cache, Arc::new(EncodedCacheTracker(stats_tracker)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::params::{fixed_params, MemoryCacheParams};
  use crate::cache::trim::MemoryTrimType;
  use crate::reference::CloseableRef;
  use crate::producers::request::RotationOptions;
  use crate::trimmable::TrimRegistry;
  use crate::cache_key::CacheKey;
  use parking_lot::Mutex;

  fn no_stats() -> Arc<dyn ImageCacheStatsTracker> {
    Arc::new(crate::listener::NoOpImageCacheStatsTracker)
  }

  #[derive(Default)]
  struct Evictions(Mutex<Vec<(String, EvictionReason)>>);

  impl ImageCacheStatsTracker for Evictions {
    fn on_bitmap_cache_eviction(&self, key: &dyn CacheKey, reason: EvictionReason) -> ListenerResult {
      self.0.lock().push((key.uri().to_string(), reason));
      Ok(())
    }
  }

  #[test]
  fn bitmap_cache_registers_and_trims() {
    let registry = TrimRegistry::new();
    let cache = bitmap_counting_memory_cache(fixed_params(MemoryCacheParams::unbounded()), no_stats(), &registry);
    assert_eq!(registry.len(), 1);

    let key = BitmapMemoryCacheKey::new("u", None, RotationOptions::Auto);
    let image = CloseableRef::new(DecodedImage::new(1, 1, vec![0u8; 4]));
    drop(cache.cache(key.clone(), &image).unwrap());
    assert_eq!(cache.size_in_bytes(), 4);

    registry.trim(MemoryTrimType::OnAppBackgrounded);
    assert!(!cache.contains_key(&key));
  }

  #[test]
  fn encoded_cache_ignores_heap_pressure() {
    let registry = TrimRegistry::new();
    let cache = encoded_counting_memory_cache(fixed_params(MemoryCacheParams::unbounded()), no_stats(), &registry);

    let key = SimpleCacheKey::new("u");
    let image = CloseableRef::new(EncodedImage::new(vec![1u8, 2, 3]));
    drop(cache.cache(key.clone(), &image).unwrap());

    registry.trim(MemoryTrimType::OnCloseToHeapLimit);
    assert!(cache.contains_key(&key));
    registry.trim(MemoryTrimType::OnSystemLowMemoryWhileAppInForeground);
    assert!(!cache.contains_key(&key));
  }

  #[test]
  fn dropped_cache_is_not_kept_alive_by_registry() {
    let registry = TrimRegistry::new();
    let cache = encoded_counting_memory_cache(fixed_params(MemoryCacheParams::unbounded()), no_stats(), &registry);
    let survivor = bitmap_counting_memory_cache(fixed_params(MemoryCacheParams::unbounded()), no_stats(), &registry);
    assert_eq!(registry.len(), 2);

    drop(cache);
    registry.trim(MemoryTrimType::OnAppBackgrounded);
    assert_eq!(registry.len(), 1, "the dropped cache's handle is pruned");
    drop(survivor);
    registry.trim(MemoryTrimType::OnAppBackgrounded);
    assert!(registry.is_empty());
  }

  #[test]
  fn bitmap_evictions_reach_stats_tracker() {
    let registry = TrimRegistry::new();
    let tracker = Arc::new(Evictions::default());
    let stats: Arc<dyn ImageCacheStatsTracker> = tracker.clone();
    let cache = bitmap_counting_memory_cache(fixed_params(MemoryCacheParams::unbounded()), stats, &registry);

    let key = BitmapMemoryCacheKey::new("u", None, RotationOptions::Auto);
    drop(cache.cache(key, &CloseableRef::new(DecodedImage::new(1, 1, vec![0u8; 4]))).unwrap());
    cache.trim(MemoryTrimType::OnAppBackgrounded);

    assert_eq!(*tracker.0.lock(), vec![("u".to_string(), EvictionReason::Trimmed)]);
    assert_eq!(cache.stats().released, 1);
  }
}
