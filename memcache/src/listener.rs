//! Passive observability hooks.
//!
//! Every hook returns a [`ListenerResult`]. Errors are logged at the call site
//! and never change the outcome of the operation that triggered them, nor stop
//! delivery to the remaining listeners of a fan-out.

use crate::cache_key::CacheKey;
use crate::error::ListenerResult;

use std::fmt;
use std::sync::Arc;

/// Describes why an entry left a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
  /// Dropped to bring the cache back under its configured limits.
  Capacity,
  /// Dropped in response to a memory-pressure trim.
  Trimmed,
  /// Removed through `remove_all` or `clear`.
  Invalidated,
  /// Superseded by a newer value cached under the same key.
  Replaced,
}

impl fmt::Display for EvictionReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EvictionReason::Capacity => write!(f, "evicted due to capacity"),
      EvictionReason::Trimmed => write!(f, "trimmed under memory pressure"),
      EvictionReason::Invalidated => write!(f, "manually invalidated"),
      EvictionReason::Replaced => write!(f, "replaced by a newer value"),
    }
  }
}

/// Receives the lookup and lifecycle events of one counting cache.
///
/// Called after the cache lock has been released.
pub trait CacheEventListener<K>: Send + Sync {
  fn on_hit(&self, _key: &K) -> ListenerResult {
    Ok(())
  }

  fn on_miss(&self, _key: &K) -> ListenerResult {
    Ok(())
  }

  fn on_put(&self, _key: &K, _size_in_bytes: u64) -> ListenerResult {
    Ok(())
  }

  /// An entry was removed from the cache index. Exclusive entries are
  /// released before this is called; entries still held by clients
  /// (replaced or invalidated while in use) are released later, when their
  /// last client closes.
  fn on_evict(&self, _key: &K, _size_in_bytes: u64, _reason: EvictionReason) -> ListenerResult {
    Ok(())
  }
}

/// The listener a cache uses when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCacheEventListener;

impl<K> CacheEventListener<K> for NoOpCacheEventListener {}

/// Receives hit/miss/put events from an
/// [`InstrumentedMemoryCache`](crate::cache::instrumented::InstrumentedMemoryCache).
pub trait MemoryCacheTracker<K>: Send + Sync {
  fn on_cache_hit(&self, key: &K) -> ListenerResult;
  fn on_cache_miss(&self, key: &K) -> ListenerResult;
  fn on_cache_put(&self, key: &K) -> ListenerResult;
}

/// Pipeline-wide cache statistics, split between the decoded ("bitmap") and
/// encoded memory caches.
pub trait ImageCacheStatsTracker: Send + Sync {
  fn on_bitmap_cache_put(&self, _key: &dyn CacheKey) -> ListenerResult {
    Ok(())
  }

  fn on_bitmap_cache_hit(&self, _key: &dyn CacheKey) -> ListenerResult {
    Ok(())
  }

  fn on_bitmap_cache_miss(&self, _key: &dyn CacheKey) -> ListenerResult {
    Ok(())
  }

  fn on_memory_cache_put(&self, _key: &dyn CacheKey) -> ListenerResult {
    Ok(())
  }

  fn on_memory_cache_hit(&self, _key: &dyn CacheKey) -> ListenerResult {
    Ok(())
  }

  fn on_memory_cache_miss(&self, _key: &dyn CacheKey) -> ListenerResult {
    Ok(())
  }

  fn on_bitmap_cache_eviction(&self, _key: &dyn CacheKey, _reason: EvictionReason) -> ListenerResult {
    Ok(())
  }

  fn on_memory_cache_eviction(&self, _key: &dyn CacheKey, _reason: EvictionReason) -> ListenerResult {
    Ok(())
  }
}

/// The stats tracker a pipeline uses when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpImageCacheStatsTracker;

impl ImageCacheStatsTracker for NoOpImageCacheStatsTracker {}

/// Fans every stats event out to a list of trackers.
#[derive(Default, Clone)]
pub struct ForwardingStatsTracker {
  trackers: Vec<Arc<dyn ImageCacheStatsTracker>>,
}

impl ForwardingStatsTracker {
  pub fn new(trackers: Vec<Arc<dyn ImageCacheStatsTracker>>) -> Self {
    Self { trackers }
  }

  pub fn add_tracker(&mut self, tracker: Arc<dyn ImageCacheStatsTracker>) {
    self.trackers.push(tracker);
  }
}

impl fmt::Debug for ForwardingStatsTracker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ForwardingStatsTracker")
      .field("trackers", &self.trackers.len())
      .finish()
  }
}

impl ImageCacheStatsTracker for ForwardingStatsTracker {
  fn on_bitmap_cache_put(&self, key: &dyn CacheKey) -> ListenerResult {
    forward_each(&self.trackers, "on_bitmap_cache_put", |t| t.on_bitmap_cache_put(key))
  }

  fn on_bitmap_cache_hit(&self, key: &dyn CacheKey) -> ListenerResult {
    forward_each(&self.trackers, "on_bitmap_cache_hit", |t| t.on_bitmap_cache_hit(key))
  }

  fn on_bitmap_cache_miss(&self, key: &dyn CacheKey) -> ListenerResult {
    forward_each(&self.trackers, "on_bitmap_cache_miss", |t| t.on_bitmap_cache_miss(key))
  }

  fn on_memory_cache_put(&self, key: &dyn CacheKey) -> ListenerResult {
    forward_each(&self.trackers, "on_memory_cache_put", |t| t.on_memory_cache_put(key))
  }

  fn on_memory_cache_hit(&self, key: &dyn CacheKey) -> ListenerResult {
    forward_each(&self.trackers, "on_memory_cache_hit", |t| t.on_memory_cache_hit(key))
  }

  fn on_memory_cache_miss(&self, key: &dyn CacheKey) -> ListenerResult {
    forward_each(&self.trackers, "on_memory_cache_miss", |t| t.on_memory_cache_miss(key))
  }

  fn on_bitmap_cache_eviction(&self, key: &dyn CacheKey, reason: EvictionReason) -> ListenerResult {
    forward_each(&self.trackers, "on_bitmap_cache_eviction", |t| {
      t.on_bitmap_cache_eviction(key, reason)
    })
  }

  fn on_memory_cache_eviction(&self, key: &dyn CacheKey, reason: EvictionReason) -> ListenerResult {
    forward_each(&self.trackers, "on_memory_cache_eviction", |t| {
      t.on_memory_cache_eviction(key, reason)
    })
  }
}

/// Logs a failed hook. The error goes no further.
#[inline]
pub(crate) fn report(hook: &'static str, result: ListenerResult) {
  if let Err(error) = result {
    tracing::warn!(hook, %error, "listener failed, continuing");
  }
}

/// Invokes `call` on every listener, logging each failure individually.
///
/// Always succeeds: a bad listener never punishes the others or the caller.
pub(crate) fn forward_each<L, F>(listeners: &[Arc<L>], hook: &'static str, mut call: F) -> ListenerResult
where
  L: ?Sized,
  F: FnMut(&L) -> ListenerResult,
{
  let mut failures = 0usize;
  for listener in listeners {
    if let Err(error) = call(&**listener) {
      failures += 1;
      tracing::warn!(hook, %error, "listener failed, continuing with the rest");
    }
  }
  if failures > 0 {
    tracing::debug!(hook, failures, total = listeners.len(), "fan-out finished with failures");
  }
  Ok(())
}
