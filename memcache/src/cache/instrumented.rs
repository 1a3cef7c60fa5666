use super::trim::MemoryTrimType;
use super::MemoryCache;
use crate::error::ReferenceError;
use crate::listener::{report, MemoryCacheTracker};
use crate::reference::CloseableRef;
use crate::trimmable::MemoryTrimmable;

use std::fmt;
use std::sync::Arc;

/// A [`MemoryCache`] decorator that reports hits, misses and puts to a
/// [`MemoryCacheTracker`].
pub struct InstrumentedMemoryCache<K, V> {
  delegate: Arc<dyn MemoryCache<K, V>>,
  tracker: Arc<dyn MemoryCacheTracker<K>>,
}

impl<K, V> InstrumentedMemoryCache<K, V> {
  pub fn new(delegate: Arc<dyn MemoryCache<K, V>>, tracker: Arc<dyn MemoryCacheTracker<K>>) -> Self {
    Self { delegate, tracker }
  }
}

impl<K, V> fmt::Debug for InstrumentedMemoryCache<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InstrumentedMemoryCache")
      .field("count", &self.delegate.count())
      .finish_non_exhaustive()
  }
}

impl<K, V> MemoryTrimmable for InstrumentedMemoryCache<K, V> {
  fn trim(&self, trim_type: MemoryTrimType) {
    self.delegate.trim(trim_type)
  }
}

impl<K, V> MemoryCache<K, V> for InstrumentedMemoryCache<K, V> {
  fn get(&self, key: &K) -> Option<CloseableRef<V>> {
    let result = self.delegate.get(key);
    if result.is_some() {
      report("on_cache_hit", self.tracker.on_cache_hit(key));
    } else {
      report("on_cache_miss", self.tracker.on_cache_miss(key));
    }
    result
  }

  fn probe(&self, key: &K) {
    self.delegate.probe(key)
  }

  fn cache(&self, key: K, value: &CloseableRef<V>) -> Result<Option<CloseableRef<V>>, ReferenceError> {
    report("on_cache_put", self.tracker.on_cache_put(&key));
    self.delegate.cache(key, value)
  }

  fn remove_all(&self, predicate: &dyn Fn(&K) -> bool) -> usize {
    self.delegate.remove_all(predicate)
  }

  fn contains(&self, predicate: &dyn Fn(&K) -> bool) -> bool {
    self.delegate.contains(predicate)
  }

  fn contains_key(&self, key: &K) -> bool {
    self.delegate.contains_key(key)
  }

  fn count(&self) -> usize {
    self.delegate.count()
  }

  fn size_in_bytes(&self) -> u64 {
    self.delegate.size_in_bytes()
  }
}
