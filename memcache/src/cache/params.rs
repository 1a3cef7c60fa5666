use std::fmt;
use std::sync::Arc;

/// Size and count limits applied by a [`CountingMemoryCache`](super::CountingMemoryCache).
///
/// The eviction queue is the set of exclusively owned entries, i.e. the ones
/// no client currently holds and which may therefore be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MemoryCacheParams {
  /// The maximum total size in bytes of all cached entries.
  pub max_cache_size: u64,
  /// The maximum number of cached entries.
  pub max_cache_entries: usize,
  /// The maximum total size in bytes of exclusively owned entries.
  pub max_eviction_queue_size: u64,
  /// The maximum number of exclusively owned entries.
  pub max_eviction_queue_entries: usize,
  /// The largest single entry the cache will accept.
  pub max_cache_entry_size: u64,
}

impl MemoryCacheParams {
  pub const fn new(
    max_cache_size: u64,
    max_cache_entries: usize,
    max_eviction_queue_size: u64,
    max_eviction_queue_entries: usize,
    max_cache_entry_size: u64,
  ) -> Self {
    Self {
      max_cache_size,
      max_cache_entries,
      max_eviction_queue_size,
      max_eviction_queue_entries,
      max_cache_entry_size,
    }
  }

  /// Limits that never evict anything on their own.
  pub const fn unbounded() -> Self {
    Self::new(u64::MAX, usize::MAX, u64::MAX, usize::MAX, u64::MAX)
  }

  /// A total-size and entry-count budget, with the eviction queue allowed to
  /// fill the whole budget and no per-entry limit beyond it.
  pub const fn with_budget(max_cache_size: u64, max_cache_entries: usize) -> Self {
    Self::new(
      max_cache_size,
      max_cache_entries,
      max_cache_size,
      max_cache_entries,
      max_cache_size,
    )
  }
}

impl Default for MemoryCacheParams {
  /// 64 MiB across at most 256 entries.
  fn default() -> Self {
    Self::with_budget(64 * 1024 * 1024, 256)
  }
}

/// Supplies the current cache limits. May return different values over time.
pub type ParamsSupplier = Arc<dyn Fn() -> MemoryCacheParams + Send + Sync>;

/// Wraps fixed limits in a supplier.
pub fn fixed_params(params: MemoryCacheParams) -> ParamsSupplier {
  Arc::new(move || params)
}

impl fmt::Display for MemoryCacheParams {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "size<={} entries<={} queue_size<={} queue_entries<={} entry_size<={}",
      self.max_cache_size,
      self.max_cache_entries,
      self.max_eviction_queue_size,
      self.max_eviction_queue_entries,
      self.max_cache_entry_size
    )
  }
}
