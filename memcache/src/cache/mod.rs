//! The counting memory cache.
//!
//! Every indexed entry is either *exclusive* (no client holds it; queued for
//! LRU eviction) or *in use* (one or more client handles are open; never
//! evicted). Entries removed from the index while in use become *orphans*
//! and are released when their last client closes.

mod entry;
pub mod factory;
pub mod instrumented;
pub(crate) mod lru_list;
pub mod params;
pub mod trim;

use self::entry::{CacheEntry, EntryState};
use self::lru_list::EvictionQueue;
use self::params::{fixed_params, MemoryCacheParams, ParamsSupplier};
use self::trim::{CacheTrimStrategy, MemoryTrimType};
use crate::error::{CacheError, ReferenceError};
use crate::listener::{report, CacheEventListener, EvictionReason, NoOpCacheEventListener};
use crate::metrics::{CacheMetrics, CacheStats};
use crate::reference::CloseableRef;
use crate::trimmable::MemoryTrimmable;

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use generational_arena::{Arena, Index};
use parking_lot::Mutex;

/// Computes the size a value occupies in the cache.
pub trait ValueDescriptor<V>: Send + Sync {
  fn size_in_bytes(&self, value: &V) -> u64;
}

impl<V, F> ValueDescriptor<V> for F
where
  F: Fn(&V) -> u64 + Send + Sync,
{
  fn size_in_bytes(&self, value: &V) -> u64 {
    self(value)
  }
}

/// Notified whenever an entry enters (`true`) or leaves (`false`) the
/// exclusive set. Always called outside the cache lock.
pub trait EntryStateObserver<K>: Send + Sync {
  fn on_exclusivity_changed(&self, key: &K, is_exclusive: bool);
}

impl<K, F> EntryStateObserver<K> for F
where
  F: Fn(&K, bool) + Send + Sync,
{
  fn on_exclusivity_changed(&self, key: &K, is_exclusive: bool) {
    self(key, is_exclusive)
  }
}

/// The operations shared by every memory cache implementation.
pub trait MemoryCache<K, V>: MemoryTrimmable {
  /// Returns a client handle for `key`, or `None` on a miss.
  fn get(&self, key: &K) -> Option<CloseableRef<V>>;

  /// Refreshes the recency of `key` without handing out a reference.
  fn probe(&self, key: &K);

  /// Caches `value` under `key`, returning a client handle, or `None` if the
  /// value did not fit.
  fn cache(&self, key: K, value: &CloseableRef<V>) -> Result<Option<CloseableRef<V>>, ReferenceError>;

  /// Removes every entry whose key matches `predicate`; returns how many.
  fn remove_all(&self, predicate: &dyn Fn(&K) -> bool) -> usize;

  fn contains(&self, predicate: &dyn Fn(&K) -> bool) -> bool;

  fn contains_key(&self, key: &K) -> bool;

  fn count(&self) -> usize;

  fn size_in_bytes(&self) -> u64;
}

/// Work collected under the lock and executed after it is dropped.
struct Deferred<K, V> {
  released: Vec<CloseableRef<V>>,
  exclusivity: Vec<(Arc<dyn EntryStateObserver<K>>, K, bool)>,
  evicted: Vec<(K, u64, EvictionReason)>,
  orphaned: usize,
}

impl<K, V> Deferred<K, V> {
  fn new() -> Self {
    Self {
      released: Vec::new(),
      exclusivity: Vec::new(),
      evicted: Vec::new(),
      orphaned: 0,
    }
  }

  fn notify_exclusivity(&mut self, entry: &CacheEntry<K, V>, is_exclusive: bool)
  where
    K: Clone,
  {
    if let Some(observer) = &entry.observer {
      self
        .exclusivity
        .push((Arc::clone(observer), entry.key.clone(), is_exclusive));
    }
  }

  /// Takes ownership of an exclusive entry that left the cache.
  fn release(&mut self, entry: CacheEntry<K, V>, reason: EvictionReason)
  where
    K: Clone,
  {
    self.notify_exclusivity(&entry, false);
    self.evicted.push((entry.key, entry.size_in_bytes, reason));
    self.released.push(entry.value_ref);
  }

  fn run(self, listener: &dyn CacheEventListener<K>, metrics: &CacheMetrics) {
    // Values are released before anyone hears about their removal.
    CacheMetrics::add(&metrics.released, self.released.len());
    drop(self.released);

    for (observer, key, is_exclusive) in self.exclusivity {
      observer.on_exclusivity_changed(&key, is_exclusive);
    }

    for (key, size, reason) in self.evicted {
      let counter = match reason {
        EvictionReason::Capacity => &metrics.evictions,
        EvictionReason::Trimmed => &metrics.trimmed,
        EvictionReason::Invalidated | EvictionReason::Replaced => &metrics.removals,
      };
      CacheMetrics::add(counter, 1);
      report("on_evict", listener.on_evict(&key, size, reason));
    }

    CacheMetrics::add(&metrics.orphaned, self.orphaned);
  }
}

fn key_mismatch(context: &'static str) {
  tracing::error!(error = %CacheError::KeyMismatch, context, "cache invariant violated");
  debug_assert!(false, "{}: {}", context, CacheError::KeyMismatch);
}

/// Everything guarded by the cache lock.
struct CacheState<K: Eq + Hash + Clone, V> {
  entries: Arena<CacheEntry<K, V>>,
  index: HashMap<K, Index>,
  exclusive: EvictionQueue<K>,
  /// Total size of indexed entries. Orphans are not counted.
  cached_size: u64,
  params: MemoryCacheParams,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
  fn apply_params(&mut self, params: Option<MemoryCacheParams>) {
    if let Some(params) = params {
      if params != self.params {
        tracing::debug!(%params, "memory cache params changed");
        self.params = params;
      }
    }
  }

  #[inline]
  fn in_use_count(&self) -> usize {
    self.index.len() - self.exclusive.len()
  }

  #[inline]
  fn in_use_size(&self) -> u64 {
    self.cached_size.saturating_sub(self.exclusive.size_in_bytes())
  }

  /// Whether a new in-use entry of `size` bytes fits within the limits.
  fn can_cache(&self, size: u64) -> bool {
    let params = &self.params;
    size <= params.max_cache_entry_size
      && self.in_use_count() < params.max_cache_entries
      && self
        .in_use_size()
        .checked_add(size)
        .is_some_and(|total| total <= params.max_cache_size)
  }

  /// Removes `key` from the index. Exclusive entries are released; in-use
  /// entries become orphans.
  fn detach(&mut self, key: &K, reason: EvictionReason, deferred: &mut Deferred<K, V>) -> bool {
    let Some(idx) = self.index.remove(key) else {
      return false;
    };
    let Some(entry) = self.entries.get_mut(idx) else {
      key_mismatch("detach");
      return true;
    };
    if entry.key != *key {
      key_mismatch("detach");
    }
    self.cached_size = self.cached_size.saturating_sub(entry.size_in_bytes);

    match entry.state {
      EntryState::Exclusive => {
        self.exclusive.remove(key);
        if let Some(entry) = self.entries.remove(idx) {
          deferred.release(entry, reason);
        }
      }
      EntryState::InUse { clients } => {
        tracing::trace!(clients, "orphaning in-use entry");
        entry.state = EntryState::Orphan { clients };
        deferred.orphaned += 1;
        deferred
          .evicted
          .push((entry.key.clone(), entry.size_in_bytes, reason));
      }
      EntryState::Orphan { .. } => key_mismatch("detach: orphan still indexed"),
    }
    true
  }

  /// Pops exclusive entries, oldest first, until the queue holds at most
  /// `count` entries and `size` bytes.
  fn trim_exclusive_to(
    &mut self,
    count: usize,
    size: u64,
    reason: EvictionReason,
    deferred: &mut Deferred<K, V>,
  ) {
    while self.exclusive.len() > count || self.exclusive.size_in_bytes() > size {
      let Some((key, _)) = self.exclusive.pop_oldest() else {
        break;
      };
      let Some(idx) = self.index.remove(&key) else {
        key_mismatch("evict: queued key not indexed");
        continue;
      };
      match self.entries.remove(idx) {
        Some(entry) => {
          self.cached_size = self.cached_size.saturating_sub(entry.size_in_bytes);
          deferred.release(entry, reason);
        }
        None => key_mismatch("evict: indexed slot empty"),
      }
    }
  }

  fn evict_over_limits(&mut self, deferred: &mut Deferred<K, V>) {
    let params = self.params;
    let max_count = params
      .max_eviction_queue_entries
      .min(params.max_cache_entries.saturating_sub(self.in_use_count()));
    let max_size = params
      .max_eviction_queue_size
      .min(params.max_cache_size.saturating_sub(self.in_use_size()));
    self.trim_exclusive_to(max_count, max_size, EvictionReason::Capacity, deferred);
  }
}

pub(crate) struct CacheInner<K: Eq + Hash + Clone, V> {
  state: Mutex<CacheState<K, V>>,
  value_descriptor: Arc<dyn ValueDescriptor<V>>,
  trim_strategy: Arc<dyn CacheTrimStrategy>,
  params_supplier: ParamsSupplier,
  params_check_interval: Duration,
  last_params_check: Mutex<Instant>,
  listener: Arc<dyn CacheEventListener<K>>,
  metrics: CacheMetrics,
}

impl<K, V> CacheInner<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  /// Reads the supplier if the check interval has elapsed. Runs outside the
  /// cache lock.
  fn fresh_params(&self) -> Option<MemoryCacheParams> {
    let mut last = self.last_params_check.lock();
    if last.elapsed() < self.params_check_interval {
      return None;
    }
    *last = Instant::now();
    drop(last);
    Some((self.params_supplier)())
  }

  /// Called when the last clone of a client handle closes.
  fn release_client(&self, idx: Index) {
    let params = self.fresh_params();
    let mut deferred = Deferred::new();
    {
      let mut guard = self.state.lock();
      let state = &mut *guard;
      state.apply_params(params);

      match state.entries.get_mut(idx) {
        None => key_mismatch("release: entry missing"),
        Some(entry) => match entry.state {
          EntryState::InUse { clients } if clients > 1 => {
            entry.state = EntryState::InUse {
              clients: clients - 1,
            };
          }
          EntryState::InUse { .. } => {
            if state.index.get(&entry.key) != Some(&idx) {
              key_mismatch("release: in-use entry not indexed");
            }
            entry.state = EntryState::Exclusive;
            state.exclusive.push(entry.key.clone(), entry.size_in_bytes);
            deferred.notify_exclusivity(entry, true);
          }
          EntryState::Orphan { clients } if clients > 1 => {
            entry.state = EntryState::Orphan {
              clients: clients - 1,
            };
          }
          EntryState::Orphan { .. } => {
            if let Some(entry) = state.entries.remove(idx) {
              tracing::trace!("releasing orphan after its last client closed");
              deferred.released.push(entry.value_ref);
            }
          }
          EntryState::Exclusive => key_mismatch("release: entry has no clients"),
        },
      }

      state.evict_over_limits(&mut deferred);
    }
    deferred.run(&*self.listener, &self.metrics);
  }
}

/// Creates a client handle for the entry at `idx`. Its final close calls
/// back into the cache, if the cache is still alive.
fn client_handle<K, V>(
  weak: &Weak<CacheInner<K, V>>,
  entry: &CacheEntry<K, V>,
  idx: Index,
) -> Option<CloseableRef<V>>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  let weak = weak.clone();
  let derived = CloseableRef::derived(&entry.value_ref, move || {
    if let Some(inner) = weak.upgrade() {
      inner.release_client(idx);
    }
  });
  match derived {
    Ok(handle) => Some(handle),
    Err(error) => {
      tracing::error!(%error, "cached value closed while still stored");
      debug_assert!(false, "cached value closed while still stored");
      None
    }
  }
}

/// A bounded key→resource cache that tracks which entries are held by clients.
///
/// Cloning the cache is cheap and yields another handle to the same storage.
pub struct CountingMemoryCache<K: Eq + Hash + Clone, V> {
  inner: Arc<CacheInner<K, V>>,
}

impl<K: Eq + Hash + Clone, V> Clone for CountingMemoryCache<K, V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<K, V> CountingMemoryCache<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub fn builder() -> MemoryCacheBuilder<K, V> {
    MemoryCacheBuilder::new()
  }

  /// Returns a client handle for `key`, moving the entry out of the eviction
  /// queue if needed.
  pub fn get(&self, key: &K) -> Option<CloseableRef<V>> {
    let params = self.inner.fresh_params();
    let mut deferred = Deferred::new();
    let handle = {
      let mut guard = self.inner.state.lock();
      let state = &mut *guard;
      state.apply_params(params);

      let mut handle = None;
      if let Some(idx) = state.index.get(key).copied() {
        if let Some(entry) = state.entries.get_mut(idx) {
          handle = client_handle(&Arc::downgrade(&self.inner), entry, idx);
          if handle.is_some() {
            if entry.is_exclusive() {
              state.exclusive.remove(key);
              deferred.notify_exclusivity(entry, false);
            }
            entry.add_client();
          }
        }
      }

      state.evict_over_limits(&mut deferred);
      handle
    };
    deferred.run(&*self.inner.listener, &self.inner.metrics);

    if handle.is_some() {
      CacheMetrics::add(&self.inner.metrics.hits, 1);
      report("on_hit", self.inner.listener.on_hit(key));
    } else {
      CacheMetrics::add(&self.inner.metrics.misses, 1);
      report("on_miss", self.inner.listener.on_miss(key));
    }
    handle
  }

  /// Marks an exclusive entry as recently used. In-use entries and misses are
  /// left alone.
  pub fn probe(&self, key: &K) {
    let touched = self.inner.state.lock().exclusive.touch(key);
    if touched {
      CacheMetrics::add(&self.inner.metrics.probes, 1);
    }
  }

  /// Caches `value` under `key` and returns a client handle to it.
  ///
  /// Any entry already stored under `key` is removed first: released if it
  /// was exclusive, orphaned if clients still hold it. Returns `Ok(None)` if
  /// the value does not fit, in which case nothing is stored.
  ///
  /// # Errors
  ///
  /// Fails with [`ReferenceError::Closed`] if `value` has been closed.
  pub fn cache(&self, key: K, value: &CloseableRef<V>) -> Result<Option<CloseableRef<V>>, ReferenceError> {
    self.cache_inner(key, value, None)
  }

  /// Like [`cache`](Self::cache), with an observer notified whenever the new
  /// entry enters or leaves the exclusive set.
  pub fn cache_with_observer(
    &self,
    key: K,
    value: &CloseableRef<V>,
    observer: Arc<dyn EntryStateObserver<K>>,
  ) -> Result<Option<CloseableRef<V>>, ReferenceError> {
    self.cache_inner(key, value, Some(observer))
  }

  fn cache_inner(
    &self,
    key: K,
    value: &CloseableRef<V>,
    observer: Option<Arc<dyn EntryStateObserver<K>>>,
  ) -> Result<Option<CloseableRef<V>>, ReferenceError> {
    let retained = value.try_clone()?;
    let size = self.inner.value_descriptor.size_in_bytes(retained.get()?);
    let params = self.inner.fresh_params();
    let mut deferred = Deferred::new();

    let handle = {
      let mut guard = self.inner.state.lock();
      let state = &mut *guard;
      state.apply_params(params);

      state.detach(&key, EvictionReason::Replaced, &mut deferred);

      let handle = if state.can_cache(size) {
        let idx = state
          .entries
          .insert(CacheEntry::new(key.clone(), retained, size, observer));
        state.index.insert(key.clone(), idx);
        state.cached_size = state.cached_size.saturating_add(size);

        let entry = &mut state.entries[idx];
        let handle = client_handle(&Arc::downgrade(&self.inner), entry, idx);
        if handle.is_none() {
          entry.state = EntryState::Exclusive;
          state.exclusive.push(key.clone(), size);
        }
        handle
      } else {
        tracing::debug!(size, "value does not fit in the memory cache");
        deferred.released.push(retained);
        None
      };

      state.evict_over_limits(&mut deferred);
      handle
    };
    deferred.run(&*self.inner.listener, &self.inner.metrics);

    if handle.is_some() {
      CacheMetrics::add(&self.inner.metrics.puts, 1);
      report("on_put", self.inner.listener.on_put(&key, size));
    } else {
      CacheMetrics::add(&self.inner.metrics.rejected_puts, 1);
    }
    Ok(handle)
  }

  /// Removes an exclusive entry and hands the cache's own handle to the
  /// caller. Returns `None` for misses and for entries in use.
  pub fn reuse(&self, key: &K) -> Option<CloseableRef<V>> {
    let mut deferred = Deferred::new();
    let reused = {
      let mut guard = self.inner.state.lock();
      let state = &mut *guard;
      match state.index.get(key).copied() {
        Some(idx) if state.entries.get(idx).is_some_and(CacheEntry::is_exclusive) => {
          state.index.remove(key);
          state.exclusive.remove(key);
          state.entries.remove(idx).map(|entry| {
            state.cached_size = state.cached_size.saturating_sub(entry.size_in_bytes);
            deferred.notify_exclusivity(&entry, false);
            entry.value_ref
          })
        }
        _ => None,
      }
    };
    deferred.run(&*self.inner.listener, &self.inner.metrics);

    if reused.is_some() {
      CacheMetrics::add(&self.inner.metrics.reused, 1);
    }
    reused
  }

  /// Removes every entry whose key matches `predicate`.
  ///
  /// Exclusive entries are released; in-use entries are orphaned and stay
  /// alive until their last client closes. Returns the number of entries
  /// removed from the index.
  pub fn remove_all<P>(&self, predicate: P) -> usize
  where
    P: Fn(&K) -> bool,
  {
    let mut deferred = Deferred::new();
    let removed = {
      let mut guard = self.inner.state.lock();
      let state = &mut *guard;
      let keys: Vec<K> = state.index.keys().filter(|k| predicate(k)).cloned().collect();
      keys
        .iter()
        .filter(|key| state.detach(key, EvictionReason::Invalidated, &mut deferred))
        .count()
    };
    deferred.run(&*self.inner.listener, &self.inner.metrics);
    removed
  }

  /// Removes every entry.
  pub fn clear(&self) {
    let removed = self.remove_all(|_| true);
    tracing::debug!(removed, "memory cache cleared");
  }

  /// Returns `true` if any indexed key matches `predicate`.
  pub fn contains<P>(&self, predicate: P) -> bool
  where
    P: Fn(&K) -> bool,
  {
    self.inner.state.lock().index.keys().any(predicate)
  }

  pub fn contains_key(&self, key: &K) -> bool {
    self.inner.state.lock().index.contains_key(key)
  }

  /// The number of indexed entries, in use or not.
  pub fn count(&self) -> usize {
    self.inner.state.lock().index.len()
  }

  /// The total size of indexed entries, in use or not.
  pub fn size_in_bytes(&self) -> u64 {
    self.inner.state.lock().cached_size
  }

  pub fn in_use_count(&self) -> usize {
    self.inner.state.lock().in_use_count()
  }

  pub fn in_use_size_in_bytes(&self) -> u64 {
    self.inner.state.lock().in_use_size()
  }

  pub fn eviction_queue_count(&self) -> usize {
    self.inner.state.lock().exclusive.len()
  }

  pub fn eviction_queue_size_in_bytes(&self) -> u64 {
    self.inner.state.lock().exclusive.size_in_bytes()
  }

  /// The limits currently in effect.
  pub fn params(&self) -> MemoryCacheParams {
    self.inner.state.lock().params
  }

  pub fn max_cache_size(&self) -> u64 {
    self.params().max_cache_size
  }

  pub fn stats(&self) -> CacheStats {
    self.inner.metrics.snapshot()
  }

  /// A trimmable for this cache that does not keep it alive, suitable for
  /// handing to a [`MemoryTrimmableRegistry`](crate::trimmable::MemoryTrimmableRegistry).
  pub fn trim_handle(&self) -> Arc<dyn MemoryTrimmable> {
    Arc::new(WeakTrimHandle {
      inner: Arc::downgrade(&self.inner),
    })
  }

  /// Drops exclusive entries in response to memory pressure.
  ///
  /// The strategy's ratio decides what share of the cached size to shed;
  /// in-use entries are never touched, so the cache may stay above the
  /// target.
  pub fn trim(&self, trim_type: MemoryTrimType) {
    let ratio = self.inner.trim_strategy.trim_ratio(trim_type);
    let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
    let params = self.inner.fresh_params();
    let mut deferred = Deferred::new();
    {
      let mut guard = self.inner.state.lock();
      let state = &mut *guard;
      state.apply_params(params);

      let target = (state.cached_size as f64 * (1.0 - ratio)) as u64;
      let queue_target = target.saturating_sub(state.in_use_size());
      state.trim_exclusive_to(usize::MAX, queue_target, EvictionReason::Trimmed, &mut deferred);
      state.evict_over_limits(&mut deferred);
    }
    tracing::debug!(%trim_type, ratio, trimmed = deferred.evicted.len(), "memory cache trimmed");
    deferred.run(&*self.inner.listener, &self.inner.metrics);
  }
}

impl<K, V> fmt::Debug for CountingMemoryCache<K, V>
where
  K: Eq + Hash + Clone,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("CountingMemoryCache")
      .field("count", &state.index.len())
      .field("size_in_bytes", &state.cached_size)
      .field("eviction_queue_count", &state.exclusive.len())
      .field("params", &state.params)
      .finish_non_exhaustive()
  }
}

impl<K, V> MemoryTrimmable for CountingMemoryCache<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn trim(&self, trim_type: MemoryTrimType) {
    CountingMemoryCache::trim(self, trim_type)
  }
}

struct WeakTrimHandle<K: Eq + Hash + Clone, V> {
  inner: Weak<CacheInner<K, V>>,
}

impl<K, V> MemoryTrimmable for WeakTrimHandle<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn trim(&self, trim_type: MemoryTrimType) {
    if let Some(inner) = self.inner.upgrade() {
      CountingMemoryCache { inner }.trim(trim_type);
    }
  }

  fn is_alive(&self) -> bool {
    self.inner.strong_count() > 0
  }
}

impl<K, V> MemoryCache<K, V> for CountingMemoryCache<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn get(&self, key: &K) -> Option<CloseableRef<V>> {
    CountingMemoryCache::get(self, key)
  }

  fn probe(&self, key: &K) {
    CountingMemoryCache::probe(self, key)
  }

  fn cache(&self, key: K, value: &CloseableRef<V>) -> Result<Option<CloseableRef<V>>, ReferenceError> {
    CountingMemoryCache::cache(self, key, value)
  }

  fn remove_all(&self, predicate: &dyn Fn(&K) -> bool) -> usize {
    CountingMemoryCache::remove_all(self, predicate)
  }

  fn contains(&self, predicate: &dyn Fn(&K) -> bool) -> bool {
    CountingMemoryCache::contains(self, predicate)
  }

  fn contains_key(&self, key: &K) -> bool {
    CountingMemoryCache::contains_key(self, key)
  }

  fn count(&self) -> usize {
    CountingMemoryCache::count(self)
  }

  fn size_in_bytes(&self) -> u64 {
    CountingMemoryCache::size_in_bytes(self)
  }
}

/// A builder for [`CountingMemoryCache`].
pub struct MemoryCacheBuilder<K, V> {
  params_supplier: Option<ParamsSupplier>,
  value_descriptor: Option<Arc<dyn ValueDescriptor<V>>>,
  trim_strategy: Option<Arc<dyn CacheTrimStrategy>>,
  listener: Option<Arc<dyn CacheEventListener<K>>>,
  params_check_interval: Duration,
}

impl<K, V> fmt::Debug for MemoryCacheBuilder<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MemoryCacheBuilder")
      .field("has_params_supplier", &self.params_supplier.is_some())
      .field("has_value_descriptor", &self.value_descriptor.is_some())
      .field("has_trim_strategy", &self.trim_strategy.is_some())
      .field("has_listener", &self.listener.is_some())
      .field("params_check_interval", &self.params_check_interval)
      .finish()
  }
}

impl<K, V> Default for MemoryCacheBuilder<K, V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V> MemoryCacheBuilder<K, V> {
  pub fn new() -> Self {
    Self {
      params_supplier: None,
      value_descriptor: None,
      trim_strategy: None,
      listener: None,
      params_check_interval: Duration::ZERO,
    }
  }

  /// Uses fixed limits.
  pub fn params(mut self, params: MemoryCacheParams) -> Self {
    self.params_supplier = Some(fixed_params(params));
    self
  }

  /// Reads the limits from `supplier`, which may change its answer over time.
  ///
  /// The supplier is called outside the cache lock.
  pub fn params_supplier<F>(mut self, supplier: F) -> Self
  where
    F: Fn() -> MemoryCacheParams + Send + Sync + 'static,
  {
    self.params_supplier = Some(Arc::new(supplier));
    self
  }

  /// Sets how values are sized. Defaults to one byte per value, which turns
  /// the size limits into additional count limits.
  pub fn value_descriptor<D>(mut self, descriptor: D) -> Self
  where
    D: ValueDescriptor<V> + 'static,
  {
    self.value_descriptor = Some(Arc::new(descriptor));
    self
  }

  /// Sets the trim strategy. Defaults to [`MemoryTrimType::suggested_trim_ratio`].
  pub fn trim_strategy<S>(mut self, strategy: S) -> Self
  where
    S: CacheTrimStrategy + 'static,
  {
    self.trim_strategy = Some(Arc::new(strategy));
    self
  }

  pub fn event_listener<L>(mut self, listener: L) -> Self
  where
    L: CacheEventListener<K> + 'static,
  {
    self.listener = Some(Arc::new(listener));
    self
  }

  /// Limits how often the params supplier is consulted. Zero, the default,
  /// re-reads it on every mutating operation.
  pub fn params_check_interval(mut self, interval: Duration) -> Self {
    self.params_check_interval = interval;
    self
  }

  pub fn build(self) -> CountingMemoryCache<K, V>
  where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
  {
    let params_supplier = self
      .params_supplier
      .unwrap_or_else(|| fixed_params(MemoryCacheParams::default()));
    let params = params_supplier();

    let value_descriptor = self
      .value_descriptor
      .unwrap_or_else(|| Arc::new(|_: &V| 1u64));
    let trim_strategy = self
      .trim_strategy
      .unwrap_or_else(|| Arc::new(MemoryTrimType::suggested_trim_ratio));
    let listener = self
      .listener
      .unwrap_or_else(|| Arc::new(NoOpCacheEventListener));

    tracing::debug!(%params, "building counting memory cache");

    CountingMemoryCache {
      inner: Arc::new(CacheInner {
        state: Mutex::new(CacheState {
          entries: Arena::new(),
          index: HashMap::new(),
          exclusive: EvictionQueue::new(),
          cached_size: 0,
          params,
        }),
        value_descriptor,
        trim_strategy,
        params_supplier,
        params_check_interval: self.params_check_interval,
        last_params_check: Mutex::new(Instant::now()),
        listener,
        metrics: CacheMetrics::new(),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn sized_cache(params: MemoryCacheParams) -> CountingMemoryCache<&'static str, u64> {
    CountingMemoryCache::builder()
      .params(params)
      .value_descriptor(|v: &u64| *v)
      .build()
  }

  fn value(size: u64, released: &Arc<AtomicUsize>) -> CloseableRef<u64> {
    let released = Arc::clone(released);
    CloseableRef::of(size, move |_| {
      released.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn get_moves_entry_between_partitions() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = sized_cache(MemoryCacheParams::unbounded());
    let original = value(10, &released);

    let client = cache.cache("a", &original).unwrap().unwrap();
    assert_eq!(cache.in_use_count(), 1);
    assert_eq!(cache.eviction_queue_count(), 0);

    drop(client);
    assert_eq!(cache.in_use_count(), 0);
    assert_eq!(cache.eviction_queue_count(), 1);
    assert_eq!(cache.eviction_queue_size_in_bytes(), 10);

    let again = cache.get(&"a").unwrap();
    assert_eq!(*again.get().unwrap(), 10);
    assert_eq!(cache.in_use_count(), 1);
    assert_eq!(cache.eviction_queue_count(), 0);
    assert_eq!(released.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn oversized_value_is_not_cached() {
    let released = Arc::new(AtomicUsize::new(0));
    let params = MemoryCacheParams::new(100, 10, 100, 10, 20);
    let cache = sized_cache(params);
    let mut big = value(21, &released);

    assert!(cache.cache("big", &big).unwrap().is_none());
    assert_eq!(cache.count(), 0);
    assert_eq!(cache.stats().rejected_puts, 1);

    big.close();
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn closed_value_is_rejected() {
    let cache = sized_cache(MemoryCacheParams::unbounded());
    let mut closed = CloseableRef::new(1u64);
    closed.close();
    assert_eq!(cache.cache("a", &closed).err(), Some(ReferenceError::Closed));
  }

  #[test]
  fn probe_refreshes_exclusive_recency() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = sized_cache(MemoryCacheParams::with_budget(u64::MAX, 2));
    for key in ["a", "b"] {
      let original = value(1, &released);
      drop(cache.cache(key, &original).unwrap());
    }

    cache.probe(&"a");
    let original = value(1, &released);
    drop(cache.cache("c", &original).unwrap());

    assert!(cache.contains_key(&"a"));
    assert!(!cache.contains_key(&"b"));
    assert!(cache.contains_key(&"c"));
    assert_eq!(cache.stats().probes, 1);
  }

  #[test]
  fn reuse_transfers_exclusive_entry() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = sized_cache(MemoryCacheParams::unbounded());
    let original = value(5, &released);
    let client = cache.cache("a", &original).unwrap().unwrap();
    drop(original);

    assert!(cache.reuse(&"a").is_none(), "in-use entries are not reusable");
    drop(client);

    let reused = cache.reuse(&"a").unwrap();
    assert_eq!(cache.count(), 0);
    assert_eq!(released.load(Ordering::SeqCst), 0);
    drop(reused);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn client_outliving_cache_still_releases() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = sized_cache(MemoryCacheParams::unbounded());
    let original = value(5, &released);
    let client = cache.cache("a", &original).unwrap().unwrap();
    drop(original);
    drop(cache);

    assert_eq!(released.load(Ordering::SeqCst), 0);
    assert_eq!(*client.get().unwrap(), 5);
    drop(client);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn sizes_past_u64_max_saturate() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = sized_cache(MemoryCacheParams::unbounded());
    drop(cache.cache("huge", &value(u64::MAX - 1, &released)).unwrap());
    let small = cache.cache("small", &value(10, &released)).unwrap().unwrap();

    assert_eq!(cache.count(), 2);
    assert_eq!(cache.size_in_bytes(), u64::MAX);
    drop(small);
    assert_eq!(cache.eviction_queue_size_in_bytes(), u64::MAX);
    cache.clear();
    assert_eq!(released.load(Ordering::SeqCst), 2);
  }
}
