use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// Lock-free counters updated by a counting cache.
///
/// Updated outside the cache lock, so a snapshot taken concurrently with
/// cache operations may be momentarily inconsistent across fields.
#[derive(Debug)]
pub(crate) struct CacheMetrics {
  // --- Lookups ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,
  pub(crate) probes: CachePadded<AtomicU64>,

  // --- Writes ---
  pub(crate) puts: CachePadded<AtomicU64>,
  pub(crate) rejected_puts: CachePadded<AtomicU64>,

  // --- Removal ---
  pub(crate) evictions: CachePadded<AtomicU64>,
  pub(crate) trimmed: CachePadded<AtomicU64>,
  pub(crate) removals: CachePadded<AtomicU64>,
  pub(crate) orphaned: CachePadded<AtomicU64>,
  pub(crate) reused: CachePadded<AtomicU64>,
  pub(crate) released: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for CacheMetrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      probes: CachePadded::new(AtomicU64::new(0)),
      puts: CachePadded::new(AtomicU64::new(0)),
      rejected_puts: CachePadded::new(AtomicU64::new(0)),
      evictions: CachePadded::new(AtomicU64::new(0)),
      trimmed: CachePadded::new(AtomicU64::new(0)),
      removals: CachePadded::new(AtomicU64::new(0)),
      orphaned: CachePadded::new(AtomicU64::new(0)),
      reused: CachePadded::new(AtomicU64::new(0)),
      released: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl CacheMetrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub(crate) fn add(counter: &AtomicU64, n: usize) {
    if n > 0 {
      counter.fetch_add(n as u64, Ordering::Relaxed);
    }
  }

  pub(crate) fn snapshot(&self) -> CacheStats {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let lookups = hits + misses;

    CacheStats {
      hits,
      misses,
      hit_ratio: if lookups == 0 {
        0.0
      } else {
        hits as f64 / lookups as f64
      },
      probes: self.probes.load(Ordering::Relaxed),
      puts: self.puts.load(Ordering::Relaxed),
      rejected_puts: self.rejected_puts.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      trimmed: self.trimmed.load(Ordering::Relaxed),
      removals: self.removals.load(Ordering::Relaxed),
      orphaned: self.orphaned.load(Ordering::Relaxed),
      reused: self.reused.load(Ordering::Relaxed),
      released: self.released.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time snapshot of a cache's counters.
#[derive(Clone, Default, PartialEq)]
pub struct CacheStats {
  /// Lookups that found an entry.
  pub hits: u64,
  /// Lookups that found nothing.
  pub misses: u64,
  /// hits / (hits + misses).
  pub hit_ratio: f64,
  /// Recency refreshes through `probe`.
  pub probes: u64,
  /// Values accepted by `cache`.
  pub puts: u64,
  /// Values refused by `cache` because they did not fit.
  pub rejected_puts: u64,
  /// Exclusive entries dropped to honour the configured limits.
  pub evictions: u64,
  /// Exclusive entries dropped in response to memory pressure.
  pub trimmed: u64,
  /// Entries removed through `remove_all`, `clear` or replacement.
  pub removals: u64,
  /// Removed entries that clients were still holding.
  pub orphaned: u64,
  /// Exclusive entries handed back to the caller through `reuse`.
  pub reused: u64,
  /// Handles the cache let go of: evicted, trimmed, removed or refused
  /// values, and orphans whose last client closed.
  pub released: u64,
  /// Seconds since the cache was created.
  pub uptime_secs: u64,
}

impl fmt::Debug for CacheStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheStats")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("probes", &self.probes)
      .field("puts", &self.puts)
      .field("rejected_puts", &self.rejected_puts)
      .field("evictions", &self.evictions)
      .field("trimmed", &self.trimmed)
      .field("removals", &self.removals)
      .field("orphaned", &self.orphaned)
      .field("reused", &self.reused)
      .field("released", &self.released)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
