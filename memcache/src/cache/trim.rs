use std::fmt;

/// The kinds of memory pressure a [`MemoryTrimmable`](crate::trimmable::MemoryTrimmable)
/// can be asked to react to, from mildest to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTrimType {
  /// The process is approaching its managed-heap limit.
  OnCloseToHeapLimit,
  /// The system is low on memory while the application is in the foreground.
  OnSystemLowMemoryWhileAppInForeground,
  /// The system is critically low on memory while the application is in the foreground.
  OnSystemMemoryCriticallyLowWhileAppInForeground,
  /// The system is low on memory while the application is in the background.
  OnSystemLowMemoryWhileAppInBackgroundLowSeverity,
  /// The application moved to the background.
  OnAppBackgrounded,
}

impl MemoryTrimType {
  /// The fraction of cached memory a trimmable should drop for this event.
  pub fn suggested_trim_ratio(self) -> f64 {
    match self {
      MemoryTrimType::OnCloseToHeapLimit
      | MemoryTrimType::OnSystemLowMemoryWhileAppInForeground
      | MemoryTrimType::OnSystemMemoryCriticallyLowWhileAppInForeground => 0.5,
      MemoryTrimType::OnSystemLowMemoryWhileAppInBackgroundLowSeverity
      | MemoryTrimType::OnAppBackgrounded => 1.0,
    }
  }
}

impl fmt::Display for MemoryTrimType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      MemoryTrimType::OnCloseToHeapLimit => "close to heap limit",
      MemoryTrimType::OnSystemLowMemoryWhileAppInForeground => "low memory (foreground)",
      MemoryTrimType::OnSystemMemoryCriticallyLowWhileAppInForeground => {
        "critically low memory (foreground)"
      }
      MemoryTrimType::OnSystemLowMemoryWhileAppInBackgroundLowSeverity => "low memory (background)",
      MemoryTrimType::OnAppBackgrounded => "app backgrounded",
    };
    f.write_str(name)
  }
}

/// Decides how much of a cache to drop for a given trim event.
pub trait CacheTrimStrategy: Send + Sync {
  /// Returns a ratio in `[0, 1]`; `1` empties the eviction queue.
  fn trim_ratio(&self, trim_type: MemoryTrimType) -> f64;
}

impl<F> CacheTrimStrategy for F
where
  F: Fn(MemoryTrimType) -> f64 + Send + Sync,
{
  fn trim_ratio(&self, trim_type: MemoryTrimType) -> f64 {
    self(trim_type)
  }
}

/// Trim policy for decoded images: follow the suggestion near the heap limit,
/// drop everything evictable on any system-level pressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitmapMemoryCacheTrimStrategy;

impl CacheTrimStrategy for BitmapMemoryCacheTrimStrategy {
  fn trim_ratio(&self, trim_type: MemoryTrimType) -> f64 {
    match trim_type {
      MemoryTrimType::OnCloseToHeapLimit => trim_type.suggested_trim_ratio(),
      MemoryTrimType::OnAppBackgrounded
      | MemoryTrimType::OnSystemMemoryCriticallyLowWhileAppInForeground
      | MemoryTrimType::OnSystemLowMemoryWhileAppInForeground
      | MemoryTrimType::OnSystemLowMemoryWhileAppInBackgroundLowSeverity => 1.0,
    }
  }
}

/// Trim policy for encoded bytes held outside the managed heap: heap pressure
/// does not concern them, system pressure empties the eviction queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeMemoryCacheTrimStrategy;

impl CacheTrimStrategy for NativeMemoryCacheTrimStrategy {
  fn trim_ratio(&self, trim_type: MemoryTrimType) -> f64 {
    match trim_type {
      MemoryTrimType::OnCloseToHeapLimit => 0.0,
      _ => 1.0,
    }
  }
}
