//! Memory-pressure plumbing between the host and its caches.

pub use crate::cache::trim::MemoryTrimType;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Something that can shed memory on request.
pub trait MemoryTrimmable: Send + Sync {
  fn trim(&self, trim_type: MemoryTrimType);

  /// `false` once trimming can no longer have any effect, e.g. the cache
  /// behind a weak handle was dropped. Registries forget such trimmables.
  fn is_alive(&self) -> bool {
    true
  }
}

/// A broadcaster of memory-pressure events.
pub trait MemoryTrimmableRegistry: Send + Sync {
  fn register_memory_trimmable(&self, trimmable: Arc<dyn MemoryTrimmable>);
  fn unregister_memory_trimmable(&self, trimmable: &Arc<dyn MemoryTrimmable>);
}

/// A registry that ignores registrations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMemoryTrimmableRegistry;

impl MemoryTrimmableRegistry for NoOpMemoryTrimmableRegistry {
  fn register_memory_trimmable(&self, _trimmable: Arc<dyn MemoryTrimmable>) {}
  fn unregister_memory_trimmable(&self, _trimmable: &Arc<dyn MemoryTrimmable>) {}
}

/// A registry that forwards [`TrimRegistry::trim`] to every registered trimmable.
#[derive(Default)]
pub struct TrimRegistry {
  trimmables: Mutex<Vec<Arc<dyn MemoryTrimmable>>>,
}

impl TrimRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.trimmables.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Sends `trim_type` to every registered trimmable.
  ///
  /// The registration list is snapshotted first, so a trimmable may register
  /// or unregister from inside its `trim`.
  pub fn trim(&self, trim_type: MemoryTrimType) {
    let snapshot = {
      let mut trimmables = self.trimmables.lock();
      trimmables.retain(|trimmable| trimmable.is_alive());
      trimmables.clone()
    };
    tracing::debug!(%trim_type, trimmables = snapshot.len(), "broadcasting memory trim");
    for trimmable in snapshot {
      trimmable.trim(trim_type);
    }
  }
}

impl MemoryTrimmableRegistry for TrimRegistry {
  fn register_memory_trimmable(&self, trimmable: Arc<dyn MemoryTrimmable>) {
    let mut trimmables = self.trimmables.lock();
    trimmables.retain(|registered| registered.is_alive());
    trimmables.push(trimmable);
  }

  fn unregister_memory_trimmable(&self, trimmable: &Arc<dyn MemoryTrimmable>) {
    self
      .trimmables
      .lock()
      .retain(|registered| !Arc::ptr_eq(registered, trimmable));
  }
}

impl fmt::Debug for TrimRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TrimRegistry")
      .field("trimmables", &self.len())
      .finish()
  }
}
