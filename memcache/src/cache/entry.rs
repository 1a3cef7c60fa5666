use super::EntryStateObserver;
use crate::reference::CloseableRef;

use std::fmt;
use std::sync::Arc;

/// Where an entry stands with respect to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
  /// Indexed, no clients, queued for eviction.
  Exclusive,
  /// Indexed and held by `clients` client handles. Never evicted.
  InUse { clients: usize },
  /// Removed from the index while clients still held it. Lives in the arena
  /// until the last client closes.
  Orphan { clients: usize },
}

pub(crate) struct CacheEntry<K, V> {
  pub(crate) key: K,
  /// The cache's own handle. Client handles are derived from it.
  pub(crate) value_ref: CloseableRef<V>,
  pub(crate) size_in_bytes: u64,
  pub(crate) state: EntryState,
  pub(crate) observer: Option<Arc<dyn EntryStateObserver<K>>>,
}

impl<K, V> CacheEntry<K, V> {
  pub(crate) fn new(
    key: K,
    value_ref: CloseableRef<V>,
    size_in_bytes: u64,
    observer: Option<Arc<dyn EntryStateObserver<K>>>,
  ) -> Self {
    Self {
      key,
      value_ref,
      size_in_bytes,
      state: EntryState::InUse { clients: 1 },
      observer,
    }
  }

  #[inline]
  pub(crate) fn is_exclusive(&self) -> bool {
    self.state == EntryState::Exclusive
  }

  /// Records one more client handle.
  pub(crate) fn add_client(&mut self) {
    self.state = match self.state {
      EntryState::Exclusive => EntryState::InUse { clients: 1 },
      EntryState::InUse { clients } => EntryState::InUse {
        clients: clients + 1,
      },
      EntryState::Orphan { clients } => EntryState::Orphan {
        clients: clients + 1,
      },
    };
  }
}

impl<K: fmt::Debug, V> fmt::Debug for CacheEntry<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheEntry")
      .field("key", &self.key)
      .field("size_in_bytes", &self.size_in_bytes)
      .field("state", &self.state)
      .field("has_observer", &self.observer.is_some())
      .finish()
  }
}
