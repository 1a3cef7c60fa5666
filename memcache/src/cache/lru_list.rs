use std::hash::Hash;

use ahash::{HashMap, HashMapExt};
use generational_arena::{Arena, Index};

#[derive(Debug)]
struct Node<K> {
  key: K,
  size: u64,
  newer: Option<Index>,
  older: Option<Index>,
}

/// The ordered set of exclusively owned keys, oldest first out.
///
/// Nodes live in an arena and are linked by index; `lookup` gives O(1) access
/// from a key to its node, so promotion and removal never scan the list.
#[derive(Debug)]
pub(crate) struct EvictionQueue<K: Eq + Hash + Clone> {
  nodes: Arena<Node<K>>,
  lookup: HashMap<K, Index>,
  // Most recently added or probed.
  newest: Option<Index>,
  // Next eviction candidate.
  oldest: Option<Index>,
  size_in_bytes: u64,
}

impl<K: Eq + Hash + Clone> EvictionQueue<K> {
  pub(crate) fn new() -> Self {
    Self {
      nodes: Arena::new(),
      lookup: HashMap::new(),
      newest: None,
      oldest: None,
      size_in_bytes: 0,
    }
  }

  fn unlink(&mut self, index: Index) {
    let (newer, older) = {
      let node = &self.nodes[index];
      (node.newer, node.older)
    };

    match older {
      Some(older_idx) => self.nodes[older_idx].newer = newer,
      None => self.oldest = newer,
    }
    match newer {
      Some(newer_idx) => self.nodes[newer_idx].older = older,
      None => self.newest = older,
    }
  }

  fn link_newest(&mut self, index: Index) {
    let previous_newest = self.newest;
    self.nodes[index].older = previous_newest;
    self.nodes[index].newer = None;
    self.newest = Some(index);

    if let Some(prev) = previous_newest {
      self.nodes[prev].newer = Some(index);
    }
    if self.oldest.is_none() {
      self.oldest = Some(index);
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.lookup.len()
  }

  #[inline]
  pub(crate) fn size_in_bytes(&self) -> u64 {
    self.size_in_bytes
  }

  /// Appends `key` as the newest entry, or moves it there if already queued.
  pub(crate) fn push(&mut self, key: K, size: u64) {
    if let Some(&index) = self.lookup.get(&key) {
      let old_size = self.nodes[index].size;
      self.size_in_bytes = self.size_in_bytes.saturating_sub(old_size).saturating_add(size);
      self.nodes[index].size = size;
      self.touch(&key);
      return;
    }

    let index = self.nodes.insert(Node {
      key: key.clone(),
      size,
      newer: None,
      older: None,
    });
    self.lookup.insert(key, index);
    self.size_in_bytes = self.size_in_bytes.saturating_add(size);
    self.link_newest(index);
  }

  /// Marks `key` as the most recently used entry. Returns `false` if absent.
  pub(crate) fn touch(&mut self, key: &K) -> bool {
    match self.lookup.get(key) {
      Some(&index) => {
        if self.newest != Some(index) {
          self.unlink(index);
          self.link_newest(index);
        }
        true
      }
      None => false,
    }
  }

  pub(crate) fn pop_oldest(&mut self) -> Option<(K, u64)> {
    let index = self.oldest?;
    let key = self.nodes[index].key.clone();
    self.remove(&key).map(|size| (key, size))
  }

  /// Removes `key`, returning its size if it was queued.
  pub(crate) fn remove(&mut self, key: &K) -> Option<u64> {
    let index = self.lookup.remove(key)?;
    self.unlink(index);
    let node = self.nodes.remove(index)?;
    self.size_in_bytes = self.size_in_bytes.saturating_sub(node.size);
    Some(node.size)
  }

  #[cfg(test)]
  pub(crate) fn keys_oldest_first(&self) -> Vec<K> {
    let mut keys = Vec::with_capacity(self.len());
    let mut cursor = self.oldest;
    while let Some(index) = cursor {
      keys.push(self.nodes[index].key.clone());
      cursor = self.nodes[index].newer;
    }
    keys
  }
}
