//! Manually reference-counted resource handles.
//!
//! A [`CloseableRef`] wraps a value together with a [`ResourceReleaser`]. Every
//! live handle holds one count on a shared state; cloning a handle adds one,
//! closing (or dropping) a handle removes one. When the last handle goes away
//! the value is moved into the releaser, exactly once, on whichever thread
//! closed that last handle.

use crate::error::ReferenceError;

use std::fmt;
use std::sync::Arc;

/// Receives a value once its last reference has been closed.
pub trait ResourceReleaser<T>: Send + Sync {
  fn release(&self, value: T);
}

impl<T, F> ResourceReleaser<T> for F
where
  F: Fn(T) + Send + Sync,
{
  fn release(&self, value: T) {
    self(value)
  }
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

enum Slot<T> {
  /// The shared state owns the value and hands it to `releaser` on drop.
  Owned {
    value: Option<T>,
    releaser: Arc<dyn ResourceReleaser<T>>,
  },
  /// The shared state borrows the value of a parent and keeps it alive.
  Derived {
    parent: Option<Arc<SharedReference<T>>>,
    on_release: Option<ReleaseHook>,
  },
}

/// The state shared by all clones of one handle.
///
/// The `Arc` strong count around it is the reference count; `Drop` runs once,
/// after the final decrement has been observed.
struct SharedReference<T> {
  slot: Slot<T>,
}

impl<T> SharedReference<T> {
  fn value(&self) -> Option<&T> {
    match &self.slot {
      Slot::Owned { value, .. } => value.as_ref(),
      Slot::Derived { parent, .. } => parent.as_ref().and_then(|p| p.value()),
    }
  }
}

impl<T> Drop for SharedReference<T> {
  fn drop(&mut self) {
    match &mut self.slot {
      Slot::Owned { value, releaser } => {
        let value = value.take();
        debug_assert!(value.is_some(), "shared reference released twice");
        if let Some(value) = value {
          releaser.release(value);
        }
      }
      Slot::Derived { parent, on_release } => {
        if let Some(hook) = on_release.take() {
          hook();
        }
        // Dropping the parent last lets the hook observe a live value.
        drop(parent.take());
      }
    }
  }
}

/// A reference-counted handle to a releasable value.
///
/// Dropping a handle closes it. `close` can also be called explicitly; it is
/// idempotent for a given handle.
pub struct CloseableRef<T> {
  shared: Option<Arc<SharedReference<T>>>,
}

impl<T> CloseableRef<T> {
  /// Wraps `value`; `releaser` receives it when the last handle closes.
  pub fn of<R>(value: T, releaser: R) -> Self
  where
    R: ResourceReleaser<T> + 'static,
  {
    Self::with_releaser(value, Arc::new(releaser))
  }

  /// Like [`CloseableRef::of`], sharing an existing releaser.
  pub fn with_releaser(value: T, releaser: Arc<dyn ResourceReleaser<T>>) -> Self {
    Self {
      shared: Some(Arc::new(SharedReference {
        slot: Slot::Owned {
          value: Some(value),
          releaser,
        },
      })),
    }
  }

  /// Wraps a value that needs no release action beyond being dropped.
  pub fn new(value: T) -> Self
  where
    T: 'static,
  {
    Self::of(value, |_: T| {})
  }

  /// Wraps an optional value, failing with [`ReferenceError::NullValue`] for `None`.
  pub fn of_optional<R>(value: Option<T>, releaser: R) -> Result<Self, ReferenceError>
  where
    R: ResourceReleaser<T> + 'static,
  {
    value
      .map(|v| Self::of(v, releaser))
      .ok_or(ReferenceError::NullValue)
  }

  /// Creates a handle with its own reference count that borrows `parent`'s value.
  ///
  /// The new handle keeps the parent's shared state alive. When its last clone
  /// closes, `on_release` runs first and the parent count is dropped after.
  pub fn derived<F>(parent: &CloseableRef<T>, on_release: F) -> Result<Self, ReferenceError>
  where
    F: FnOnce() + Send + Sync + 'static,
  {
    let parent = parent.shared.as_ref().ok_or(ReferenceError::Closed)?;
    Ok(Self {
      shared: Some(Arc::new(SharedReference {
        slot: Slot::Derived {
          parent: Some(Arc::clone(parent)),
          on_release: Some(Box::new(on_release)),
        },
      })),
    })
  }

  /// Returns the wrapped value.
  pub fn get(&self) -> Result<&T, ReferenceError> {
    self
      .shared
      .as_ref()
      .and_then(|shared| shared.value())
      .ok_or(ReferenceError::Closed)
  }

  /// Returns a new handle to the same value, incrementing the shared count.
  pub fn try_clone(&self) -> Result<Self, ReferenceError> {
    let shared = self.shared.as_ref().ok_or(ReferenceError::Closed)?;
    Ok(Self {
      shared: Some(Arc::clone(shared)),
    })
  }

  /// Clones the handle if it is still valid.
  #[inline]
  pub fn clone_or_none(&self) -> Option<Self> {
    self.try_clone().ok()
  }

  /// Closes this handle. The value is released if this was the last one.
  pub fn close(&mut self) {
    self.shared.take();
  }

  /// Closes every handle in `refs`.
  pub fn close_all<I>(refs: I)
  where
    I: IntoIterator<Item = Option<Self>>,
  {
    for mut r in refs.into_iter().flatten() {
      r.close();
    }
  }

  /// Returns `true` while this handle is open.
  #[inline]
  pub fn is_valid(&self) -> bool {
    self.shared.is_some()
  }

  /// Returns `true` if `r` is present and open.
  #[inline]
  pub fn is_valid_opt(r: Option<&Self>) -> bool {
    r.is_some_and(|r| r.is_valid())
  }

  /// The number of live handles sharing this handle's state, or 0 once closed.
  ///
  /// Only meaningful as a diagnostic when other threads may be cloning.
  pub fn underlying_reference_count(&self) -> usize {
    self.shared.as_ref().map_or(0, Arc::strong_count)
  }

  /// Returns `true` if both handles resolve to the same underlying value.
  pub fn same_value(&self, other: &Self) -> bool {
    match (self.get(), other.get()) {
      (Ok(a), Ok(b)) => std::ptr::eq(a, b),
      _ => false,
    }
  }
}

impl<T: fmt::Debug> fmt::Debug for CloseableRef<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CloseableRef")
      .field("value", &self.get().ok())
      .field("ref_count", &self.underlying_reference_count())
      .finish()
  }
}

/// A result type that can hand out an independent copy of itself.
///
/// The multiplexer uses this to retain the last intermediate result for late
/// subscribers without sharing a handle one of them might close.
pub trait Shareable: Sized {
  fn share(&self) -> Option<Self>;
}

impl<T> Shareable for CloseableRef<T> {
  fn share(&self) -> Option<Self> {
    self.clone_or_none()
  }
}

impl<T> Shareable for Arc<T> {
  fn share(&self) -> Option<Self> {
    Some(Arc::clone(self))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Barrier;
  use std::thread;

  fn counting_releaser(counter: &Arc<AtomicUsize>) -> impl Fn(String) + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn release_runs_on_last_close() {
    let released = Arc::new(AtomicUsize::new(0));
    let mut a = CloseableRef::of("bitmap".to_string(), counting_releaser(&released));
    let mut b = a.try_clone().unwrap();
    assert_eq!(a.underlying_reference_count(), 2);

    a.close();
    assert_eq!(released.load(Ordering::SeqCst), 0);
    assert_eq!(b.get().unwrap(), "bitmap");

    b.close();
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn close_is_idempotent_per_handle() {
    let released = Arc::new(AtomicUsize::new(0));
    let mut a = CloseableRef::of("x".to_string(), counting_releaser(&released));
    let b = a.try_clone().unwrap();
    a.close();
    a.close();
    assert!(b.is_valid());
    assert_eq!(released.load(Ordering::SeqCst), 0);
    drop(b);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn closed_handle_rejects_access() {
    let mut a = CloseableRef::new(7u32);
    a.close();
    assert!(!a.is_valid());
    assert_eq!(a.get(), Err(ReferenceError::Closed));
    assert!(a.try_clone().is_err());
    assert!(a.clone_or_none().is_none());
    assert_eq!(a.underlying_reference_count(), 0);
    assert!(!CloseableRef::is_valid_opt(Some(&a)));
    assert!(!CloseableRef::<u32>::is_valid_opt(None));
  }

  #[test]
  fn optional_value_must_be_present() {
    let r = CloseableRef::of_optional(None::<u8>, |_: u8| {});
    assert_eq!(r.err(), Some(ReferenceError::NullValue));
    let r = CloseableRef::of_optional(Some(1u8), |_: u8| {}).unwrap();
    assert_eq!(*r.get().unwrap(), 1);
  }

  #[test]
  fn derived_runs_hook_before_dropping_parent() {
    let released = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let mut parent = CloseableRef::of("img".to_string(), counting_releaser(&released));

    let derived = {
      let hook_calls = Arc::clone(&hook_calls);
      let released = Arc::clone(&released);
      CloseableRef::derived(&parent, move || {
        // The parent value must still be alive while the hook runs.
        assert_eq!(released.load(Ordering::SeqCst), 0);
        hook_calls.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap()
    };
    let derived_clone = derived.try_clone().unwrap();
    assert_eq!(parent.underlying_reference_count(), 2);
    assert!(derived.same_value(&parent));

    parent.close();
    drop(derived);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    assert_eq!(derived_clone.get().unwrap(), "img");

    drop(derived_clone);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn derived_from_closed_parent_fails() {
    let mut parent = CloseableRef::new(1u8);
    parent.close();
    assert!(CloseableRef::derived(&parent, || {}).is_err());
  }

  #[test]
  fn concurrent_closes_release_once() {
    let released = Arc::new(AtomicUsize::new(0));
    let root = CloseableRef::of("shared".to_string(), counting_releaser(&released));
    let num_threads = 16;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
      .map(|_| {
        let mut clone = root.try_clone().unwrap();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
          barrier.wait();
          clone.close();
        })
      })
      .collect();

    drop(root);
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }
}
