use super::listener::{ExtraMap, ProducerListener};
use super::request::{ImageRequest, RequestLevel};
use super::status::Priority;

use std::fmt;
use std::sync::Arc;

use ahash::HashMapExt;
use parking_lot::Mutex;

/// The extra key under which stages record where a result came from.
pub const ORIGIN_EXTRA: &str = "origin";

/// Observes the mutable fields of a [`ProducerContext`].
///
/// Callbacks run on the thread that changed the field, after the context's
/// lock has been released.
pub trait ProducerContextCallbacks: Send + Sync {
  fn on_cancellation_requested(&self) {}
  fn on_is_prefetch_changed(&self) {}
  fn on_is_intermediate_result_expected_changed(&self) {}
  fn on_priority_changed(&self) {}
}

/// The callbacks a `*_no_callbacks` setter returns when the value changed.
pub type PendingCallbacks = Option<Vec<Arc<dyn ProducerContextCallbacks>>>;

struct ContextState {
  priority: Priority,
  is_prefetch: bool,
  is_intermediate_result_expected: bool,
  is_cancelled: bool,
  callbacks: Vec<Arc<dyn ProducerContextCallbacks>>,
  extras: ExtraMap,
}

/// Per-request state shared by every stage of a pipeline.
///
/// The request itself is immutable; priority, prefetch, the intermediate
/// results flag and cancellation can change while the request runs, and
/// registered [`ProducerContextCallbacks`] hear about every change. Setting a
/// field to its current value fires nothing.
pub struct ProducerContext {
  id: String,
  request: ImageRequest,
  listener: Arc<dyn ProducerListener>,
  lowest_permitted_request_level: RequestLevel,
  state: Mutex<ContextState>,
}

impl ProducerContext {
  /// A context at medium priority that inherits the request's level and
  /// progressive-rendering setting.
  pub fn new(id: impl Into<String>, request: ImageRequest, listener: Arc<dyn ProducerListener>) -> Self {
    let lowest_permitted_request_level = request.lowest_permitted_request_level();
    let is_intermediate_result_expected = request.progressive_rendering_enabled();
    Self {
      id: id.into(),
      request,
      listener,
      lowest_permitted_request_level,
      state: Mutex::new(ContextState {
        priority: Priority::Medium,
        is_prefetch: false,
        is_intermediate_result_expected,
        is_cancelled: false,
        callbacks: Vec::new(),
        extras: ExtraMap::new(),
      }),
    }
  }

  pub fn with_priority(self, priority: Priority) -> Self {
    self.state.lock().priority = priority;
    self
  }

  pub fn with_prefetch(self, is_prefetch: bool) -> Self {
    self.state.lock().is_prefetch = is_prefetch;
    self
  }

  pub fn with_intermediate_result_expected(self, expected: bool) -> Self {
    self.state.lock().is_intermediate_result_expected = expected;
    self
  }

  pub fn with_lowest_permitted_request_level(mut self, level: RequestLevel) -> Self {
    self.lowest_permitted_request_level = level;
    self
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn request(&self) -> &ImageRequest {
    &self.request
  }

  pub fn listener(&self) -> &Arc<dyn ProducerListener> {
    &self.listener
  }

  pub fn lowest_permitted_request_level(&self) -> RequestLevel {
    self.lowest_permitted_request_level
  }

  pub fn priority(&self) -> Priority {
    self.state.lock().priority
  }

  pub fn is_prefetch(&self) -> bool {
    self.state.lock().is_prefetch
  }

  pub fn is_intermediate_result_expected(&self) -> bool {
    self.state.lock().is_intermediate_result_expected
  }

  pub fn is_cancelled(&self) -> bool {
    self.state.lock().is_cancelled
  }

  /// Registers `callbacks`. If the context is already cancelled,
  /// `on_cancellation_requested` fires immediately.
  pub fn add_callbacks(&self, callbacks: Arc<dyn ProducerContextCallbacks>) {
    let cancelled = {
      let mut state = self.state.lock();
      state.callbacks.push(Arc::clone(&callbacks));
      state.is_cancelled
    };
    if cancelled {
      callbacks.on_cancellation_requested();
    }
  }

  /// Cancels the request and notifies the callbacks. Idempotent.
  pub fn cancel(&self) {
    Self::call_on_cancellation_requested(self.cancel_no_callbacks());
  }

  pub fn cancel_no_callbacks(&self) -> PendingCallbacks {
    let mut state = self.state.lock();
    if state.is_cancelled {
      return None;
    }
    state.is_cancelled = true;
    Some(state.callbacks.clone())
  }

  pub fn set_priority(&self, priority: Priority) {
    Self::call_on_priority_changed(self.set_priority_no_callbacks(priority));
  }

  pub fn set_priority_no_callbacks(&self, priority: Priority) -> PendingCallbacks {
    let mut state = self.state.lock();
    if state.priority == priority {
      return None;
    }
    state.priority = priority;
    Some(state.callbacks.clone())
  }

  pub fn set_is_prefetch(&self, is_prefetch: bool) {
    Self::call_on_is_prefetch_changed(self.set_is_prefetch_no_callbacks(is_prefetch));
  }

  pub fn set_is_prefetch_no_callbacks(&self, is_prefetch: bool) -> PendingCallbacks {
    let mut state = self.state.lock();
    if state.is_prefetch == is_prefetch {
      return None;
    }
    state.is_prefetch = is_prefetch;
    Some(state.callbacks.clone())
  }

  pub fn set_is_intermediate_result_expected(&self, expected: bool) {
    Self::call_on_is_intermediate_result_expected_changed(
      self.set_is_intermediate_result_expected_no_callbacks(expected),
    );
  }

  pub fn set_is_intermediate_result_expected_no_callbacks(&self, expected: bool) -> PendingCallbacks {
    let mut state = self.state.lock();
    if state.is_intermediate_result_expected == expected {
      return None;
    }
    state.is_intermediate_result_expected = expected;
    Some(state.callbacks.clone())
  }

  pub fn call_on_cancellation_requested(callbacks: PendingCallbacks) {
    for callback in callbacks.into_iter().flatten() {
      callback.on_cancellation_requested();
    }
  }

  pub fn call_on_priority_changed(callbacks: PendingCallbacks) {
    for callback in callbacks.into_iter().flatten() {
      callback.on_priority_changed();
    }
  }

  pub fn call_on_is_prefetch_changed(callbacks: PendingCallbacks) {
    for callback in callbacks.into_iter().flatten() {
      callback.on_is_prefetch_changed();
    }
  }

  pub fn call_on_is_intermediate_result_expected_changed(callbacks: PendingCallbacks) {
    for callback in callbacks.into_iter().flatten() {
      callback.on_is_intermediate_result_expected_changed();
    }
  }

  pub fn set_extra(&self, key: impl Into<String>, value: impl Into<String>) {
    self.state.lock().extras.insert(key.into(), value.into());
  }

  /// Merges `extras` into this context's extras, overwriting existing keys.
  pub fn put_extras(&self, extras: ExtraMap) {
    self.state.lock().extras.extend(extras);
  }

  pub fn extra(&self, key: &str) -> Option<String> {
    self.state.lock().extras.get(key).cloned()
  }

  pub fn extras(&self) -> ExtraMap {
    self.state.lock().extras.clone()
  }

  /// Records which stage served the result, e.g. `"memory_bitmap"`.
  pub fn set_origin(&self, origin: &str) {
    self.set_extra(ORIGIN_EXTRA, origin);
  }
}

impl fmt::Debug for ProducerContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("ProducerContext")
      .field("id", &self.id)
      .field("request", &self.request)
      .field("priority", &state.priority)
      .field("is_prefetch", &state.is_prefetch)
      .field("is_cancelled", &state.is_cancelled)
      .field("callbacks", &state.callbacks.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::producers::listener::NoOpProducerListener;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct Counting {
    cancellations: AtomicUsize,
    priority_changes: AtomicUsize,
    prefetch_changes: AtomicUsize,
  }

  impl ProducerContextCallbacks for Counting {
    fn on_cancellation_requested(&self) {
      self.cancellations.fetch_add(1, Ordering::SeqCst);
    }
    fn on_priority_changed(&self) {
      self.priority_changes.fetch_add(1, Ordering::SeqCst);
    }
    fn on_is_prefetch_changed(&self) {
      self.prefetch_changes.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn context() -> ProducerContext {
    ProducerContext::new("1", ImageRequest::new("u"), Arc::new(NoOpProducerListener))
  }

  #[test]
  fn unchanged_values_fire_nothing() {
    let context = context();
    let counting = Arc::new(Counting::default());
    context.add_callbacks(counting.clone());

    context.set_priority(Priority::Medium);
    context.set_is_prefetch(false);
    assert_eq!(counting.priority_changes.load(Ordering::SeqCst), 0);
    assert_eq!(counting.prefetch_changes.load(Ordering::SeqCst), 0);

    context.set_priority(Priority::High);
    context.set_is_prefetch(true);
    assert_eq!(counting.priority_changes.load(Ordering::SeqCst), 1);
    assert_eq!(counting.prefetch_changes.load(Ordering::SeqCst), 1);
    assert!(context.set_priority_no_callbacks(Priority::High).is_none());
  }

  #[test]
  fn cancel_is_idempotent() {
    let context = context();
    let counting = Arc::new(Counting::default());
    context.add_callbacks(counting.clone());

    context.cancel();
    context.cancel();
    assert!(context.is_cancelled());
    assert_eq!(counting.cancellations.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn late_callbacks_hear_about_cancellation() {
    let context = context();
    context.cancel();

    let counting = Arc::new(Counting::default());
    context.add_callbacks(counting.clone());
    assert_eq!(counting.cancellations.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn extras_round_trip() {
    let context = context();
    context.set_origin("memory_bitmap");
    assert_eq!(context.extra(ORIGIN_EXTRA).as_deref(), Some("memory_bitmap"));
    assert_eq!(context.extras().len(), 1);
  }
}
