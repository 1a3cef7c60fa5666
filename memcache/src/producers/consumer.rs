use super::status::Status;
use crate::error::PipelineError;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives the results of a producer.
///
/// A producer delivers zero or more non-last results, then exactly one
/// terminal signal: a result with [`Status::IS_LAST`], a failure, or a
/// cancellation. Calls may arrive on any thread.
pub trait Consumer<T>: Send + Sync {
  /// A new result. `None` is a valid terminal result meaning "nothing to show".
  fn on_new_result(&self, result: Option<&T>, status: Status);

  fn on_failure(&self, error: &PipelineError);

  fn on_cancellation(&self);

  /// Progress in `[0, 1]`.
  fn on_progress_update(&self, _progress: f32) {}
}

impl<T, C> Consumer<T> for Arc<C>
where
  C: Consumer<T> + ?Sized,
{
  fn on_new_result(&self, result: Option<&T>, status: Status) {
    (**self).on_new_result(result, status)
  }

  fn on_failure(&self, error: &PipelineError) {
    (**self).on_failure(error)
  }

  fn on_cancellation(&self) {
    (**self).on_cancellation()
  }

  fn on_progress_update(&self, progress: f32) {
    (**self).on_progress_update(progress)
  }
}

/// Enforces the terminal-signal contract on a consumer: everything after the
/// first terminal signal is dropped.
pub struct BaseConsumer<C> {
  inner: C,
  finished: AtomicBool,
}

impl<C> BaseConsumer<C> {
  pub fn new(inner: C) -> Self {
    Self {
      inner,
      finished: AtomicBool::new(false),
    }
  }

  pub fn is_finished(&self) -> bool {
    self.finished.load(Ordering::Acquire)
  }

  /// Returns `true` for the caller that claimed the terminal signal.
  fn finish(&self) -> bool {
    !self.finished.swap(true, Ordering::AcqRel)
  }
}

impl<T, C> Consumer<T> for BaseConsumer<C>
where
  C: Consumer<T>,
{
  fn on_new_result(&self, result: Option<&T>, status: Status) {
    if status.is_last() {
      if !self.finish() {
        return;
      }
    } else if self.is_finished() {
      return;
    }
    self.inner.on_new_result(result, status);
  }

  fn on_failure(&self, error: &PipelineError) {
    if self.finish() {
      self.inner.on_failure(error);
    }
  }

  fn on_cancellation(&self) {
    if self.finish() {
      self.inner.on_cancellation();
    }
  }

  fn on_progress_update(&self, progress: f32) {
    if !self.is_finished() {
      self.inner.on_progress_update(progress);
    }
  }
}

impl<C> fmt::Debug for BaseConsumer<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BaseConsumer")
      .field("finished", &self.is_finished())
      .finish_non_exhaustive()
  }
}
