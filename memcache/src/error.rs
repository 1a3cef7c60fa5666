use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by [`CloseableRef`](crate::reference::CloseableRef) accessors.
///
/// These always indicate a caller bug: a handle was used after it was closed,
/// or a handle was requested for a value that does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReferenceError {
  /// The handle (or the shared state behind it) has already been closed.
  #[error("attempted to use a closed reference")]
  Closed,
  /// A reference was requested for a missing value.
  #[error("cannot create a reference to a missing value")]
  NullValue,
}

/// Internal invariant violations inside the counting cache.
///
/// Not user-facing. They are asserted in debug builds and logged otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// An index slot pointed at an entry stored under a different key.
  #[error("cache index points at an entry stored under a different key")]
  KeyMismatch,
}

/// Errors that can occur when building a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuildError {
  /// No network fetcher was configured.
  #[error("an image pipeline requires a network fetcher")]
  MissingFetcher,
  /// No decoder was configured.
  #[error("an image pipeline requires a decoder")]
  MissingDecoder,
}

/// The error type returned by observability hooks.
pub type ListenerError = Box<dyn StdError + Send + Sync>;

/// The result type returned by observability hooks.
pub type ListenerResult = Result<(), ListenerError>;

/// A failure travelling down the pipeline through `Consumer::on_failure`.
///
/// The payload is reference counted so the same failure can be fanned out to
/// any number of subscribers.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
  /// The network fetcher reported a failure.
  #[error("fetch failed: {0}")]
  Fetch(Arc<dyn StdError + Send + Sync>),
  /// The decoder rejected the encoded bytes.
  #[error("decode failed: {0}")]
  Decode(Arc<dyn StdError + Send + Sync>),
  /// A handle used while producing the result was already closed.
  #[error(transparent)]
  Reference(#[from] ReferenceError),
  /// Any other failure, described by a message.
  #[error("{0}")]
  Other(String),
}

impl PipelineError {
  /// Wraps an arbitrary error as a fetch failure.
  pub fn fetch<E>(error: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    PipelineError::Fetch(Arc::new(error))
  }

  /// Wraps an arbitrary error as a decode failure.
  pub fn decode<E>(error: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    PipelineError::Decode(Arc::new(error))
  }

  /// Creates a failure from a plain message.
  pub fn other(message: impl fmt::Display) -> Self {
    PipelineError::Other(message.to_string())
  }
}
