//! The push-based, cancellable protocol between pipeline stages.
//!
//! A [`Producer`] is handed a [`Consumer`] and a shared [`ProducerContext`];
//! it delivers results to the consumer from whatever thread finishes the
//! work, and watches the context for cancellation and priority changes.

pub mod consumer;
pub mod context;
pub mod listener;
pub mod request;
pub mod status;

pub use consumer::{BaseConsumer, Consumer};
pub use context::{ProducerContext, ProducerContextCallbacks};
pub use listener::{
  ExtraMap, ForwardingImageOriginListener, ForwardingProducerListener, ImageOriginListener,
  ImageOriginRequestListener, NoOpProducerListener, ProducerListener,
};
pub use request::{ImageRequest, RequestLevel, ResizeOptions, RotationOptions};
pub use status::{Priority, Status};

use std::sync::Arc;

/// A pipeline stage.
pub trait Producer<T>: Send + Sync {
  /// Starts producing results for `context` into `consumer`. Must not block
  /// on the work itself.
  fn produce_results(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<ProducerContext>);
}

impl<T, P> Producer<T> for Arc<P>
where
  P: Producer<T> + ?Sized,
{
  fn produce_results(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<ProducerContext>) {
    (**self).produce_results(consumer, context)
  }
}
