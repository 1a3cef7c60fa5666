use crate::error::PipelineError;
use crate::image::EncodedImage;
use crate::listener::report;
use crate::producers::{Consumer, ExtraMap, Producer, ProducerContext, ProducerContextCallbacks, Status};
use crate::reference::CloseableRef;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::HashMapExt;
use parking_lot::ReentrantMutex;

pub const NETWORK_FETCH_PRODUCER: &str = "NetworkFetchProducer";

/// The origin recorded for results that came from the fetcher.
pub const NETWORK_ORIGIN: &str = "network";

/// Per-request state handed to a [`NetworkFetcher`].
#[derive(Clone)]
pub struct FetchState {
  context: Arc<ProducerContext>,
  submit_time: Instant,
}

impl FetchState {
  fn new(context: Arc<ProducerContext>) -> Self {
    Self {
      context,
      submit_time: Instant::now(),
    }
  }

  pub fn context(&self) -> &Arc<ProducerContext> {
    &self.context
  }

  pub fn id(&self) -> &str {
    self.context.id()
  }

  pub fn uri(&self) -> &str {
    self.context.request().source_uri()
  }

  pub fn submit_time(&self) -> Instant {
    self.submit_time
  }

  pub fn elapsed(&self) -> Duration {
    self.submit_time.elapsed()
  }
}

impl fmt::Debug for FetchState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchState")
      .field("id", &self.id())
      .field("uri", &self.uri())
      .field("elapsed", &self.elapsed())
      .finish()
  }
}

/// Downloads encoded bytes.
///
/// `fetch` must not block on the download; the fetcher reports through the
/// [`FetchCallback`] from whatever thread finishes the work, and should stop
/// once the callback reports [`FetchCallback::is_finished`].
pub trait NetworkFetcher: Send + Sync {
  fn fetch(&self, state: &FetchState, callback: FetchCallback);

  /// Whether an intermediate result should be passed on right now. Lets a
  /// fetcher throttle progressive updates.
  fn should_propagate(&self, _state: &FetchState) -> bool {
    true
  }

  /// Called once the full response has arrived, before it is delivered.
  fn on_fetch_completion(&self, _state: &FetchState, _byte_size: usize) {}

  /// Extra diagnostics for the producer listener.
  fn extra_map(&self, _state: &FetchState, _byte_size: usize) -> Option<ExtraMap> {
    None
  }
}

struct CallbackInner {
  state: FetchState,
  consumer: Arc<dyn Consumer<CloseableRef<EncodedImage>>>,
  fetcher: Arc<dyn NetworkFetcher>,
  delivery: ReentrantMutex<()>,
  finished: AtomicBool,
}

/// The fetcher's handle for reporting one request's outcome.
///
/// Cloneable. Only the first terminal call (`on_response`, `on_failure` or
/// `on_cancellation`) has any effect.
#[derive(Clone)]
pub struct FetchCallback {
  inner: Arc<CallbackInner>,
}

impl FetchCallback {
  fn new(
    state: FetchState,
    consumer: Arc<dyn Consumer<CloseableRef<EncodedImage>>>,
    fetcher: Arc<dyn NetworkFetcher>,
  ) -> Self {
    Self {
      inner: Arc::new(CallbackInner {
        state,
        consumer,
        fetcher,
        delivery: ReentrantMutex::new(()),
        finished: AtomicBool::new(false),
      }),
    }
  }

  pub fn state(&self) -> &FetchState {
    &self.inner.state
  }

  pub fn is_finished(&self) -> bool {
    self.inner.finished.load(Ordering::Acquire)
  }

  fn finish_with<F: FnOnce(&CallbackInner)>(&self, deliver: F) -> bool {
    let inner = &*self.inner;
    let _delivery = inner.delivery.lock();
    if inner.finished.swap(true, Ordering::AcqRel) {
      return false;
    }
    deliver(inner);
    true
  }

  /// Reports the bytes downloaded so far.
  pub fn on_partial(&self, bytes: impl Into<Arc<[u8]>>, progress: f32) {
    let inner = &*self.inner;
    let _delivery = inner.delivery.lock();
    if inner.finished.load(Ordering::Acquire) {
      return;
    }
    let context = inner.state.context();
    if context.is_intermediate_result_expected() && inner.fetcher.should_propagate(&inner.state) {
      report(
        "on_producer_event",
        context
          .listener()
          .on_producer_event(context.id(), NETWORK_FETCH_PRODUCER, "intermediate_result"),
      );
      let partial = CloseableRef::new(EncodedImage::new(bytes));
      inner.consumer.on_new_result(Some(&partial), Status::NO_FLAGS);
    }
    inner.consumer.on_progress_update(progress.clamp(0.0, 1.0));
  }

  /// Reports the complete response.
  pub fn on_response(&self, bytes: impl Into<Arc<[u8]>>) {
    let bytes: Arc<[u8]> = bytes.into();
    self.finish_with(|inner| {
      let state = &inner.state;
      let context = state.context();
      inner.fetcher.on_fetch_completion(state, bytes.len());

      let listener = context.listener();
      let extras = listener.requires_extra_map(context.id()).then(|| {
        let mut extras = inner.fetcher.extra_map(state, bytes.len()).unwrap_or_else(ExtraMap::new);
        extras.insert("total_time_ms".to_string(), state.elapsed().as_millis().to_string());
        extras
      });
      tracing::trace!(request = context.id(), bytes = bytes.len(), "fetch complete");
      report(
        "on_producer_finish_with_success",
        listener.on_producer_finish_with_success(context.id(), NETWORK_FETCH_PRODUCER, extras.as_ref()),
      );
      report(
        "on_ultimate_producer_reached",
        listener.on_ultimate_producer_reached(context.id(), NETWORK_FETCH_PRODUCER, true),
      );
      context.set_origin(NETWORK_ORIGIN);

      let encoded = CloseableRef::new(EncodedImage::new(bytes));
      inner.consumer.on_progress_update(1.0);
      inner.consumer.on_new_result(Some(&encoded), Status::IS_LAST);
    });
  }

  pub fn on_failure(&self, error: PipelineError) {
    self.finish_with(|inner| {
      let context = inner.state.context();
      let listener = context.listener();
      tracing::debug!(request = context.id(), uri = inner.state.uri(), %error, "fetch failed");
      report(
        "on_producer_finish_with_failure",
        listener.on_producer_finish_with_failure(context.id(), NETWORK_FETCH_PRODUCER, &error, None),
      );
      report(
        "on_ultimate_producer_reached",
        listener.on_ultimate_producer_reached(context.id(), NETWORK_FETCH_PRODUCER, false),
      );
      inner.consumer.on_failure(&error);
    });
  }

  pub fn on_cancellation(&self) {
    self.finish_with(|inner| {
      let context = inner.state.context();
      report(
        "on_producer_finish_with_cancellation",
        context
          .listener()
          .on_producer_finish_with_cancellation(context.id(), NETWORK_FETCH_PRODUCER, None),
      );
      inner.consumer.on_cancellation();
    });
  }
}

impl fmt::Debug for FetchCallback {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchCallback")
      .field("state", &self.inner.state)
      .field("finished", &self.is_finished())
      .finish()
  }
}

// Holds the callback weakly: the context would otherwise own itself through it.
struct CancelFetch(Weak<CallbackInner>);

impl ProducerContextCallbacks for CancelFetch {
  fn on_cancellation_requested(&self) {
    if let Some(inner) = self.0.upgrade() {
      FetchCallback { inner }.on_cancellation();
    }
  }
}

/// The last stage of the pipeline: hands the request to a [`NetworkFetcher`].
pub struct NetworkFetchProducer {
  fetcher: Arc<dyn NetworkFetcher>,
}

impl NetworkFetchProducer {
  pub fn new(fetcher: Arc<dyn NetworkFetcher>) -> Self {
    Self { fetcher }
  }
}

impl fmt::Debug for NetworkFetchProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NetworkFetchProducer").finish_non_exhaustive()
  }
}

impl Producer<CloseableRef<EncodedImage>> for NetworkFetchProducer {
  fn produce_results(
    &self,
    consumer: Arc<dyn Consumer<CloseableRef<EncodedImage>>>,
    context: Arc<ProducerContext>,
  ) {
    report(
      "on_producer_start",
      context.listener().on_producer_start(context.id(), NETWORK_FETCH_PRODUCER),
    );
    let callback = FetchCallback::new(
      FetchState::new(Arc::clone(&context)),
      consumer,
      Arc::clone(&self.fetcher),
    );
    context.add_callbacks(Arc::new(CancelFetch(Arc::downgrade(&callback.inner))));
    if callback.is_finished() {
      return;
    }
    tracing::trace!(request = context.id(), uri = context.request().source_uri(), "starting fetch");
    self.fetcher.fetch(callback.state(), callback.clone());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::producers::{ImageRequest, NoOpProducerListener};
  use parking_lot::Mutex;

  #[derive(Default)]
  struct Parked(Mutex<Vec<FetchCallback>>);

  impl NetworkFetcher for Parked {
    fn fetch(&self, _state: &FetchState, callback: FetchCallback) {
      self.0.lock().push(callback);
    }
  }

  #[derive(Default)]
  struct Collect {
    events: Mutex<Vec<String>>,
  }

  impl Consumer<CloseableRef<EncodedImage>> for Collect {
    fn on_new_result(&self, result: Option<&CloseableRef<EncodedImage>>, status: Status) {
      let len = result.and_then(|r| r.get().ok()).map_or(0, |e| e.bytes().len());
      self.events.lock().push(format!("result:{len}:{}", status.is_last()));
    }
    fn on_failure(&self, error: &PipelineError) {
      self.events.lock().push(format!("failure:{error}"));
    }
    fn on_cancellation(&self) {
      self.events.lock().push("cancel".to_string());
    }
  }

  fn start(progressive: bool) -> (Arc<Parked>, Arc<Collect>, Arc<ProducerContext>) {
    let fetcher = Arc::new(Parked::default());
    let producer = NetworkFetchProducer::new(fetcher.clone());
    let consumer = Arc::new(Collect::default());
    let request = ImageRequest::new("https://example.com/a.jpg").with_progressive_rendering(progressive);
    let context = Arc::new(ProducerContext::new("1", request, Arc::new(NoOpProducerListener)));
    producer.produce_results(consumer.clone(), Arc::clone(&context));
    (fetcher, consumer, context)
  }

  #[test]
  fn response_is_delivered_once() {
    let (fetcher, consumer, context) = start(true);
    let callback = fetcher.0.lock()[0].clone();
    callback.on_partial(vec![1u8], 0.5);
    callback.on_response(vec![1u8, 2, 3]);
    callback.on_failure(PipelineError::other("late"));

    assert_eq!(*consumer.events.lock(), vec!["result:1:false", "result:3:true"]);
    assert_eq!(context.extra(crate::producers::context::ORIGIN_EXTRA).as_deref(), Some(NETWORK_ORIGIN));
  }

  #[test]
  fn cancelling_context_cancels_fetch() {
    let (fetcher, consumer, context) = start(false);
    let callback = fetcher.0.lock()[0].clone();
    context.cancel();
    assert!(callback.is_finished());
    callback.on_response(vec![1u8]);
    assert_eq!(*consumer.events.lock(), vec!["cancel"]);
  }
}
