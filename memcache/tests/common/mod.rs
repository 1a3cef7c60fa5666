#![allow(dead_code)]

use fibre_memcache::error::PipelineError;
use fibre_memcache::producers::{Consumer, Producer, ProducerContext, Status};
use fibre_memcache::reference::CloseableRef;
use fibre_memcache::stages::{DecodeOptions, FetchCallback, FetchState, NetworkFetcher};
use fibre_memcache::{CountingMemoryCache, DecodedImage, EncodedImage, MemoryCacheParams};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
  TRACING.call_once(|| {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  });
}

/// Counts how many values have been handed to the releaser.
#[derive(Clone, Default)]
pub struct ReleaseCounter(Arc<AtomicUsize>);

impl ReleaseCounter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn wrap(&self, value: &str) -> CloseableRef<String> {
    let counter = Arc::clone(&self.0);
    CloseableRef::of(value.to_string(), move |_: String| {
      counter.fetch_add(1, Ordering::SeqCst);
    })
  }

  pub fn released(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

/// A cache of strings where every value weighs one byte.
pub fn string_cache(params: MemoryCacheParams) -> CountingMemoryCache<&'static str, String> {
  CountingMemoryCache::builder()
    .params(params)
    .value_descriptor(|_: &String| 1u64)
    .build()
}

/// Everything a consumer was told, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
  Result(Option<T>, bool),
  Failure(String),
  Cancellation,
  Progress(f32),
}

/// Records every signal. `map` extracts a comparable value from a result.
pub struct Recorder<T, R> {
  map: fn(&T) -> R,
  events: Mutex<Vec<Event<R>>>,
  /// Client handles of final results, kept open until the test drops them.
  pub kept: Mutex<Vec<T>>,
}

impl<T, R> Recorder<T, R> {
  pub fn new(map: fn(&T) -> R) -> Arc<Self> {
    Arc::new(Self {
      map,
      events: Mutex::new(Vec::new()),
      kept: Mutex::new(Vec::new()),
    })
  }
}

impl<T, R: Clone> Recorder<T, R> {
  pub fn events(&self) -> Vec<Event<R>> {
    self.events.lock().clone()
  }

  /// The events without progress updates.
  pub fn signals(&self) -> Vec<Event<R>> {
    self
      .events()
      .into_iter()
      .filter(|e| !matches!(e, Event::Progress(_)))
      .collect()
  }

  pub fn is_done(&self) -> bool {
    self
      .events
      .lock()
      .iter()
      .any(|e| matches!(e, Event::Result(_, true) | Event::Failure(_) | Event::Cancellation))
  }

  /// Polls until a terminal signal arrives.
  pub fn wait_done(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
      if self.is_done() {
        return true;
      }
      std::thread::sleep(Duration::from_millis(2));
    }
    self.is_done()
  }
}

impl<T, R> Consumer<CloseableRef<T>> for Recorder<CloseableRef<T>, R>
where
  T: Send + Sync,
  R: Send + Sync,
{
  fn on_new_result(&self, result: Option<&CloseableRef<T>>, status: Status) {
    let mapped = result.map(|r| (self.map)(r));
    self.events.lock().push(Event::Result(mapped, status.is_last()));
    if status.is_last() {
      if let Some(handle) = result.and_then(CloseableRef::clone_or_none) {
        self.kept.lock().push(handle);
      }
    }
  }

  fn on_failure(&self, error: &PipelineError) {
    self.events.lock().push(Event::Failure(error.to_string()));
  }

  fn on_cancellation(&self) {
    self.events.lock().push(Event::Cancellation);
  }

  fn on_progress_update(&self, progress: f32) {
    self.events.lock().push(Event::Progress(progress));
  }
}

pub fn decoded_width(image: &CloseableRef<DecodedImage>) -> u32 {
  image.get().map_or(0, |i| i.width())
}

pub fn encoded_len(image: &CloseableRef<EncodedImage>) -> usize {
  image.get().map_or(0, |i| i.bytes().len())
}

/// A producer that parks every request until the test completes it.
pub struct ManualProducer<T> {
  pub started: Mutex<Vec<(Arc<dyn Consumer<T>>, Arc<ProducerContext>)>>,
}

impl<T> ManualProducer<T> {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      started: Mutex::new(Vec::new()),
    })
  }

  pub fn invocations(&self) -> usize {
    self.started.lock().len()
  }

  pub fn request(&self, n: usize) -> (Arc<dyn Consumer<T>>, Arc<ProducerContext>) {
    let started = self.started.lock();
    (Arc::clone(&started[n].0), Arc::clone(&started[n].1))
  }
}

impl<T> Producer<T> for ManualProducer<T> {
  fn produce_results(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<ProducerContext>) {
    self.started.lock().push((consumer, context));
  }
}

/// A fetcher that parks every fetch; the test answers through the callbacks.
/// Clones share the parked callbacks.
#[derive(Clone, Default)]
pub struct ParkedFetcher {
  callbacks: Arc<Mutex<Vec<FetchCallback>>>,
}

impl ParkedFetcher {
  pub fn fetches(&self) -> usize {
    self.callbacks.lock().len()
  }

  pub fn callback(&self, n: usize) -> FetchCallback {
    self.callbacks.lock()[n].clone()
  }
}

impl NetworkFetcher for ParkedFetcher {
  fn fetch(&self, _state: &FetchState, callback: FetchCallback) {
    self.callbacks.lock().push(callback);
  }
}

/// A fetcher that answers immediately with the URI's bytes.
#[derive(Clone, Default)]
pub struct EchoFetcher {
  fetches: Arc<AtomicUsize>,
}

impl EchoFetcher {
  pub fn fetches(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }
}

impl NetworkFetcher for EchoFetcher {
  fn fetch(&self, state: &FetchState, callback: FetchCallback) {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    callback.on_response(state.uri().as_bytes().to_vec());
  }
}

/// Decodes `n` bytes into an `n`x1 image. Fails on empty input.
pub fn width_decoder(
  encoded: &EncodedImage,
  options: &DecodeOptions,
) -> Result<CloseableRef<DecodedImage>, PipelineError> {
  if encoded.bytes().is_empty() {
    return Err(PipelineError::other("nothing to decode"));
  }
  let width = options.resize.map_or(encoded.bytes().len() as u32, |r| r.width);
  let image = DecodedImage::new(width, 1, vec![0u8; width as usize]);
  Ok(CloseableRef::new(if options.is_partial { image.partial() } else { image }))
}
