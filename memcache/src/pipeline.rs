//! The image pipeline facade.
//!
//! Decoded requests flow through
//! `multiplex → bitmap cache → decode → multiplex → encoded cache → fetch`.
//! Each cache sits behind its multiplexer, so concurrent identical requests
//! probe the cache once and a fetch kept alive at low priority after its
//! callers left still fills both caches.

use crate::cache::factory::{
  bitmap_counting_memory_cache, encoded_counting_memory_cache, instrumented_bitmap_memory_cache,
  instrumented_encoded_memory_cache,
};
use crate::cache::params::{fixed_params, MemoryCacheParams, ParamsSupplier};
use crate::cache::{CountingMemoryCache, MemoryCache};
use crate::cache_key::{BitmapMemoryCacheKey, CacheKey, CacheKeyFactory, DefaultCacheKeyFactory, SimpleCacheKey};
use crate::error::{BuildError, PipelineError};
use crate::executor::{default_executor, Executor};
use crate::image::{DecodedImage, EncodedImage};
use crate::listener::{ImageCacheStatsTracker, NoOpImageCacheStatsTracker};
use crate::metrics::CacheStats;
use crate::multiplex::MultiplexProducer;
use crate::producers::{
  BaseConsumer, Consumer, ForwardingImageOriginListener, ForwardingProducerListener, ImageOriginListener,
  ImageOriginRequestListener, ImageRequest, Priority, Producer, ProducerContext, ProducerListener, RequestLevel,
  Status,
};
use crate::reference::CloseableRef;
use crate::stages::fetch::{NETWORK_FETCH_PRODUCER, NETWORK_ORIGIN};
use crate::stages::{DecodeProducer, Decoder, MemoryCacheProducer, NetworkFetchProducer, NetworkFetcher};
use crate::trimmable::{MemoryTrimmableRegistry, NoOpMemoryTrimmableRegistry};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const BITMAP_MULTIPLEX_PRODUCER: &str = "BitmapMemoryCacheKeyMultiplexProducer";
pub const ENCODED_MULTIPLEX_PRODUCER: &str = "EncodedCacheKeyMultiplexProducer";
pub const BITMAP_MEMORY_CACHE_PRODUCER: &str = "BitmapMemoryCacheProducer";
pub const ENCODED_MEMORY_CACHE_PRODUCER: &str = "EncodedMemoryCacheProducer";

/// Origins recorded by the cache stages on a hit.
pub const BITMAP_MEMORY_ORIGIN: &str = "memory_bitmap";
pub const ENCODED_MEMORY_ORIGIN: &str = "memory_encoded";
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// The origin reported for a request whose final result came from the stage
/// named `producer_name`.
pub fn origin_for_producer(producer_name: &str) -> &'static str {
  match producer_name {
    BITMAP_MEMORY_CACHE_PRODUCER => BITMAP_MEMORY_ORIGIN,
    ENCODED_MEMORY_CACHE_PRODUCER => ENCODED_MEMORY_ORIGIN,
    NETWORK_FETCH_PRODUCER => NETWORK_ORIGIN,
    _ => UNKNOWN_ORIGIN,
  }
}

const MIB: u64 = 1024 * 1024;

/// Encoded bytes are small and cheap to keep; most of the budget may idle in
/// the eviction queue.
pub const fn default_encoded_cache_params() -> MemoryCacheParams {
  MemoryCacheParams::new(8 * MIB, 512, 4 * MIB, 512, MIB)
}

/// Everything an [`ImagePipeline`] is built from.
pub struct ImagePipelineConfig {
  pub(crate) network_fetcher: Arc<dyn NetworkFetcher>,
  pub(crate) decoder: Arc<dyn Decoder>,
  pub(crate) bitmap_cache_params: ParamsSupplier,
  pub(crate) encoded_cache_params: ParamsSupplier,
  pub(crate) executor: Arc<dyn Executor>,
  pub(crate) key_factory: Arc<dyn CacheKeyFactory>,
  pub(crate) request_listener: ForwardingProducerListener,
  pub(crate) stats_tracker: Arc<dyn ImageCacheStatsTracker>,
  pub(crate) memory_trimmable_registry: Arc<dyn MemoryTrimmableRegistry>,
  pub(crate) keep_cancelled_fetch_as_low_priority: bool,
}

impl ImagePipelineConfig {
  pub fn builder() -> ImagePipelineConfigBuilder {
    ImagePipelineConfigBuilder::default()
  }
}

impl fmt::Debug for ImagePipelineConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ImagePipelineConfig")
      .field("bitmap_cache_params", &(self.bitmap_cache_params)())
      .field("encoded_cache_params", &(self.encoded_cache_params)())
      .field("request_listeners", &self.request_listener.len())
      .field(
        "keep_cancelled_fetch_as_low_priority",
        &self.keep_cancelled_fetch_as_low_priority,
      )
      .finish_non_exhaustive()
  }
}

/// A builder for [`ImagePipelineConfig`].
///
/// Only the fetcher and the decoder are required; everything else has a
/// default.
#[derive(Default)]
pub struct ImagePipelineConfigBuilder {
  network_fetcher: Option<Arc<dyn NetworkFetcher>>,
  decoder: Option<Arc<dyn Decoder>>,
  bitmap_cache_params: Option<ParamsSupplier>,
  encoded_cache_params: Option<ParamsSupplier>,
  executor: Option<Arc<dyn Executor>>,
  key_factory: Option<Arc<dyn CacheKeyFactory>>,
  request_listener: ForwardingProducerListener,
  origin_listener: ForwardingImageOriginListener,
  stats_tracker: Option<Arc<dyn ImageCacheStatsTracker>>,
  memory_trimmable_registry: Option<Arc<dyn MemoryTrimmableRegistry>>,
  keep_cancelled_fetch_as_low_priority: bool,
}

impl fmt::Debug for ImagePipelineConfigBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ImagePipelineConfigBuilder")
      .field("has_network_fetcher", &self.network_fetcher.is_some())
      .field("has_decoder", &self.decoder.is_some())
      .field("request_listeners", &self.request_listener.len())
      .field("origin_listeners", &self.origin_listener.len())
      .finish_non_exhaustive()
  }
}

impl ImagePipelineConfigBuilder {
  pub fn network_fetcher<F>(mut self, fetcher: F) -> Self
  where
    F: NetworkFetcher + 'static,
  {
    self.network_fetcher = Some(Arc::new(fetcher));
    self
  }

  pub fn decoder<D>(mut self, decoder: D) -> Self
  where
    D: Decoder + 'static,
  {
    self.decoder = Some(Arc::new(decoder));
    self
  }

  /// Fixed limits for the decoded image cache.
  pub fn bitmap_cache_params(mut self, params: MemoryCacheParams) -> Self {
    self.bitmap_cache_params = Some(fixed_params(params));
    self
  }

  /// Limits for the decoded image cache, re-read as the cache runs.
  pub fn bitmap_cache_params_supplier<F>(mut self, supplier: F) -> Self
  where
    F: Fn() -> MemoryCacheParams + Send + Sync + 'static,
  {
    self.bitmap_cache_params = Some(Arc::new(supplier));
    self
  }

  pub fn encoded_cache_params(mut self, params: MemoryCacheParams) -> Self {
    self.encoded_cache_params = Some(fixed_params(params));
    self
  }

  pub fn encoded_cache_params_supplier<F>(mut self, supplier: F) -> Self
  where
    F: Fn() -> MemoryCacheParams + Send + Sync + 'static,
  {
    self.encoded_cache_params = Some(Arc::new(supplier));
    self
  }

  /// Where decode jobs run. Defaults to the Tokio blocking pool when built
  /// with the `tokio` feature inside a runtime, otherwise a fixed-size worker
  /// pool.
  pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
    self.executor = Some(executor);
    self
  }

  pub fn key_factory<F>(mut self, key_factory: F) -> Self
  where
    F: CacheKeyFactory + 'static,
  {
    self.key_factory = Some(Arc::new(key_factory));
    self
  }

  /// Replaces the request listeners with `listener`.
  pub fn request_listener(mut self, listener: Arc<dyn ProducerListener>) -> Self {
    self.request_listener = ForwardingProducerListener::new(vec![listener]);
    self
  }

  pub fn add_request_listener(mut self, listener: Arc<dyn ProducerListener>) -> Self {
    self.request_listener.add_listener(listener);
    self
  }

  /// Adds a listener told which cache or stage answered each request.
  pub fn add_image_origin_listener(mut self, listener: Arc<dyn ImageOriginListener>) -> Self {
    self.origin_listener.add_listener(listener);
    self
  }

  pub fn stats_tracker(mut self, tracker: Arc<dyn ImageCacheStatsTracker>) -> Self {
    self.stats_tracker = Some(tracker);
    self
  }

  /// The registry both caches register with for memory-pressure trims.
  pub fn memory_trimmable_registry(mut self, registry: Arc<dyn MemoryTrimmableRegistry>) -> Self {
    self.memory_trimmable_registry = Some(registry);
    self
  }

  /// Keep a fetch running at low priority after its last caller cancelled.
  pub fn keep_cancelled_fetch_as_low_priority(mut self, keep: bool) -> Self {
    self.keep_cancelled_fetch_as_low_priority = keep;
    self
  }

  pub fn build(self) -> Result<ImagePipelineConfig, BuildError> {
    let network_fetcher = self.network_fetcher.ok_or(BuildError::MissingFetcher)?;
    let decoder = self.decoder.ok_or(BuildError::MissingDecoder)?;
    let mut request_listener = self.request_listener;
    if !self.origin_listener.is_empty() {
      request_listener.add_listener(Arc::new(ImageOriginRequestListener::new(
        Arc::new(self.origin_listener),
        origin_for_producer,
      )));
    }
    Ok(ImagePipelineConfig {
      network_fetcher,
      decoder,
      bitmap_cache_params: self
        .bitmap_cache_params
        .unwrap_or_else(|| fixed_params(MemoryCacheParams::default())),
      encoded_cache_params: self
        .encoded_cache_params
        .unwrap_or_else(|| fixed_params(default_encoded_cache_params())),
      executor: self.executor.unwrap_or_else(default_executor),
      key_factory: self.key_factory.unwrap_or_else(|| Arc::new(DefaultCacheKeyFactory)),
      request_listener,
      stats_tracker: self
        .stats_tracker
        .unwrap_or_else(|| Arc::new(NoOpImageCacheStatsTracker)),
      memory_trimmable_registry: self
        .memory_trimmable_registry
        .unwrap_or_else(|| Arc::new(NoOpMemoryTrimmableRegistry)),
      keep_cancelled_fetch_as_low_priority: self.keep_cancelled_fetch_as_low_priority,
    })
  }
}

/// Swallows everything. Used for prefetches, which only warm the caches.
struct Discard;

impl<T> Consumer<T> for Discard {
  fn on_new_result(&self, _result: Option<&T>, _status: Status) {}
  fn on_failure(&self, _error: &PipelineError) {}
  fn on_cancellation(&self) {}
}

/// Entry point for image requests.
///
/// Results are delivered to the caller's consumer as client handles of the
/// pipeline's caches; the caller closes (or drops) them when done. The
/// returned [`ProducerContext`] lets the caller cancel the request or change
/// its priority.
pub struct ImagePipeline {
  bitmap_cache: CountingMemoryCache<BitmapMemoryCacheKey, DecodedImage>,
  encoded_cache: CountingMemoryCache<SimpleCacheKey, EncodedImage>,
  decoded_sequence: Arc<dyn Producer<CloseableRef<DecodedImage>>>,
  encoded_sequence: Arc<dyn Producer<CloseableRef<EncodedImage>>>,
  key_factory: Arc<dyn CacheKeyFactory>,
  request_listener: Arc<dyn ProducerListener>,
  next_request_id: AtomicU64,
}

impl ImagePipeline {
  pub fn new(config: ImagePipelineConfig) -> Self {
    let registry = &*config.memory_trimmable_registry;
    let bitmap_cache =
      bitmap_counting_memory_cache(config.bitmap_cache_params, Arc::clone(&config.stats_tracker), registry);
    let encoded_cache =
      encoded_counting_memory_cache(config.encoded_cache_params, Arc::clone(&config.stats_tracker), registry);

    let tracked_bitmap_cache: Arc<dyn MemoryCache<BitmapMemoryCacheKey, DecodedImage>> =
      Arc::new(instrumented_bitmap_memory_cache(
        Arc::new(bitmap_cache.clone()),
        Arc::clone(&config.stats_tracker),
      ));
    let tracked_encoded_cache: Arc<dyn MemoryCache<SimpleCacheKey, EncodedImage>> =
      Arc::new(instrumented_encoded_memory_cache(
        Arc::new(encoded_cache.clone()),
        Arc::clone(&config.stats_tracker),
      ));

    let key_factory = config.key_factory;
    let encoded_key = {
      let key_factory = Arc::clone(&key_factory);
      move |context: &ProducerContext| key_factory.encoded_cache_key(context.request())
    };
    let bitmap_key = {
      let key_factory = Arc::clone(&key_factory);
      move |context: &ProducerContext| key_factory.bitmap_cache_key(context.request())
    };

    let fetch: Arc<dyn Producer<CloseableRef<EncodedImage>>> =
      Arc::new(NetworkFetchProducer::new(config.network_fetcher));
    let encoded_cache_stage: Arc<dyn Producer<CloseableRef<EncodedImage>>> = Arc::new(
      MemoryCacheProducer::new(
        ENCODED_MEMORY_CACHE_PRODUCER,
        tracked_encoded_cache,
        encoded_key.clone(),
        fetch,
        RequestLevel::EncodedMemoryCache,
      )
      .skip_caching(Status::DO_NOT_CACHE_ENCODED | Status::IS_PARTIAL_RESULT)
      .with_origin(ENCODED_MEMORY_ORIGIN),
    );
    let encoded_sequence: Arc<dyn Producer<CloseableRef<EncodedImage>>> = Arc::new(MultiplexProducer::new(
      ENCODED_MULTIPLEX_PRODUCER,
      encoded_cache_stage,
      encoded_key,
      config.keep_cancelled_fetch_as_low_priority,
    ));

    let decode: Arc<dyn Producer<CloseableRef<DecodedImage>>> = Arc::new(DecodeProducer::new(
      config.decoder,
      config.executor,
      Arc::clone(&encoded_sequence),
    ));
    let bitmap_cache_stage: Arc<dyn Producer<CloseableRef<DecodedImage>>> = Arc::new(
      MemoryCacheProducer::new(
        BITMAP_MEMORY_CACHE_PRODUCER,
        tracked_bitmap_cache,
        bitmap_key.clone(),
        decode,
        RequestLevel::BitmapMemoryCache,
      )
      .with_origin(BITMAP_MEMORY_ORIGIN),
    );
    let decoded_sequence: Arc<dyn Producer<CloseableRef<DecodedImage>>> = Arc::new(MultiplexProducer::new(
      BITMAP_MULTIPLEX_PRODUCER,
      bitmap_cache_stage,
      bitmap_key,
      false,
    ));

    tracing::debug!(
      bitmap_cache = %bitmap_cache.params(),
      encoded_cache = %encoded_cache.params(),
      "image pipeline ready"
    );
    Self {
      bitmap_cache,
      encoded_cache,
      decoded_sequence,
      encoded_sequence,
      key_factory,
      request_listener: Arc::new(config.request_listener),
      next_request_id: AtomicU64::new(0),
    }
  }

  fn submit<T>(
    &self,
    sequence: &Arc<dyn Producer<T>>,
    request: ImageRequest,
    consumer: Arc<dyn Consumer<T>>,
    priority: Priority,
    is_prefetch: bool,
  ) -> Arc<ProducerContext>
  where
    T: Send + Sync + 'static,
  {
    let id = self.next_request_id.fetch_add(1, Ordering::Relaxed).to_string();
    let context = Arc::new(
      ProducerContext::new(id, request, Arc::clone(&self.request_listener))
        .with_priority(priority)
        .with_prefetch(is_prefetch),
    );
    tracing::debug!(
      request = context.id(),
      uri = context.request().source_uri(),
      prefetch = is_prefetch,
      "submitting request"
    );
    let consumer: Arc<dyn Consumer<T>> = Arc::new(BaseConsumer::new(consumer));
    sequence.produce_results(consumer, Arc::clone(&context));
    context
  }

  /// Requests the decoded image for `request`.
  pub fn fetch_decoded_image(
    &self,
    request: ImageRequest,
    consumer: Arc<dyn Consumer<CloseableRef<DecodedImage>>>,
  ) -> Arc<ProducerContext> {
    self.submit(&self.decoded_sequence, request, consumer, Priority::Medium, false)
  }

  /// Requests the encoded bytes for `request`, skipping the decode stages.
  pub fn fetch_encoded_image(
    &self,
    request: ImageRequest,
    consumer: Arc<dyn Consumer<CloseableRef<EncodedImage>>>,
  ) -> Arc<ProducerContext> {
    self.submit(&self.encoded_sequence, request, consumer, Priority::Medium, false)
  }

  /// Warms the decoded image cache for `request` at low priority.
  pub fn prefetch_to_bitmap_cache(&self, request: ImageRequest) -> Arc<ProducerContext> {
    self.submit(&self.decoded_sequence, request, Arc::new(Discard), Priority::Low, true)
  }

  /// Warms the encoded cache for `request` at low priority.
  pub fn prefetch_to_encoded_cache(&self, request: ImageRequest) -> Arc<ProducerContext> {
    self.submit(&self.encoded_sequence, request, Arc::new(Discard), Priority::Low, true)
  }

  /// Drops every cached entry derived from `uri` from both caches. Handles
  /// already given out stay valid.
  pub fn evict_from_memory_cache(&self, uri: &str) {
    let bitmaps = self
      .bitmap_cache
      .remove_all(|key: &BitmapMemoryCacheKey| key.contains_uri(uri));
    let encoded = self
      .encoded_cache
      .remove_all(|key: &SimpleCacheKey| key.contains_uri(uri));
    tracing::debug!(uri, bitmaps, encoded, "evicted from memory caches");
  }

  pub fn clear_memory_caches(&self) {
    self.bitmap_cache.clear();
    self.encoded_cache.clear();
  }

  pub fn is_in_bitmap_memory_cache(&self, request: &ImageRequest) -> bool {
    self
      .bitmap_cache
      .contains_key(&self.key_factory.bitmap_cache_key(request))
  }

  pub fn is_in_encoded_memory_cache(&self, request: &ImageRequest) -> bool {
    self
      .encoded_cache
      .contains_key(&self.key_factory.encoded_cache_key(request))
  }

  pub fn bitmap_memory_cache(&self) -> &CountingMemoryCache<BitmapMemoryCacheKey, DecodedImage> {
    &self.bitmap_cache
  }

  pub fn encoded_memory_cache(&self) -> &CountingMemoryCache<SimpleCacheKey, EncodedImage> {
    &self.encoded_cache
  }

  pub fn bitmap_cache_stats(&self) -> CacheStats {
    self.bitmap_cache.stats()
  }

  pub fn encoded_cache_stats(&self) -> CacheStats {
    self.encoded_cache.stats()
  }
}

impl fmt::Debug for ImagePipeline {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ImagePipeline")
      .field("bitmap_cache", &self.bitmap_cache)
      .field("encoded_cache", &self.encoded_cache)
      .field("requests", &self.next_request_id.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}
