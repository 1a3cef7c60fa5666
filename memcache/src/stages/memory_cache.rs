use crate::cache::MemoryCache;
use crate::error::PipelineError;
use crate::listener::report;
use crate::producers::{
  Consumer, ExtraMap, Producer, ProducerContext, RequestLevel, Status,
};
use crate::reference::CloseableRef;

use std::fmt;
use std::sync::Arc;

use ahash::HashMapExt;

/// Extra recording whether the stage answered from its cache.
pub const CACHED_VALUE_FOUND: &str = "cached_value_found";

type KeyFn<K> = Arc<dyn Fn(&ProducerContext) -> K + Send + Sync>;

/// Answers requests from a memory cache, and caches what its input produces
/// on a miss.
///
/// On a hit the cached client handle is delivered as the final result and
/// the input never runs. A request whose lowest permitted level is at or above
/// this stage's level finishes with an empty result instead of going further.
pub struct MemoryCacheProducer<K, V> {
  name: &'static str,
  origin: &'static str,
  cache: Arc<dyn MemoryCache<K, V>>,
  key_fn: KeyFn<K>,
  input: Arc<dyn Producer<CloseableRef<V>>>,
  level: RequestLevel,
  skip_caching: Status,
}

impl<K, V> MemoryCacheProducer<K, V>
where
  K: Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub fn new<F>(
    name: &'static str,
    cache: Arc<dyn MemoryCache<K, V>>,
    key_fn: F,
    input: Arc<dyn Producer<CloseableRef<V>>>,
    level: RequestLevel,
  ) -> Self
  where
    F: Fn(&ProducerContext) -> K + Send + Sync + 'static,
  {
    Self {
      name,
      origin: name,
      cache,
      key_fn: Arc::new(key_fn),
      input,
      level,
      skip_caching: Status::IS_PARTIAL_RESULT,
    }
  }

  /// Final results carrying any of `flags` are forwarded without being cached.
  pub fn skip_caching(mut self, flags: Status) -> Self {
    self.skip_caching = flags;
    self
  }

  /// The value recorded under the `origin` extra when this stage answers.
  pub fn with_origin(mut self, origin: &'static str) -> Self {
    self.origin = origin;
    self
  }

  fn finish(&self, context: &ProducerContext, found: bool) {
    let listener = context.listener();
    let extras = listener.requires_extra_map(context.id()).then(|| {
      let mut extras = ExtraMap::new();
      extras.insert(CACHED_VALUE_FOUND.to_string(), found.to_string());
      extras
    });
    report(
      "on_producer_finish_with_success",
      listener.on_producer_finish_with_success(context.id(), self.name, extras.as_ref()),
    );
  }
}

impl<K, V> Producer<CloseableRef<V>> for MemoryCacheProducer<K, V>
where
  K: Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn produce_results(&self, consumer: Arc<dyn Consumer<CloseableRef<V>>>, context: Arc<ProducerContext>) {
    let listener = Arc::clone(context.listener());
    report("on_producer_start", listener.on_producer_start(context.id(), self.name));

    let key = (self.key_fn)(&context);
    if let Some(cached) = self.cache.get(&key) {
      tracing::trace!(producer = self.name, request = context.id(), "memory cache hit");
      context.set_origin(self.origin);
      self.finish(&context, true);
      report(
        "on_ultimate_producer_reached",
        listener.on_ultimate_producer_reached(context.id(), self.name, true),
      );
      consumer.on_progress_update(1.0);
      consumer.on_new_result(Some(&cached), Status::IS_LAST);
      return;
    }

    if context.lowest_permitted_request_level() >= self.level {
      tracing::trace!(producer = self.name, request = context.id(), "miss at lowest permitted level");
      self.finish(&context, false);
      report(
        "on_ultimate_producer_reached",
        listener.on_ultimate_producer_reached(context.id(), self.name, false),
      );
      consumer.on_new_result(None, Status::IS_LAST);
      return;
    }

    self.finish(&context, false);
    let caching = Arc::new(CachingConsumer {
      consumer,
      cache: Arc::clone(&self.cache),
      key,
      skip_caching: self.skip_caching,
    });
    self.input.produce_results(caching, context);
  }
}

impl<K, V> fmt::Debug for MemoryCacheProducer<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MemoryCacheProducer")
      .field("name", &self.name)
      .field("level", &self.level)
      .field("skip_caching", &self.skip_caching)
      .finish_non_exhaustive()
  }
}

/// Stores final results in the cache and forwards the cache's client handle
/// in place of the original.
struct CachingConsumer<K, V> {
  consumer: Arc<dyn Consumer<CloseableRef<V>>>,
  cache: Arc<dyn MemoryCache<K, V>>,
  key: K,
  skip_caching: Status,
}

impl<K, V> Consumer<CloseableRef<V>> for CachingConsumer<K, V>
where
  K: Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn on_new_result(&self, result: Option<&CloseableRef<V>>, status: Status) {
    let value = match result {
      Some(value) if status.is_last() && !status.has_any_flag(self.skip_caching) => value,
      _ => {
        self.consumer.on_new_result(result, status);
        return;
      }
    };

    match self.cache.cache(self.key.clone(), value) {
      Ok(Some(handle)) => self.consumer.on_new_result(Some(&handle), status),
      // Did not fit: hand out the original.
      Ok(None) => self.consumer.on_new_result(Some(value), status),
      Err(error) => self.consumer.on_failure(&PipelineError::from(error)),
    }
  }

  fn on_failure(&self, error: &PipelineError) {
    self.consumer.on_failure(error);
  }

  fn on_cancellation(&self) {
    self.consumer.on_cancellation();
  }

  fn on_progress_update(&self, progress: f32) {
    self.consumer.on_progress_update(progress);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::params::MemoryCacheParams;
  use crate::cache::CountingMemoryCache;
  use crate::producers::{ImageRequest, NoOpProducerListener};
  use parking_lot::Mutex;

  struct Fixed(u32);

  impl Producer<CloseableRef<u32>> for Fixed {
    fn produce_results(&self, consumer: Arc<dyn Consumer<CloseableRef<u32>>>, _context: Arc<ProducerContext>) {
      consumer.on_new_result(Some(&CloseableRef::new(self.0)), Status::IS_LAST);
    }
  }

  #[derive(Default)]
  struct Collect(Mutex<Vec<Option<u32>>>);

  impl Consumer<CloseableRef<u32>> for Collect {
    fn on_new_result(&self, result: Option<&CloseableRef<u32>>, _status: Status) {
      self.0.lock().push(result.map(|r| *r.get().unwrap()));
    }
    fn on_failure(&self, _error: &PipelineError) {}
    fn on_cancellation(&self) {}
  }

  fn context(level: RequestLevel) -> Arc<ProducerContext> {
    let request = ImageRequest::new("u").with_lowest_permitted_request_level(level);
    Arc::new(ProducerContext::new("1", request, Arc::new(NoOpProducerListener)))
  }

  #[test]
  fn miss_caches_input_result_then_hits() {
    let cache = CountingMemoryCache::<String, u32>::builder()
      .params(MemoryCacheParams::new(10, 10, 10, 10, 10))
      .build();
    let producer = MemoryCacheProducer::new(
      "TestCache",
      Arc::new(cache.clone()),
      |c: &ProducerContext| c.request().source_uri().to_string(),
      Arc::new(Fixed(42)),
      RequestLevel::BitmapMemoryCache,
    );

    let first = Arc::new(Collect::default());
    producer.produce_results(first.clone(), context(RequestLevel::FullFetch));
    assert_eq!(*first.0.lock(), vec![Some(42)]);
    assert_eq!(cache.count(), 1);

    let context = context(RequestLevel::BitmapMemoryCache);
    let second = Arc::new(Collect::default());
    producer.produce_results(second.clone(), Arc::clone(&context));
    assert_eq!(*second.0.lock(), vec![Some(42)]);
    assert_eq!(context.extra(crate::producers::context::ORIGIN_EXTRA).as_deref(), Some("TestCache"));
    assert_eq!(cache.stats().hits, 1);
  }

  #[test]
  fn lowest_permitted_level_stops_at_cache() {
    let cache = CountingMemoryCache::<String, u32>::builder()
      .params(MemoryCacheParams::new(10, 10, 10, 10, 10))
      .build();
    let producer = MemoryCacheProducer::new(
      "TestCache",
      Arc::new(cache.clone()),
      |c: &ProducerContext| c.request().source_uri().to_string(),
      Arc::new(Fixed(42)),
      RequestLevel::BitmapMemoryCache,
    );
    let consumer = Arc::new(Collect::default());
    producer.produce_results(consumer.clone(), context(RequestLevel::BitmapMemoryCache));
    assert_eq!(*consumer.0.lock(), vec![None]);
    assert_eq!(cache.count(), 0);
  }
}
