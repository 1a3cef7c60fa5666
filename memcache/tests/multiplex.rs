mod common;

use common::{init_tracing, Event, ManualProducer, Recorder};
use fibre_memcache::error::PipelineError;
use fibre_memcache::producers::{ImageRequest, NoOpProducerListener};
use fibre_memcache::reference::CloseableRef;
use fibre_memcache::{Consumer, MultiplexProducer, Priority, Producer, ProducerContext, Status};

use std::sync::Arc;

type Value = CloseableRef<String>;

fn context(id: &str, uri: &str) -> ProducerContext {
  ProducerContext::new(id, ImageRequest::new(uri), Arc::new(NoOpProducerListener))
}

fn multiplex(upstream: &Arc<ManualProducer<Value>>, keep_as_low_priority: bool) -> MultiplexProducer<String, Value> {
  let input: Arc<dyn Producer<Value>> = upstream.clone();
  MultiplexProducer::new(
    "TestMultiplexProducer",
    input,
    |context: &ProducerContext| context.request().source_uri().to_string(),
    keep_as_low_priority,
  )
}

fn recorder() -> Arc<Recorder<Value, String>> {
  Recorder::new(|value: &Value| value.get().cloned().unwrap_or_default())
}

fn value(text: &str) -> Value {
  CloseableRef::new(text.to_string())
}

#[test]
fn test_concurrent_identical_requests_share_one_upstream() {
  init_tracing();
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, false);

  let subscribers: Vec<_> = std::thread::scope(|scope| {
    let handles: Vec<_> = (0..8)
      .map(|i| {
        let producer = &producer;
        scope.spawn(move || {
          let consumer = recorder();
          let context = Arc::new(context(&i.to_string(), "https://example.com/a.jpg"));
          producer.produce_results(consumer.clone(), Arc::clone(&context));
          (consumer, context)
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  assert_eq!(upstream.invocations(), 1);
  assert_eq!(producer.in_flight_count(), 1);

  let (forward, _) = upstream.request(0);
  forward.on_new_result(Some(&value("done")), Status::IS_LAST);

  for (consumer, context) in &subscribers {
    assert_eq!(consumer.signals(), vec![Event::Result(Some("done".to_string()), true)]);
    assert_eq!(context.extra(producer.count_extra()).as_deref(), Some("8"));
  }
  assert_eq!(producer.in_flight_count(), 0);
}

#[test]
fn test_different_keys_run_separately() {
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, false);
  producer.produce_results(recorder(), Arc::new(context("1", "a")));
  producer.produce_results(recorder(), Arc::new(context("2", "b")));
  assert_eq!(upstream.invocations(), 2);
  assert_eq!(producer.in_flight_count(), 2);
}

#[test]
fn test_cancelling_one_subscriber_keeps_upstream_running() {
  init_tracing();
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, false);

  let first = recorder();
  let first_context = Arc::new(context("1", "a"));
  producer.produce_results(first.clone(), Arc::clone(&first_context));
  let second = recorder();
  let second_context = Arc::new(context("2", "a"));
  producer.produce_results(second.clone(), Arc::clone(&second_context));

  first_context.cancel();
  assert_eq!(first.signals(), vec![Event::Cancellation]);
  let (forward, upstream_context) = upstream.request(0);
  assert!(!upstream_context.is_cancelled());

  forward.on_new_result(Some(&value("v")), Status::IS_LAST);
  assert_eq!(second.signals(), vec![Event::Result(Some("v".to_string()), true)]);
  assert_eq!(first.signals(), vec![Event::Cancellation], "nothing after cancellation");
}

#[test]
fn test_cancelling_last_subscriber_cancels_upstream() {
  init_tracing();
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, false);

  let contexts: Vec<_> = (0..2)
    .map(|i| {
      let context = Arc::new(context(&i.to_string(), "a"));
      producer.produce_results(recorder(), Arc::clone(&context));
      context
    })
    .collect();
  let (forward, upstream_context) = upstream.request(0);

  contexts[0].cancel();
  assert!(!upstream_context.is_cancelled());
  contexts[1].cancel();
  assert!(upstream_context.is_cancelled());
  assert_eq!(producer.in_flight_count(), 0);

  // A late answer from the cancelled request goes nowhere, and a new caller
  // starts a fresh upstream.
  forward.on_new_result(Some(&value("late")), Status::IS_LAST);
  let late = recorder();
  producer.produce_results(late.clone(), Arc::new(context("3", "a")));
  assert_eq!(upstream.invocations(), 2);
  assert!(late.signals().is_empty());
}

#[test]
fn test_upstream_tracks_highest_priority_and_prefetch() {
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, false);

  let prefetch = Arc::new(context("1", "a").with_priority(Priority::Low).with_prefetch(true));
  producer.produce_results(recorder(), Arc::clone(&prefetch));
  let (_, upstream_context) = upstream.request(0);
  assert_eq!(upstream_context.priority(), Priority::Low);
  assert!(upstream_context.is_prefetch());

  let urgent = Arc::new(context("2", "a").with_priority(Priority::High));
  producer.produce_results(recorder(), Arc::clone(&urgent));
  assert_eq!(upstream_context.priority(), Priority::High);
  assert!(!upstream_context.is_prefetch());

  urgent.cancel();
  assert_eq!(upstream_context.priority(), Priority::Low);
  assert!(upstream_context.is_prefetch());

  prefetch.set_priority(Priority::Medium);
  assert_eq!(upstream_context.priority(), Priority::Medium);
}

#[test]
fn test_cancelled_fetch_kept_alive_at_low_priority() {
  init_tracing();
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, true);

  let first = recorder();
  let first_context = Arc::new(context("1", "a"));
  producer.produce_results(first.clone(), Arc::clone(&first_context));
  first_context.cancel();

  let (forward, upstream_context) = upstream.request(0);
  assert_eq!(first.signals(), vec![Event::Cancellation]);
  assert!(!upstream_context.is_cancelled());
  assert_eq!(upstream_context.priority(), Priority::Low);
  assert_eq!(producer.in_flight_count(), 1);

  // A later identical request joins the demoted fetch instead of starting one.
  let second = recorder();
  producer.produce_results(second.clone(), Arc::new(context("2", "a")));
  assert_eq!(upstream.invocations(), 1);
  assert_eq!(upstream_context.priority(), Priority::Medium);

  forward.on_new_result(Some(&value("v")), Status::IS_LAST);
  assert_eq!(second.signals(), vec![Event::Result(Some("v".to_string()), true)]);
}

#[test]
fn test_cancelled_prefetch_is_not_kept_alive() {
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, true);
  let prefetch = Arc::new(context("1", "a").with_prefetch(true));
  producer.produce_results(recorder(), Arc::clone(&prefetch));
  prefetch.cancel();
  assert!(upstream.request(0).1.is_cancelled());
  assert_eq!(producer.in_flight_count(), 0);
}

#[test]
fn test_failure_fans_out_to_every_subscriber() {
  init_tracing();
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, false);
  let consumers: Vec<_> = (0..3)
    .map(|i| {
      let consumer = recorder();
      producer.produce_results(consumer.clone(), Arc::new(context(&i.to_string(), "a")));
      consumer
    })
    .collect();

  upstream.request(0).0.on_failure(&PipelineError::other("boom"));
  for consumer in &consumers {
    assert_eq!(consumer.signals(), vec![Event::Failure("boom".to_string())]);
  }
  assert_eq!(producer.in_flight_count(), 0);
}

#[test]
fn test_progress_is_replayed_to_late_subscribers() {
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, false);
  let progressive = || {
    ProducerContext::new(
      "p",
      ImageRequest::new("a").with_progressive_rendering(true),
      Arc::new(NoOpProducerListener),
    )
  };
  producer.produce_results(recorder(), Arc::new(progressive()));
  let (forward, _) = upstream.request(0);
  forward.on_progress_update(0.25);
  forward.on_new_result(Some(&value("part")), Status::NO_FLAGS);

  let late = recorder();
  producer.produce_results(late.clone(), Arc::new(progressive()));
  assert_eq!(
    late.events(),
    vec![Event::Progress(0.25), Event::Result(Some("part".to_string()), false)]
  );

  // Callers that did not ask for intermediate results get no replay.
  let plain = recorder();
  producer.produce_results(plain.clone(), Arc::new(context("q", "a")));
  assert!(plain.events().is_empty());
}

/// Cancels its own request from inside the first progress callback.
struct CancelOnProgress {
  context: Arc<ProducerContext>,
  inner: Arc<Recorder<Value, String>>,
}

impl Consumer<Value> for CancelOnProgress {
  fn on_new_result(&self, result: Option<&Value>, status: Status) {
    self.inner.on_new_result(result, status);
  }

  fn on_failure(&self, error: &PipelineError) {
    self.inner.on_failure(error);
  }

  fn on_cancellation(&self) {
    self.inner.on_cancellation();
  }

  fn on_progress_update(&self, progress: f32) {
    self.inner.on_progress_update(progress);
    self.context.cancel();
  }
}

#[test]
fn test_subscriber_may_cancel_from_inside_a_callback() {
  init_tracing();
  let upstream = ManualProducer::new();
  let producer = multiplex(&upstream, false);
  let inner = recorder();
  let own_context = Arc::new(context("1", "a"));
  producer.produce_results(
    Arc::new(CancelOnProgress {
      context: Arc::clone(&own_context),
      inner: inner.clone(),
    }),
    Arc::clone(&own_context),
  );

  upstream.request(0).0.on_progress_update(0.5);
  assert_eq!(inner.events(), vec![Event::Progress(0.5), Event::Cancellation]);
  assert!(upstream.request(0).1.is_cancelled());
}
