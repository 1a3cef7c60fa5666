//! Coalescing of concurrent identical requests.
//!
//! A [`MultiplexProducer`] keeps one in-flight upstream request per key. Every
//! caller asking for the same key while that request runs becomes a
//! subscriber of it: it receives the results delivered after it joined, plus
//! a replay of the last intermediate result. The upstream request is
//! cancelled (or demoted) only when its last subscriber leaves.

use crate::error::PipelineError;
use crate::listener::report;
use crate::producers::context::PendingCallbacks;
use crate::producers::{Consumer, Priority, Producer, ProducerContext, ProducerContextCallbacks, Status};
use crate::reference::Shareable;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::{HashMap, HashMapExt};
use parking_lot::{Mutex, ReentrantMutex};

/// Derives the multiplexing key of a request.
pub type KeyFn<K> = Arc<dyn Fn(&ProducerContext) -> K + Send + Sync>;

/// One caller attached to a multiplexed request.
struct Subscriber<T> {
  id: u64,
  consumer: Arc<dyn Consumer<T>>,
  context: Arc<ProducerContext>,
  // Held while delivering, so this subscriber sees results in upstream order.
  // Reentrant: a consumer may cancel its own context from inside a callback.
  delivery: ReentrantMutex<()>,
  finished: AtomicBool,
}

impl<T> Subscriber<T> {
  /// Runs `deliver` under the delivery lock unless a terminal signal was
  /// already delivered. Returns whether it ran.
  fn deliver<F>(&self, terminal: bool, deliver: F) -> bool
  where
    F: FnOnce(&dyn Consumer<T>),
  {
    let _delivery = self.delivery.lock();
    if terminal {
      if self.finished.swap(true, Ordering::AcqRel) {
        return false;
      }
    } else if self.finished.load(Ordering::Acquire) {
      return false;
    }
    deliver(&*self.consumer);
    true
  }
}

struct Upstream {
  generation: u64,
  context: Arc<ProducerContext>,
}

struct MultiplexerState<T> {
  subscribers: Vec<Arc<Subscriber<T>>>,
  upstream: Option<Upstream>,
  next_generation: u64,
  last_intermediate: Option<T>,
  last_status: Status,
  last_progress: f32,
  closed: bool,
}

impl<T> MultiplexerState<T> {
  fn is_current(&self, generation: u64) -> bool {
    self
      .upstream
      .as_ref()
      .is_some_and(|upstream| upstream.generation == generation)
  }

  /// Marks the request as done. Returns the retained intermediate result so
  /// the caller can drop it outside the lock.
  fn close(&mut self) -> Option<T> {
    self.closed = true;
    self.subscribers.clear();
    self.upstream = None;
    self.last_intermediate.take()
  }

  fn all_prefetch(&self) -> bool {
    self.subscribers.iter().all(|s| s.context.is_prefetch())
  }

  fn max_priority(&self) -> Priority {
    self
      .subscribers
      .iter()
      .map(|s| s.context.priority())
      .max()
      .unwrap_or(Priority::Low)
  }

  fn any_intermediate_expected(&self) -> bool {
    self
      .subscribers
      .iter()
      .any(|s| s.context.is_intermediate_result_expected())
  }

  fn update_is_prefetch(&self) -> PendingCallbacks {
    let upstream = self.upstream.as_ref()?;
    upstream.context.set_is_prefetch_no_callbacks(self.all_prefetch())
  }

  fn update_priority(&self) -> PendingCallbacks {
    let upstream = self.upstream.as_ref()?;
    upstream.context.set_priority_no_callbacks(self.max_priority())
  }

  fn update_is_intermediate_result_expected(&self) -> PendingCallbacks {
    let upstream = self.upstream.as_ref()?;
    upstream
      .context
      .set_is_intermediate_result_expected_no_callbacks(self.any_intermediate_expected())
  }
}

struct Multiplexer<K, T> {
  key: K,
  name: &'static str,
  count_extra: Arc<str>,
  shared: Weak<MultiplexShared<K, T>>,
  state: Mutex<MultiplexerState<T>>,
}

enum Start {
  Upstream(u64, Arc<ProducerContext>),
  Closed,
  Skip,
}

impl<K, T> Multiplexer<K, T>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  T: Shareable + Send + Sync + 'static,
{
  fn new(key: K, shared: &Arc<MultiplexShared<K, T>>) -> Self {
    Self {
      key,
      name: shared.name,
      count_extra: Arc::clone(&shared.count_extra),
      shared: Arc::downgrade(shared),
      state: Mutex::new(MultiplexerState {
        subscribers: Vec::new(),
        upstream: None,
        next_generation: 0,
        last_intermediate: None,
        last_status: Status::NO_FLAGS,
        last_progress: 0.0,
        closed: false,
      }),
    }
  }

  fn leave_registry(self: &Arc<Self>) {
    if let Some(shared) = self.shared.upgrade() {
      shared.remove(&self.key, self);
    }
  }

  /// Attaches `subscriber`. Returns `false` if this request already finished
  /// and a new one must be started instead.
  fn add_new_consumer(self: &Arc<Self>, subscriber: &Arc<Subscriber<T>>) -> bool {
    let delivery = subscriber.delivery.lock();
    let (replay, status, progress, prefetch, priority, intermediate) = {
      let mut state = self.state.lock();
      if state.closed {
        return false;
      }
      state.subscribers.push(Arc::clone(subscriber));
      let replay = if subscriber.context.is_intermediate_result_expected() {
        state.last_intermediate.as_ref().and_then(|result| result.share())
      } else {
        None
      };
      (
        replay,
        state.last_status,
        state.last_progress,
        state.update_is_prefetch(),
        state.update_priority(),
        state.update_is_intermediate_result_expected(),
      )
    };

    ProducerContext::call_on_is_prefetch_changed(prefetch);
    ProducerContext::call_on_priority_changed(priority);
    ProducerContext::call_on_is_intermediate_result_expected_changed(intermediate);

    if let Some(result) = replay {
      if !subscriber.finished.load(Ordering::Acquire) {
        if progress > 0.0 {
          subscriber.consumer.on_progress_update(progress);
        }
        subscriber.consumer.on_new_result(Some(&result), status);
      }
    }
    drop(delivery);

    subscriber.context.add_callbacks(Arc::new(SubscriberCallbacks {
      multiplexer: Arc::downgrade(self),
      subscriber_id: subscriber.id,
    }));
    true
  }

  /// Starts a new upstream request on behalf of the current subscribers, or
  /// closes the multiplexer if there are none.
  fn start_input_if_has_subscribers(self: &Arc<Self>) {
    let Some(shared) = self.shared.upgrade() else {
      return;
    };

    let start = {
      let mut state = self.state.lock();
      if state.closed || state.upstream.is_some() {
        Start::Skip
      } else if let Some(first) = state.subscribers.first() {
        let context = Arc::new(
          ProducerContext::new(
            first.context.id(),
            first.context.request().clone(),
            Arc::clone(first.context.listener()),
          )
          .with_lowest_permitted_request_level(first.context.lowest_permitted_request_level())
          .with_prefetch(state.all_prefetch())
          .with_priority(state.max_priority())
          .with_intermediate_result_expected(state.any_intermediate_expected()),
        );
        let generation = state.next_generation;
        state.next_generation += 1;
        state.upstream = Some(Upstream {
          generation,
          context: Arc::clone(&context),
        });
        Start::Upstream(generation, context)
      } else {
        drop(state.close());
        Start::Closed
      }
    };

    match start {
      Start::Upstream(generation, context) => {
        tracing::trace!(producer = self.name, generation, "starting upstream request");
        let forwarding = Arc::new(ForwardingConsumer {
          multiplexer: Arc::clone(self),
          generation,
        });
        shared.input.produce_results(forwarding, context);
      }
      Start::Closed => shared.remove(&self.key, self),
      Start::Skip => {}
    }
  }

  fn on_next_result(self: &Arc<Self>, generation: u64, result: Option<&T>, status: Status) {
    let (subscribers, upstream_extras, stale) = {
      let mut state = self.state.lock();
      if !state.is_current(generation) {
        return;
      }
      let subscribers = state.subscribers.clone();
      if status.is_last() {
        let extras = state.upstream.as_ref().map(|u| u.context.extras());
        (subscribers, extras, state.close())
      } else {
        state.last_status = status;
        let stale = std::mem::replace(&mut state.last_intermediate, result.and_then(|r| r.share()));
        (subscribers, None, stale)
      }
    };
    drop(stale);

    if status.is_not_last() {
      for subscriber in &subscribers {
        subscriber.deliver(false, |consumer| consumer.on_new_result(result, status));
      }
      return;
    }

    self.leave_registry();
    let count = subscribers.len().to_string();
    for subscriber in &subscribers {
      subscriber.deliver(true, |consumer| {
        let context = &subscriber.context;
        if let Some(extras) = &upstream_extras {
          context.put_extras(extras.clone());
        }
        context.set_extra(&*self.count_extra, count.as_str());
        let extras = context
          .listener()
          .requires_extra_map(context.id())
          .then(|| context.extras());
        report(
          "on_producer_finish_with_success",
          context
            .listener()
            .on_producer_finish_with_success(context.id(), self.name, extras.as_ref()),
        );
        consumer.on_new_result(result, status);
      });
    }
  }

  fn on_failure(self: &Arc<Self>, generation: u64, error: &PipelineError) {
    let (subscribers, stale) = {
      let mut state = self.state.lock();
      if !state.is_current(generation) {
        return;
      }
      let subscribers = state.subscribers.clone();
      (subscribers, state.close())
    };
    drop(stale);
    self.leave_registry();

    tracing::debug!(producer = self.name, %error, subscribers = subscribers.len(), "multiplexed request failed");
    for subscriber in &subscribers {
      subscriber.deliver(true, |consumer| {
        let context = &subscriber.context;
        report(
          "on_producer_finish_with_failure",
          context
            .listener()
            .on_producer_finish_with_failure(context.id(), self.name, error, None),
        );
        consumer.on_failure(error);
      });
    }
  }

  /// The upstream request was cancelled. If callers are still waiting, a new
  /// one is started for them.
  fn on_upstream_cancelled(self: &Arc<Self>, generation: u64) {
    let stale = {
      let mut state = self.state.lock();
      if !state.is_current(generation) {
        return;
      }
      state.upstream = None;
      state.last_intermediate.take()
    };
    drop(stale);
    tracing::debug!(producer = self.name, generation, "upstream cancelled");
    self.start_input_if_has_subscribers();
  }

  fn on_progress_update(&self, generation: u64, progress: f32) {
    let subscribers = {
      let mut state = self.state.lock();
      if !state.is_current(generation) {
        return;
      }
      state.last_progress = progress;
      state.subscribers.clone()
    };
    for subscriber in &subscribers {
      subscriber.deliver(false, |consumer| consumer.on_progress_update(progress));
    }
  }

  fn on_subscriber_cancelled(self: &Arc<Self>, subscriber_id: u64) {
    let keep_as_low_priority = self
      .shared
      .upgrade()
      .is_some_and(|shared| shared.keep_cancelled_fetch_as_low_priority);

    let mut to_cancel = None;
    let mut to_demote = None;
    let mut closed = false;
    let mut callbacks = (None, None, None);

    let (removed, stale) = {
      let mut state = self.state.lock();
      let Some(position) = state.subscribers.iter().position(|s| s.id == subscriber_id) else {
        return;
      };
      let removed = state.subscribers.remove(position);
      let mut stale = None;

      if state.subscribers.is_empty() {
        let upstream = state.upstream.as_ref().map(|u| Arc::clone(&u.context));
        match upstream {
          Some(context) if keep_as_low_priority && !context.is_prefetch() => to_demote = Some(context),
          upstream => {
            to_cancel = upstream;
            stale = state.close();
            closed = true;
          }
        }
      } else {
        callbacks = (
          state.update_is_prefetch(),
          state.update_priority(),
          state.update_is_intermediate_result_expected(),
        );
      }
      (removed, stale)
    };
    drop(stale);

    ProducerContext::call_on_is_prefetch_changed(callbacks.0);
    ProducerContext::call_on_priority_changed(callbacks.1);
    ProducerContext::call_on_is_intermediate_result_expected_changed(callbacks.2);

    if closed {
      self.leave_registry();
    }
    if let Some(context) = to_demote {
      tracing::debug!(producer = self.name, "keeping cancelled request alive at low priority");
      ProducerContext::call_on_priority_changed(context.set_priority_no_callbacks(Priority::Low));
    }
    if let Some(context) = to_cancel {
      tracing::debug!(producer = self.name, "last subscriber left, cancelling upstream");
      context.cancel();
    }

    removed.deliver(true, |consumer| {
      let context = &removed.context;
      report(
        "on_producer_finish_with_cancellation",
        context
          .listener()
          .on_producer_finish_with_cancellation(context.id(), self.name, None),
      );
      consumer.on_cancellation();
    });
  }
}

/// Registered on each subscriber's context.
struct SubscriberCallbacks<K, T> {
  multiplexer: Weak<Multiplexer<K, T>>,
  subscriber_id: u64,
}

impl<K, T> ProducerContextCallbacks for SubscriberCallbacks<K, T>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  T: Shareable + Send + Sync + 'static,
{
  fn on_cancellation_requested(&self) {
    if let Some(multiplexer) = self.multiplexer.upgrade() {
      multiplexer.on_subscriber_cancelled(self.subscriber_id);
    }
  }

  fn on_is_prefetch_changed(&self) {
    if let Some(multiplexer) = self.multiplexer.upgrade() {
      let callbacks = multiplexer.state.lock().update_is_prefetch();
      ProducerContext::call_on_is_prefetch_changed(callbacks);
    }
  }

  fn on_is_intermediate_result_expected_changed(&self) {
    if let Some(multiplexer) = self.multiplexer.upgrade() {
      let callbacks = multiplexer.state.lock().update_is_intermediate_result_expected();
      ProducerContext::call_on_is_intermediate_result_expected_changed(callbacks);
    }
  }

  fn on_priority_changed(&self) {
    if let Some(multiplexer) = self.multiplexer.upgrade() {
      let callbacks = multiplexer.state.lock().update_priority();
      ProducerContext::call_on_priority_changed(callbacks);
    }
  }
}

/// The single consumer handed to the upstream producer.
struct ForwardingConsumer<K, T> {
  multiplexer: Arc<Multiplexer<K, T>>,
  generation: u64,
}

impl<K, T> Consumer<T> for ForwardingConsumer<K, T>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  T: Shareable + Send + Sync + 'static,
{
  fn on_new_result(&self, result: Option<&T>, status: Status) {
    self.multiplexer.on_next_result(self.generation, result, status);
  }

  fn on_failure(&self, error: &PipelineError) {
    self.multiplexer.on_failure(self.generation, error);
  }

  fn on_cancellation(&self) {
    self.multiplexer.on_upstream_cancelled(self.generation);
  }

  fn on_progress_update(&self, progress: f32) {
    self.multiplexer.on_progress_update(self.generation, progress);
  }
}

struct MultiplexShared<K, T> {
  name: &'static str,
  count_extra: Arc<str>,
  input: Arc<dyn Producer<T>>,
  key_fn: KeyFn<K>,
  keep_cancelled_fetch_as_low_priority: bool,
  multiplexers: Mutex<HashMap<K, Arc<Multiplexer<K, T>>>>,
  next_subscriber_id: AtomicU64,
}

impl<K: Eq + Hash, T> MultiplexShared<K, T> {
  /// Removes `multiplexer` from the registry if it is still the one
  /// registered under `key`.
  fn remove(&self, key: &K, multiplexer: &Arc<Multiplexer<K, T>>) {
    let removed = {
      let mut registry = self.multiplexers.lock();
      match registry.get(key) {
        Some(registered) if Arc::ptr_eq(registered, multiplexer) => registry.remove(key),
        _ => None,
      }
    };
    drop(removed);
  }
}

/// A producer that runs at most one upstream request per key at a time.
pub struct MultiplexProducer<K, T> {
  shared: Arc<MultiplexShared<K, T>>,
}

impl<K, T> MultiplexProducer<K, T>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  T: Shareable + Send + Sync + 'static,
{
  /// Creates a multiplexer in front of `input`, grouping requests by the key
  /// `key_fn` derives from their context.
  ///
  /// With `keep_cancelled_fetch_as_low_priority`, a non-prefetch request whose
  /// last subscriber leaves keeps running at [`Priority::Low`] so a later
  /// identical request can join it.
  pub fn new<F>(
    name: &'static str,
    input: Arc<dyn Producer<T>>,
    key_fn: F,
    keep_cancelled_fetch_as_low_priority: bool,
  ) -> Self
  where
    F: Fn(&ProducerContext) -> K + Send + Sync + 'static,
  {
    Self {
      shared: Arc::new(MultiplexShared {
        name,
        count_extra: Arc::from(format!("{name}_count")),
        input,
        key_fn: Arc::new(key_fn),
        keep_cancelled_fetch_as_low_priority,
        multiplexers: Mutex::new(HashMap::new()),
        next_subscriber_id: AtomicU64::new(0),
      }),
    }
  }

  /// The extra key under which the number of served subscribers is recorded.
  pub fn count_extra(&self) -> &str {
    &self.shared.count_extra
  }

  /// The number of distinct keys with a request in flight.
  pub fn in_flight_count(&self) -> usize {
    self.shared.multiplexers.lock().len()
  }
}

impl<K, T> Producer<T> for MultiplexProducer<K, T>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  T: Shareable + Send + Sync + 'static,
{
  fn produce_results(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<ProducerContext>) {
    let shared = &self.shared;
    report(
      "on_producer_start",
      context.listener().on_producer_start(context.id(), shared.name),
    );

    let key = (shared.key_fn)(&context);
    let subscriber = Arc::new(Subscriber {
      id: shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed),
      consumer,
      context,
      delivery: ReentrantMutex::new(()),
      finished: AtomicBool::new(false),
    });

    loop {
      let (multiplexer, created) = {
        let mut registry = shared.multiplexers.lock();
        match registry.get(&key) {
          Some(existing) => (Arc::clone(existing), false),
          None => {
            let created = Arc::new(Multiplexer::new(key.clone(), shared));
            registry.insert(key.clone(), Arc::clone(&created));
            (created, true)
          }
        }
      };

      if multiplexer.add_new_consumer(&subscriber) {
        if created {
          multiplexer.start_input_if_has_subscribers();
        } else {
          tracing::trace!(producer = shared.name, "joined in-flight request");
        }
        return;
      }
      // Finished between lookup and subscription. Make sure it is gone and retry.
      shared.remove(&key, &multiplexer);
    }
  }
}

impl<K, T> fmt::Debug for MultiplexProducer<K, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MultiplexProducer")
      .field("name", &self.shared.name)
      .field("in_flight", &self.shared.multiplexers.lock().len())
      .field(
        "keep_cancelled_fetch_as_low_priority",
        &self.shared.keep_cancelled_fetch_as_low_priority,
      )
      .finish_non_exhaustive()
  }
}
