use crate::error::{ListenerResult, PipelineError};
use crate::listener::forward_each;

use std::fmt;
use std::sync::Arc;

use ahash::HashMap;

/// Free-form diagnostic key/value pairs attached to producer events.
pub type ExtraMap = HashMap<String, String>;

/// Observes the progress of each pipeline stage for a request.
///
/// Hooks are identified by the request id and the name of the stage.
pub trait ProducerListener: Send + Sync {
  fn on_producer_start(&self, _request_id: &str, _producer_name: &str) -> ListenerResult {
    Ok(())
  }

  fn on_producer_event(&self, _request_id: &str, _producer_name: &str, _event_name: &str) -> ListenerResult {
    Ok(())
  }

  fn on_producer_finish_with_success(
    &self,
    _request_id: &str,
    _producer_name: &str,
    _extra_map: Option<&ExtraMap>,
  ) -> ListenerResult {
    Ok(())
  }

  fn on_producer_finish_with_failure(
    &self,
    _request_id: &str,
    _producer_name: &str,
    _error: &PipelineError,
    _extra_map: Option<&ExtraMap>,
  ) -> ListenerResult {
    Ok(())
  }

  fn on_producer_finish_with_cancellation(
    &self,
    _request_id: &str,
    _producer_name: &str,
    _extra_map: Option<&ExtraMap>,
  ) -> ListenerResult {
    Ok(())
  }

  /// The stage that actually produced the final result has been reached.
  fn on_ultimate_producer_reached(&self, _request_id: &str, _producer_name: &str, _successful: bool) -> ListenerResult {
    Ok(())
  }

  /// Whether stages should bother building extra maps for this request.
  fn requires_extra_map(&self, _request_id: &str) -> bool {
    false
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProducerListener;

impl ProducerListener for NoOpProducerListener {}

/// Fans every event out to a list of listeners. A failing listener is
/// logged and skipped.
#[derive(Default, Clone)]
pub struct ForwardingProducerListener {
  listeners: Vec<Arc<dyn ProducerListener>>,
}

impl ForwardingProducerListener {
  pub fn new(listeners: Vec<Arc<dyn ProducerListener>>) -> Self {
    Self { listeners }
  }

  pub fn add_listener(&mut self, listener: Arc<dyn ProducerListener>) {
    self.listeners.push(listener);
  }

  pub fn len(&self) -> usize {
    self.listeners.len()
  }

  pub fn is_empty(&self) -> bool {
    self.listeners.is_empty()
  }
}

impl fmt::Debug for ForwardingProducerListener {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ForwardingProducerListener")
      .field("listeners", &self.listeners.len())
      .finish()
  }
}

impl ProducerListener for ForwardingProducerListener {
  fn on_producer_start(&self, request_id: &str, producer_name: &str) -> ListenerResult {
    forward_each(&self.listeners, "on_producer_start", |l| {
      l.on_producer_start(request_id, producer_name)
    })
  }

  fn on_producer_event(&self, request_id: &str, producer_name: &str, event_name: &str) -> ListenerResult {
    forward_each(&self.listeners, "on_producer_event", |l| {
      l.on_producer_event(request_id, producer_name, event_name)
    })
  }

  fn on_producer_finish_with_success(
    &self,
    request_id: &str,
    producer_name: &str,
    extra_map: Option<&ExtraMap>,
  ) -> ListenerResult {
    forward_each(&self.listeners, "on_producer_finish_with_success", |l| {
      l.on_producer_finish_with_success(request_id, producer_name, extra_map)
    })
  }

  fn on_producer_finish_with_failure(
    &self,
    request_id: &str,
    producer_name: &str,
    error: &PipelineError,
    extra_map: Option<&ExtraMap>,
  ) -> ListenerResult {
    forward_each(&self.listeners, "on_producer_finish_with_failure", |l| {
      l.on_producer_finish_with_failure(request_id, producer_name, error, extra_map)
    })
  }

  fn on_producer_finish_with_cancellation(
    &self,
    request_id: &str,
    producer_name: &str,
    extra_map: Option<&ExtraMap>,
  ) -> ListenerResult {
    forward_each(&self.listeners, "on_producer_finish_with_cancellation", |l| {
      l.on_producer_finish_with_cancellation(request_id, producer_name, extra_map)
    })
  }

  fn on_ultimate_producer_reached(&self, request_id: &str, producer_name: &str, successful: bool) -> ListenerResult {
    forward_each(&self.listeners, "on_ultimate_producer_reached", |l| {
      l.on_ultimate_producer_reached(request_id, producer_name, successful)
    })
  }

  fn requires_extra_map(&self, request_id: &str) -> bool {
    self
      .listeners
      .iter()
      .any(|l| l.requires_extra_map(request_id))
  }
}

/// Told where the final result of each request came from.
pub trait ImageOriginListener: Send + Sync {
  fn on_image_loaded(
    &self,
    request_id: &str,
    origin: &str,
    successful: bool,
    ultimate_producer_name: &str,
  ) -> ListenerResult;
}

/// Fans origin reports out to a list of listeners. A failing listener is
/// logged and skipped.
#[derive(Default, Clone)]
pub struct ForwardingImageOriginListener {
  listeners: Vec<Arc<dyn ImageOriginListener>>,
}

impl ForwardingImageOriginListener {
  pub fn new(listeners: Vec<Arc<dyn ImageOriginListener>>) -> Self {
    Self { listeners }
  }

  pub fn add_listener(&mut self, listener: Arc<dyn ImageOriginListener>) {
    self.listeners.push(listener);
  }

  pub fn len(&self) -> usize {
    self.listeners.len()
  }

  pub fn is_empty(&self) -> bool {
    self.listeners.is_empty()
  }
}

impl fmt::Debug for ForwardingImageOriginListener {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ForwardingImageOriginListener")
      .field("listeners", &self.listeners.len())
      .finish()
  }
}

impl ImageOriginListener for ForwardingImageOriginListener {
  fn on_image_loaded(
    &self,
    request_id: &str,
    origin: &str,
    successful: bool,
    ultimate_producer_name: &str,
  ) -> ListenerResult {
    forward_each(&self.listeners, "on_image_loaded", |l| {
      l.on_image_loaded(request_id, origin, successful, ultimate_producer_name)
    })
  }
}

/// Maps the stage that answered a request to an origin and reports it to an
/// [`ImageOriginListener`].
pub struct ImageOriginRequestListener {
  origin_listener: Arc<dyn ImageOriginListener>,
  origin_of: fn(&str) -> &'static str,
}

impl ImageOriginRequestListener {
  /// `origin_of` names the origin for a producer name.
  pub fn new(origin_listener: Arc<dyn ImageOriginListener>, origin_of: fn(&str) -> &'static str) -> Self {
    Self {
      origin_listener,
      origin_of,
    }
  }
}

impl fmt::Debug for ImageOriginRequestListener {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ImageOriginRequestListener").finish_non_exhaustive()
  }
}

impl ProducerListener for ImageOriginRequestListener {
  fn on_ultimate_producer_reached(&self, request_id: &str, producer_name: &str, successful: bool) -> ListenerResult {
    let origin = (self.origin_of)(producer_name);
    self
      .origin_listener
      .on_image_loaded(request_id, origin, successful, producer_name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  struct Exploding;
  impl ProducerListener for Exploding {
    fn on_producer_start(&self, _request_id: &str, _producer_name: &str) -> ListenerResult {
      Err("boom".into())
    }
  }

  #[derive(Default)]
  struct Recording(Mutex<Vec<String>>);
  impl ProducerListener for Recording {
    fn on_producer_start(&self, request_id: &str, producer_name: &str) -> ListenerResult {
      self.0.lock().push(format!("{request_id}:{producer_name}"));
      Ok(())
    }
    fn requires_extra_map(&self, request_id: &str) -> bool {
      request_id == "7"
    }
  }

  #[test]
  fn fan_out_survives_failing_listener() {
    let recording = Arc::new(Recording::default());
    let exploding: Arc<dyn ProducerListener> = Arc::new(Exploding);
    let mut forwarding = ForwardingProducerListener::new(vec![exploding]);
    forwarding.add_listener(recording.clone());

    assert!(forwarding.on_producer_start("7", "Decode").is_ok());
    assert_eq!(*recording.0.lock(), vec!["7:Decode"]);
    assert!(forwarding.requires_extra_map("7"));
    assert!(!forwarding.requires_extra_map("8"));
  }

  #[derive(Default)]
  struct Origins(Mutex<Vec<String>>);
  impl ImageOriginListener for Origins {
    fn on_image_loaded(&self, request_id: &str, origin: &str, successful: bool, producer: &str) -> ListenerResult {
      self.0.lock().push(format!("{request_id}:{origin}:{successful}:{producer}"));
      Ok(())
    }
  }

  struct FailingOrigins;
  impl ImageOriginListener for FailingOrigins {
    fn on_image_loaded(&self, _: &str, _: &str, _: bool, _: &str) -> ListenerResult {
      Err("origin listener down".into())
    }
  }

  #[test]
  fn origin_fan_out_survives_failing_listener() {
    let origins = Arc::new(Origins::default());
    let failing: Arc<dyn ImageOriginListener> = Arc::new(FailingOrigins);
    let mut forwarding = ForwardingImageOriginListener::new(vec![failing]);
    forwarding.add_listener(origins.clone());

    let listener = ImageOriginRequestListener::new(Arc::new(forwarding), |name| {
      if name == "Fetch" { "network" } else { "unknown" }
    });
    assert!(listener.on_ultimate_producer_reached("1", "Fetch", true).is_ok());
    assert!(listener.on_ultimate_producer_reached("2", "Other", false).is_ok());
    assert!(listener.on_producer_start("3", "Fetch").is_ok());
    assert_eq!(*origins.0.lock(), vec!["1:network:true:Fetch", "2:unknown:false:Other"]);
  }
}
