use crate::error::PipelineError;
use crate::executor::Executor;
use crate::image::{DecodedImage, EncodedImage};
use crate::listener::report;
use crate::producers::{
  Consumer, ExtraMap, Producer, ProducerContext, ResizeOptions, RotationOptions, Status,
};
use crate::reference::CloseableRef;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::HashMapExt;
use parking_lot::ReentrantMutex;

pub const DECODE_PRODUCER: &str = "DecodeProducer";

/// How a decoder should render an encoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeOptions {
  pub resize: Option<ResizeOptions>,
  pub rotation: RotationOptions,
  /// The bytes are an intermediate, possibly truncated, download.
  pub is_partial: bool,
}

/// Turns encoded bytes into a bitmap.
pub trait Decoder: Send + Sync {
  fn decode(
    &self,
    encoded: &EncodedImage,
    options: &DecodeOptions,
  ) -> Result<CloseableRef<DecodedImage>, PipelineError>;
}

impl<F> Decoder for F
where
  F: Fn(&EncodedImage, &DecodeOptions) -> Result<CloseableRef<DecodedImage>, PipelineError> + Send + Sync,
{
  fn decode(
    &self,
    encoded: &EncodedImage,
    options: &DecodeOptions,
  ) -> Result<CloseableRef<DecodedImage>, PipelineError> {
    self(encoded, options)
  }
}

/// Decodes the encoded results of its input on an [`Executor`].
///
/// Intermediate results are decoded only while the request expects them, and
/// an intermediate decode that is overtaken by a newer one is dropped.
pub struct DecodeProducer {
  decoder: Arc<dyn Decoder>,
  executor: Arc<dyn Executor>,
  input: Arc<dyn Producer<CloseableRef<EncodedImage>>>,
}

impl DecodeProducer {
  pub fn new(
    decoder: Arc<dyn Decoder>,
    executor: Arc<dyn Executor>,
    input: Arc<dyn Producer<CloseableRef<EncodedImage>>>,
  ) -> Self {
    Self {
      decoder,
      executor,
      input,
    }
  }
}

impl fmt::Debug for DecodeProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DecodeProducer").finish_non_exhaustive()
  }
}

impl Producer<CloseableRef<DecodedImage>> for DecodeProducer {
  fn produce_results(
    &self,
    consumer: Arc<dyn Consumer<CloseableRef<DecodedImage>>>,
    context: Arc<ProducerContext>,
  ) {
    report(
      "on_producer_start",
      context.listener().on_producer_start(context.id(), DECODE_PRODUCER),
    );
    let decoding = Arc::new_cyclic(|this| DecodingConsumer {
      this: this.clone(),
      consumer,
      context: Arc::clone(&context),
      decoder: Arc::clone(&self.decoder),
      executor: Arc::clone(&self.executor),
      scheduled: AtomicU64::new(0),
      delivered: AtomicU64::new(0),
      delivery: ReentrantMutex::new(()),
      finished: AtomicBool::new(false),
    });
    self.input.produce_results(decoding, context);
  }
}

struct DecodingConsumer {
  this: Weak<DecodingConsumer>,
  consumer: Arc<dyn Consumer<CloseableRef<DecodedImage>>>,
  context: Arc<ProducerContext>,
  decoder: Arc<dyn Decoder>,
  executor: Arc<dyn Executor>,
  // Sequence number of the newest scheduled and delivered decode.
  scheduled: AtomicU64,
  delivered: AtomicU64,
  delivery: ReentrantMutex<()>,
  finished: AtomicBool,
}

impl DecodingConsumer {
  /// Claims the terminal signal under the delivery lock and runs `deliver`.
  fn finish_with<F: FnOnce()>(&self, deliver: F) {
    let _delivery = self.delivery.lock();
    if !self.finished.swap(true, Ordering::AcqRel) {
      deliver();
    }
  }

  fn fail(&self, error: &PipelineError) {
    self.finish_with(|| {
      tracing::debug!(request = self.context.id(), %error, "decode failed");
      report(
        "on_producer_finish_with_failure",
        self
          .context
          .listener()
          .on_producer_finish_with_failure(self.context.id(), DECODE_PRODUCER, error, None),
      );
      self.consumer.on_failure(error);
    });
  }

  fn decode(&self, sequence: u64, encoded: CloseableRef<EncodedImage>, status: Status) {
    if self.finished.load(Ordering::Acquire) {
      return;
    }
    let is_last = status.is_last();
    if self.context.is_cancelled() {
      if is_last {
        Consumer::on_cancellation(self);
      }
      return;
    }
    if !is_last && self.scheduled.load(Ordering::Acquire) != sequence {
      return;
    }

    let image = match encoded.get() {
      Ok(image) => image,
      Err(error) => {
        if is_last {
          self.fail(&PipelineError::from(error));
        }
        return;
      }
    };
    let request = self.context.request();
    let options = DecodeOptions {
      resize: request.resize_options(),
      rotation: request.rotation_options(),
      is_partial: !is_last,
    };

    let decoded = match self.decoder.decode(image, &options) {
      Ok(decoded) => decoded,
      Err(error) if is_last => {
        self.fail(&error);
        return;
      }
      Err(error) => {
        tracing::trace!(request = self.context.id(), %error, "intermediate decode failed, waiting for more bytes");
        return;
      }
    };
    let encoded_size = image.size_in_bytes();
    drop(encoded);

    if is_last {
      self.finish_with(|| {
        let listener = self.context.listener();
        let extras = listener
          .requires_extra_map(self.context.id())
          .then(|| decode_extras(&decoded, encoded_size));
        report(
          "on_producer_finish_with_success",
          listener.on_producer_finish_with_success(self.context.id(), DECODE_PRODUCER, extras.as_ref()),
        );
        self.consumer.on_progress_update(1.0);
        self.consumer.on_new_result(Some(&decoded), status);
      });
      return;
    }

    let _delivery = self.delivery.lock();
    if self.finished.load(Ordering::Acquire) || self.delivered.load(Ordering::Acquire) >= sequence {
      return;
    }
    self.delivered.store(sequence, Ordering::Release);
    self.consumer.on_new_result(Some(&decoded), status);
  }
}

fn decode_extras(decoded: &CloseableRef<DecodedImage>, encoded_size: u64) -> ExtraMap {
  let mut extras = ExtraMap::new();
  extras.insert("encoded_size".to_string(), encoded_size.to_string());
  if let Ok(image) = decoded.get() {
    extras.insert(
      "bitmap_size".to_string(),
      format!("{}x{}", image.width(), image.height()),
    );
  }
  extras
}

impl Consumer<CloseableRef<EncodedImage>> for DecodingConsumer {
  fn on_new_result(&self, result: Option<&CloseableRef<EncodedImage>>, status: Status) {
    if self.finished.load(Ordering::Acquire) {
      return;
    }
    let is_last = status.is_last();
    let encoded = match result {
      Some(encoded) => encoded,
      None if is_last => {
        self.fail(&PipelineError::other("encoded image is missing"));
        return;
      }
      None => return,
    };
    if !is_last && !self.context.is_intermediate_result_expected() {
      return;
    }
    let Some(encoded) = encoded.clone_or_none() else {
      if is_last {
        self.fail(&PipelineError::from(crate::error::ReferenceError::Closed));
      }
      return;
    };
    let Some(this) = self.this.upgrade() else {
      return;
    };

    let sequence = self.scheduled.fetch_add(1, Ordering::AcqRel) + 1;
    self.executor.execute(Box::new(move || this.decode(sequence, encoded, status)));
  }

  fn on_failure(&self, error: &PipelineError) {
    self.fail(error);
  }

  fn on_cancellation(&self) {
    self.finish_with(|| {
      report(
        "on_producer_finish_with_cancellation",
        self
          .context
          .listener()
          .on_producer_finish_with_cancellation(self.context.id(), DECODE_PRODUCER, None),
      );
      self.consumer.on_cancellation();
    });
  }

  fn on_progress_update(&self, progress: f32) {
    let _delivery = self.delivery.lock();
    if !self.finished.load(Ordering::Acquire) {
      self.consumer.on_progress_update(progress);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::executor::InlineExecutor;
  use crate::producers::{ImageRequest, NoOpProducerListener};
  use parking_lot::Mutex;

  struct Bytes(Vec<(&'static [u8], Status)>);

  impl Producer<CloseableRef<EncodedImage>> for Bytes {
    fn produce_results(&self, consumer: Arc<dyn Consumer<CloseableRef<EncodedImage>>>, _context: Arc<ProducerContext>) {
      for (bytes, status) in &self.0 {
        consumer.on_new_result(Some(&CloseableRef::new(EncodedImage::new(*bytes))), *status);
      }
    }
  }

  #[derive(Default)]
  struct Collect {
    results: Mutex<Vec<(u32, bool)>>,
    failures: Mutex<Vec<String>>,
  }

  impl Consumer<CloseableRef<DecodedImage>> for Collect {
    fn on_new_result(&self, result: Option<&CloseableRef<DecodedImage>>, status: Status) {
      let width = result.and_then(|r| r.get().ok()).map_or(0, |image| image.width());
      self.results.lock().push((width, status.is_last()));
    }
    fn on_failure(&self, error: &PipelineError) {
      self.failures.lock().push(error.to_string());
    }
    fn on_cancellation(&self) {}
  }

  fn width_from_len() -> Arc<dyn Decoder> {
    Arc::new(|encoded: &EncodedImage, _options: &DecodeOptions| {
      if encoded.bytes().is_empty() {
        return Err(PipelineError::other("empty"));
      }
      Ok(CloseableRef::new(DecodedImage::new(encoded.bytes().len() as u32, 1, Vec::<u8>::new())))
    })
  }

  fn run(input: Bytes, progressive: bool) -> Arc<Collect> {
    let producer = DecodeProducer::new(width_from_len(), Arc::new(InlineExecutor), Arc::new(input));
    let consumer = Arc::new(Collect::default());
    let request = ImageRequest::new("u").with_progressive_rendering(progressive);
    let context = Arc::new(ProducerContext::new("1", request, Arc::new(NoOpProducerListener)));
    producer.produce_results(consumer.clone(), context);
    consumer
  }

  #[test]
  fn intermediates_decoded_only_when_expected() {
    let input = || Bytes(vec![(&b"ab"[..], Status::NO_FLAGS), (&b"abcd"[..], Status::IS_LAST)]);
    assert_eq!(*run(input(), true).results.lock(), vec![(2, false), (4, true)]);
    assert_eq!(*run(input(), false).results.lock(), vec![(4, true)]);
  }

  #[test]
  fn last_decode_failure_is_reported_once() {
    let consumer = run(Bytes(vec![(&b""[..], Status::IS_LAST), (&b"ab"[..], Status::IS_LAST)]), false);
    assert!(consumer.results.lock().is_empty());
    assert_eq!(*consumer.failures.lock(), vec!["empty".to_string()]);
  }
}
