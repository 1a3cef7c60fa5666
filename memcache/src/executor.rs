use std::fmt;
use std::sync::Arc;

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking pipeline work (decoding) away from the delivering thread.
pub trait Executor: Send + Sync + 'static {
  fn execute(&self, job: Job);
}

/// Runs every job on the calling thread. Useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
  fn execute(&self, job: Job) {
    job()
  }
}

/// Runs jobs on a fixed-size pool of named worker threads.
///
/// Jobs beyond the pool size queue up instead of spawning more threads.
/// Clones share the pool.
#[derive(Clone)]
pub struct ThreadExecutor {
  name: Arc<str>,
  // `None` when the pool could not be built; jobs then go to rayon's global
  // pool, which is bounded as well.
  pool: Option<Arc<rayon::ThreadPool>>,
}

impl ThreadExecutor {
  /// A pool with one worker per available core.
  pub fn new(name: impl Into<Arc<str>>) -> Self {
    Self::build(name.into(), None)
  }

  /// A pool with exactly `threads` workers (at least one).
  pub fn with_threads(name: impl Into<Arc<str>>, threads: usize) -> Self {
    Self::build(name.into(), Some(threads.max(1)))
  }

  fn build(name: Arc<str>, threads: Option<usize>) -> Self {
    let thread_name = Arc::clone(&name);
    let panic_name = Arc::clone(&name);
    let mut builder = rayon::ThreadPoolBuilder::new()
      .thread_name(move |i| format!("{thread_name}-{i}"))
      .panic_handler(move |_| tracing::error!(executor = %panic_name, "job panicked"));
    if let Some(threads) = threads {
      builder = builder.num_threads(threads);
    }
    let pool = match builder.build() {
      Ok(pool) => Some(Arc::new(pool)),
      Err(error) => {
        tracing::error!(executor = %name, %error, "failed to build worker pool, using the global pool");
        None
      }
    };
    Self { name, pool }
  }

  /// The number of worker threads jobs are spread over.
  pub fn threads(&self) -> usize {
    match &self.pool {
      Some(pool) => pool.current_num_threads(),
      None => rayon::current_num_threads(),
    }
  }
}

impl Default for ThreadExecutor {
  fn default() -> Self {
    Self::new("fibre-memcache-worker")
  }
}

impl fmt::Debug for ThreadExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ThreadExecutor")
      .field("name", &self.name)
      .field("threads", &self.threads())
      .finish()
  }
}

impl Executor for ThreadExecutor {
  fn execute(&self, job: Job) {
    match &self.pool {
      Some(pool) => pool.spawn(job),
      None => rayon::spawn(job),
    }
  }
}

/// Runs jobs on the blocking pool of a Tokio runtime.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioExecutor(tokio::runtime::Handle);

#[cfg(feature = "tokio")]
impl TokioExecutor {
  /// Creates an executor that uses the current Tokio runtime context.
  /// Panics if called outside of a Tokio runtime.
  pub fn new() -> Self {
    Self(tokio::runtime::Handle::current())
  }

  pub fn from_handle(handle: tokio::runtime::Handle) -> Self {
    Self(handle)
  }
}

#[cfg(feature = "tokio")]
impl Executor for TokioExecutor {
  fn execute(&self, job: Job) {
    // The join handle is dropped; the job runs to completion regardless.
    drop(self.0.spawn_blocking(job));
  }
}

/// The executor a pipeline uses when none is configured: the Tokio blocking
/// pool when built with `tokio` inside a runtime, otherwise a fixed-size
/// worker pool.
pub(crate) fn default_executor() -> Arc<dyn Executor> {
  #[cfg(feature = "tokio")]
  {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      return Arc::new(TokioExecutor::from_handle(handle));
    }
  }
  Arc::new(ThreadExecutor::default())
}
