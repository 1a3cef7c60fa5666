//! A reference-counted, size-bounded memory cache for decoded images and
//! encoded bytes, with coalescing of duplicate in-flight requests.
//!
//! # Features
//! - **Pinned In-Use Entries**: Values handed to callers are never evicted;
//!   only exclusively owned entries age out, in LRU order.
//! - **Exact Release**: Every cached value sits behind a [`CloseableRef`] and
//!   is released exactly once, after the cache and every client let go.
//! - **Memory Pressure**: Caches shed evictable entries through a
//!   [`TrimRegistry`] with per-cache trim strategies.
//! - **Request Multiplexing**: Concurrent identical requests share one
//!   upstream fetch, with priority and prefetch flags recomputed as callers
//!   join and leave.
//! - **Observability**: Stats trackers, producer listeners and lock-free
//!   cache counters.
//! - **Configuration**: Optional `serde` feature for loading cache limits.

// Public modules that form the API
pub mod cache;
pub mod cache_key;
pub mod error;
pub mod executor;
pub mod image;
pub mod listener;
pub mod metrics;
pub mod multiplex;
pub mod pipeline;
pub mod producers;
pub mod reference;
pub mod stages;
pub mod trimmable;

// Re-export the primary user-facing types for convenience
pub use cache::params::MemoryCacheParams;
pub use cache::trim::MemoryTrimType;
pub use cache::{CountingMemoryCache, MemoryCache, MemoryCacheBuilder};
pub use cache_key::{BitmapMemoryCacheKey, CacheKey, CacheKeyFactory, SimpleCacheKey};
pub use error::{BuildError, PipelineError, ReferenceError};
pub use executor::Executor;
pub use image::{DecodedImage, EncodedImage};
pub use listener::{CacheEventListener, EvictionReason, ImageCacheStatsTracker};
pub use metrics::CacheStats;
pub use multiplex::MultiplexProducer;
pub use pipeline::{ImagePipeline, ImagePipelineConfig};
pub use producers::{Consumer, Priority, Producer, ProducerContext, Status};
pub use reference::CloseableRef;
pub use trimmable::{MemoryTrimmable, MemoryTrimmableRegistry, TrimRegistry};

#[cfg(feature = "tokio")]
pub use executor::TokioExecutor;
