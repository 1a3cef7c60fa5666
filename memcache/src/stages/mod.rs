//! The producer stages an [`ImagePipeline`](crate::pipeline::ImagePipeline)
//! chains together: memory cache lookups, decoding, and the network fetch.

pub mod decode;
pub mod fetch;
pub mod memory_cache;

pub use decode::{DecodeOptions, DecodeProducer, Decoder};
pub use fetch::{FetchCallback, FetchState, NetworkFetchProducer, NetworkFetcher};
pub use memory_cache::MemoryCacheProducer;
