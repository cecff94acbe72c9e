//! Result cache
//!
//! - [`key`]: canonical fingerprints of (document, operation, options)
//! - [`store`]: TTL + LRU index over a storage backend
//! - [`backend`]: byte-oriented persistence (memory, disk)

pub mod backend;
pub mod key;
pub mod store;

pub use backend::{CacheBackend, CacheError, DiskBackend, MemoryBackend};
pub use key::{canonical_options, CacheKey};
pub use store::{CacheConfig, CacheStats, CacheStore, CachedResult};
