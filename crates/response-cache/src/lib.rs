//! Content-addressed response cache
//!
//! Memoizes complete (non-streaming) upstream chat responses under a
//! canonical hash of the request. Entries expire after a TTL, the coldest
//! entry is evicted in O(1) once the cache is full, and the whole cache is
//! written to the document store periodically and on shutdown when it has
//! changed.

pub mod cache;
pub mod key;
pub mod lru;

pub use cache::{CACHE_DOCUMENT, CacheConfig, CacheEntry, CacheStats, PERSIST_INTERVAL, ResponseCache};
pub use key::{KEY_VERSION, cache_key};
pub use lru::LruList;
