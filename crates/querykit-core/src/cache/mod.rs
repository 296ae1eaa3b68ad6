//! Caches: a generic most-recently-used list and the compiled query cache
//! built on it.

mod mru;
mod query_cache;

pub use mru::{CacheStats, MruCache};
pub use query_cache::{QueryCache, LIFTED_PREFIX};
