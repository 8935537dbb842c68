//! On-disk blob cache for Strata.
//!
//! [`CachingBlobStore`] keeps a bounded local mirror of a slower store.
//! Writes go through to the wrapped store first and are then cached; reads
//! are served from the cache when possible. The cache is bounded by total
//! bytes and entry count, evicting least recently accessed entries that are
//! older than a minimum age.

pub mod config;
pub mod store;
pub mod sweeper;

pub use config::CacheConfig;
pub use store::CachingBlobStore;
pub use sweeper::CacheSweeper;
