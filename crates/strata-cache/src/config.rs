use std::path::PathBuf;
use std::time::Duration;

/// Default total size bound: 100 MiB.
pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;

pub const DEFAULT_MAX_COUNT: usize = 10_000;

/// Default minimum age before an entry may be evicted.
pub const DEFAULT_MIN_AGE: Duration = Duration::from_secs(60 * 60);

/// Bounds and location of a blob cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding cached files. Owned exclusively by the cache.
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub max_count: usize,
    /// Entries accessed more recently than this are never evicted.
    pub min_age: Duration,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: DEFAULT_MAX_BYTES,
            max_count: DEFAULT_MAX_COUNT,
            min_age: DEFAULT_MIN_AGE,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }
}
