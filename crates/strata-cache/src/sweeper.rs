use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use strata_store::{BlobStore, StoreResult};
use tracing::debug;

use crate::store::CachingBlobStore;

/// Periodic eviction pass over a cache.
///
/// Dropping the handle stops the thread and waits for it. The thread also
/// exits on its own once the cache itself is dropped.
pub struct CacheSweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CachingBlobStore {
    /// Run [`evict`](CachingBlobStore::evict) every `interval` on a
    /// background thread.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> StoreResult<CacheSweeper> {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let cache: Weak<CachingBlobStore> = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("strata-cache-sweeper".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        let evicted = cache.evict();
                        if evicted > 0 {
                            debug!(cache = %cache.name(), evicted, "periodic eviction");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(CacheSweeper {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl CacheSweeper {
    /// Stop the sweeper and wait for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use strata_crypto::KeyStrategy;
    use strata_store::{LocalBlobStore, PathStrategy};
    use strata_types::{BlobContext, BlobSource, ManualClock, MAIN_XPATH};

    #[test]
    fn sweeper_evicts_once_entries_age() {
        let backend_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            LocalBlobStore::open("b", backend_dir.path(), PathStrategy::Flat, KeyStrategy::DocId)
                .unwrap(),
        );
        let clock = Arc::new(ManualClock::starting_now());
        let cache = Arc::new(
            CachingBlobStore::open_with_clock(
                "c",
                backend,
                CacheConfig::new(cache_dir.path())
                    .with_max_count(1)
                    .with_min_age(Duration::from_secs(60)),
                clock.clone(),
            )
            .unwrap(),
        );
        for id in ["1", "2", "3"] {
            let ctx = BlobContext::new(BlobSource::from_bytes(&b"x"[..])).with_doc(id, MAIN_XPATH);
            cache.write_blob(&ctx).unwrap();
        }
        assert_eq!(cache.cached_count(), 3);

        let sweeper = cache.start_sweeper(Duration::from_millis(5)).unwrap();
        clock.advance(Duration::from_secs(120));
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while cache.cached_count() > 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();
        assert_eq!(cache.cached_count(), 1);
    }

    #[test]
    fn sweeper_exits_when_cache_dropped() {
        let backend_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            LocalBlobStore::open("b", backend_dir.path(), PathStrategy::Flat, KeyStrategy::DocId)
                .unwrap(),
        );
        let cache =
            Arc::new(CachingBlobStore::open("c", backend, CacheConfig::new(cache_dir.path())).unwrap());
        let sweeper = cache.start_sweeper(Duration::from_millis(1)).unwrap();
        drop(cache);
        // Joins without hanging.
        drop(sweeper);
    }
}
