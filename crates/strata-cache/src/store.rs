use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use strata_crypto::KeyStrategy;
use strata_store::{
    BlobStore, IoResultExt, PathStrategy, StoreError, StoreKind, StoreResult, Tracer, TMP_PREFIX,
};
use strata_types::{BlobContext, BlobStatus, BlobUpdate, Clock, SystemClock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CacheConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
    size: u64,
    last_access: SystemTime,
    /// Distinguishes a reinstalled file from the one it replaced.
    installed: u64,
}

/// Write-through cache in front of another blob store.
///
/// Cached files are named by the percent-encoded key, flat under the cache
/// directory, and are only ever created by rename and removed by unlink, so
/// a reader that already opened a file keeps valid bytes even if the entry
/// is evicted meanwhile. Both happen under the index lock, so the index and
/// the directory never disagree about a name.
pub struct CachingBlobStore {
    name: String,
    inner: Arc<dyn BlobStore>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    tracer: Tracer,
    /// Encoded file name -> entry.
    index: Mutex<HashMap<String, Entry>>,
    installs: AtomicU64,
    evict_lock: Mutex<()>,
}

impl CachingBlobStore {
    /// Open a cache over `inner`, indexing whatever the cache directory
    /// already holds.
    pub fn open(
        name: impl Into<String>,
        inner: Arc<dyn BlobStore>,
        config: CacheConfig,
    ) -> StoreResult<Self> {
        Self::open_with_clock(name, inner, config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        name: impl Into<String>,
        inner: Arc<dyn BlobStore>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        fs::create_dir_all(&config.dir)?;
        let store = Self {
            name: name.into(),
            inner,
            config,
            clock,
            tracer: Tracer::disabled(),
            index: Mutex::new(HashMap::new()),
            installs: AtomicU64::new(0),
            evict_lock: Mutex::new(()),
        };
        store.rebuild_index()?;
        Ok(store)
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn inner(&self) -> &Arc<dyn BlobStore> {
        &self.inner
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cached_bytes(&self) -> u64 {
        self.index.lock().values().map(|e| e.size).sum()
    }

    pub fn cached_count(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.index.lock().contains_key(&PathStrategy::safe_path(key))
    }

    fn rebuild_index(&self) -> StoreResult<()> {
        let mut index = self.index.lock();
        index.clear();
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            let path = entry.path();
            if PathStrategy::is_temp_file(&path) {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(cache = %self.name, path = %path.display(), error = %e, "could not remove stale temp file");
                }
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let last_access = meta.modified().unwrap_or_else(|_| self.clock.now());
            index.insert(
                name,
                Entry {
                    size: meta.len(),
                    last_access,
                    installed: 0,
                },
            );
        }
        let total: u64 = index.values().map(|e| e.size).sum();
        info!(cache = %self.name, entries = index.len(), bytes = total, dir = %self.config.dir.display(), "cache index loaded");
        Ok(())
    }

    /// Cache file for `key` and its index name.
    fn entry_path(&self, key: &str) -> StoreResult<(PathBuf, String)> {
        let path = PathStrategy::Flat.path_for_key(&self.config.dir, key)?;
        Ok((path, PathStrategy::safe_path(key)))
    }

    fn tmp_path(&self) -> PathBuf {
        self.config
            .dir
            .join(format!("{TMP_PREFIX}{}", Uuid::new_v4().simple()))
    }

    fn touch(&self, name: &str, path: &Path) {
        let now = self.clock.now();
        if let Some(entry) = self.index.lock().get_mut(name) {
            entry.last_access = now;
        }
        // Persist recency for the next index rebuild; failure only costs
        // accuracy of eviction order.
        if let Ok(file) = File::options().write(true).open(path) {
            let _ = file.set_modified(now);
        }
    }

    /// Move a finished temp file into the cache under `key`, then evict.
    fn install(&self, key: &str, tmp: &Path) -> StoreResult<()> {
        let (path, name) = self.entry_path(key)?;
        let size = fs::metadata(tmp).with_key(key)?.len();
        let now = self.clock.now();
        {
            let mut index = self.index.lock();
            fs::rename(tmp, &path).with_key(key)?;
            index.insert(
                name,
                Entry {
                    size,
                    last_access: now,
                    installed: self.installs.fetch_add(1, Ordering::Relaxed) + 1,
                },
            );
        }
        if let Ok(file) = File::options().write(true).open(&path) {
            let _ = file.set_modified(now);
        }
        self.evict();
        Ok(())
    }

    fn populate_from(&self, key: &str, mut source: impl Read) -> StoreResult<()> {
        let tmp = scopeguard::guard(self.tmp_path(), |p| {
            let _ = fs::remove_file(p);
        });
        {
            let mut out = File::create(&*tmp).with_key(key)?;
            io::copy(&mut source, &mut out).with_key(key)?;
        }
        self.install(key, &tmp)
    }

    /// Cache population after a successful write is best effort.
    fn populate_after_write(&self, key: &str, result: StoreResult<()>) {
        if let Err(e) = result {
            warn!(cache = %self.name, key, error = %e, "could not populate cache after write");
            self.invalidate(key);
        }
    }

    fn invalidate(&self, key: &str) {
        let Ok((path, name)) = self.entry_path(key) else {
            return;
        };
        let mut index = self.index.lock();
        if index.remove(&name).is_some() {
            debug!(cache = %self.name, key, "cache entry invalidated");
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(cache = %self.name, key, error = %e, "could not remove cached file"),
        }
    }

    /// Evict least recently accessed entries until both bounds hold, never
    /// touching entries younger than the minimum age.
    pub fn evict(&self) -> usize {
        let _evicting = self.evict_lock.lock();
        let now = self.clock.now();
        let mut entries: Vec<(String, Entry)> = self
            .index
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect();
        let mut total_bytes: u64 = entries.iter().map(|(_, e)| e.size).sum();
        let mut count = entries.len();
        if total_bytes <= self.config.max_bytes && count <= self.config.max_count {
            return 0;
        }
        entries.sort_by(|(ka, a), (kb, b)| a.last_access.cmp(&b.last_access).then_with(|| ka.cmp(kb)));

        let mut evicted = 0;
        for (name, entry) in entries {
            if total_bytes <= self.config.max_bytes && count <= self.config.max_count {
                break;
            }
            let age = now.duration_since(entry.last_access).unwrap_or_default();
            if age < self.config.min_age {
                debug!(cache = %self.name, file = %name, "oldest entry below minimum age, eviction stops");
                break;
            }
            {
                let mut index = self.index.lock();
                // Re-touched by a reader or replaced since the snapshot.
                match index.get(&name) {
                    Some(current) if *current == entry => {
                        index.remove(&name);
                    }
                    _ => continue,
                }
                let path = self.config.dir.join(&name);
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(cache = %self.name, path = %path.display(), error = %e, "could not remove evicted file");
                    }
                }
            }
            total_bytes -= entry.size;
            count -= 1;
            evicted += 1;
            self.tracer.record(&self.name, "evict", &name);
        }
        if evicted > 0 {
            debug!(cache = %self.name, evicted, bytes = total_bytes, entries = count, "cache eviction pass");
        }
        evicted
    }

    /// Drop every cached file. The wrapped store is untouched.
    pub fn clear_cache(&self) -> StoreResult<()> {
        let _evicting = self.evict_lock.lock();
        let mut index = self.index.lock();
        for entry in fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            if path.is_file() {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        index.clear();
        self.tracer.record(&self.name, "clear-cache", "*");
        Ok(())
    }
}

impl BlobStore for CachingBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Caching(Box::new(self.inner.kind()))
    }

    fn key_strategy(&self) -> &KeyStrategy {
        self.inner.key_strategy()
    }

    fn write_blob(&self, context: &BlobContext) -> StoreResult<String> {
        let key = self.inner.write_blob(context)?;
        let populated = context
            .source
            .open()
            .with_key(&key)
            .and_then(|source| self.populate_from(&key, source));
        self.populate_after_write(&key, populated);
        Ok(key)
    }

    fn write_file(&self, key: &str, file: &Path) -> StoreResult<()> {
        self.inner.write_file(key, file)?;
        let populated = File::open(file)
            .with_key(key)
            .and_then(|source| self.populate_from(key, source));
        self.populate_after_write(key, populated);
        Ok(())
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        let (path, name) = self.entry_path(key)?;
        if self.index.lock().contains_key(&name) {
            match fs::copy(&path, dest) {
                Ok(_) => {
                    self.touch(&name, &path);
                    self.tracer.record(&self.name, "hit", key);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Evicted meanwhile, unless a fresh copy already took
                    // its place.
                    let mut index = self.index.lock();
                    if !path.exists() {
                        index.remove(&name);
                    }
                }
                Err(e) => return Err(StoreError::io(key, e)),
            }
        }

        let tmp = scopeguard::guard(self.tmp_path(), |p| {
            let _ = fs::remove_file(p);
        });
        if !self.inner.read_blob(key, &tmp)? {
            return Ok(false);
        }
        fs::copy(&*tmp, dest).with_key(key)?;
        self.tracer.record(&self.name, "miss", key);
        if let Err(e) = self.install(key, &tmp) {
            warn!(cache = %self.name, key, error = %e, "could not populate cache after read");
        }
        Ok(true)
    }

    /// Goes through [`read_blob`](BlobStore::read_blob), so a hit refreshes
    /// recency and a file evicted mid-read falls back to the wrapped store.
    fn read_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let tmp = scopeguard::guard(self.tmp_path(), |p| {
            let _ = fs::remove_file(p);
        });
        if !self.read_blob(key, &tmp)? {
            return Ok(None);
        }
        Ok(Some(fs::read(&*tmp).with_key(key)?))
    }

    fn get_file(&self, key: &str) -> StoreResult<Option<PathBuf>> {
        let (path, name) = self.entry_path(key)?;
        if self.index.lock().contains_key(&name) && path.is_file() {
            return Ok(Some(path));
        }
        Ok(None)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        if self.is_cached(key) {
            return Ok(true);
        }
        self.inner.exists(key)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        self.inner.copy_blob_is_optimized(source)
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        self.invalidate(key);
        self.inner.copy_blob(key, source, source_key, atomic_move)
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        self.invalidate(key);
        self.inner.delete_blob(key)
    }

    fn update_blob(&self, key: &str, update: &BlobUpdate) -> StoreResult<()> {
        self.inner.update_blob(key, update)
    }

    fn status(&self, key: &str) -> StoreResult<BlobStatus> {
        self.inner.status(key)
    }

    fn list_keys(&self) -> StoreResult<Vec<String>> {
        self.inner.list_keys()
    }

    fn clear(&self) -> StoreResult<()> {
        self.clear_cache()?;
        self.inner.clear()
    }
}
