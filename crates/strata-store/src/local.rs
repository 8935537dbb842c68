use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use strata_crypto::KeyStrategy;
use strata_types::BlobContext;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{IoResultExt, StoreError, StoreResult};
use crate::kind::StoreKind;
use crate::path::{PathStrategy, TMP_PREFIX};
use crate::trace::Tracer;
use crate::traits::{copy_blob_generic, BlobStore};

/// Blob store backed by files under a root directory.
///
/// Every write goes to a `.tmp-*` file in the root first and is renamed into
/// place, so a blob is either fully present or absent. Temp files left over
/// from a crash are removed when the store is opened.
pub struct LocalBlobStore {
    name: String,
    root: PathBuf,
    path_strategy: PathStrategy,
    key_strategy: KeyStrategy,
    tracer: Tracer,
}

impl LocalBlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        path_strategy: PathStrategy,
        key_strategy: KeyStrategy,
    ) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self {
            name: name.into(),
            root,
            path_strategy,
            key_strategy,
            tracer: Tracer::disabled(),
        };
        store.remove_stale_temp_files()?;
        Ok(store)
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_strategy(&self) -> PathStrategy {
        self.path_strategy
    }

    /// Where `key` lives (whether or not it exists).
    pub fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        self.path_strategy.path_for_key(&self.root, key)
    }

    fn tmp_path(&self) -> PathBuf {
        self.root
            .join(format!("{TMP_PREFIX}{}", Uuid::new_v4().simple()))
    }

    fn remove_stale_temp_files(&self) -> StoreResult<()> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if PathStrategy::is_temp_file(&path) {
                debug!(store = %self.name, path = %path.display(), "removing stale temp file");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(store = %self.name, path = %path.display(), error = %e, "could not remove stale temp file");
                }
            }
        }
        Ok(())
    }

    /// Move a finished temp file into place under `key`.
    ///
    /// With a dedup strategy an existing blob wins and the temp file is
    /// dropped; otherwise the new content replaces the old atomically.
    fn install(&self, tmp: &Path, key: &str) -> StoreResult<()> {
        let dest = self.path_for(key)?;
        if self.key_strategy.use_dedup() && dest.is_file() {
            self.tracer.record(&self.name, "exists", key);
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_key(key)?;
        }
        fs::rename(tmp, &dest).with_key(key)?;
        self.tracer.record(&self.name, "write", key);
        Ok(())
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove temp file");
        }
    }
}

impl BlobStore for LocalBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    fn write_blob(&self, context: &BlobContext) -> StoreResult<String> {
        let mut write = self.key_strategy.write_context(context)?;
        let tmp = scopeguard::guard(self.tmp_path(), |p| remove_quietly(&p));
        {
            let mut out = BufWriter::new(File::create(&*tmp)?);
            write.transfer(&mut out)?;
            out.into_inner()
                .map_err(|e| e.into_error())?
                .sync_all()?;
        }
        let key = write
            .key()
            .ok_or_else(|| StoreError::Config("key strategy produced no key".into()))?
            .to_string();
        self.install(&tmp, &key)?;
        Ok(key)
    }

    fn write_file(&self, key: &str, file: &Path) -> StoreResult<()> {
        if self.key_strategy.use_dedup() && self.exists(key)? {
            self.tracer.record(&self.name, "exists", key);
            return Ok(());
        }
        let tmp = scopeguard::guard(self.tmp_path(), |p| remove_quietly(&p));
        fs::copy(file, &*tmp).with_key(key)?;
        self.install(&tmp, key)
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        match fs::copy(&path, dest) {
            Ok(_) => {
                self.tracer.record(&self.name, "read", key);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !path.exists() => {
                self.tracer.record(&self.name, "read-missing", key);
                Ok(false)
            }
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn get_file(&self, key: &str) -> StoreResult<Option<PathBuf>> {
        let path = self.path_for(key)?;
        Ok(path.is_file().then_some(path))
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        source.kind().is_local()
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        if !self.copy_blob_is_optimized(source) {
            return copy_blob_generic(self, key, source, source_key, atomic_move);
        }
        let Some(src) = source.get_file(source_key)? else {
            return Ok(false);
        };
        if self.key_strategy.use_dedup() && self.exists(key)? {
            self.tracer.record(&self.name, "exists", key);
            if atomic_move {
                source.delete_blob(source_key)?;
            }
            return Ok(true);
        }
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_key(key)?;
        }
        if atomic_move {
            match fs::rename(&src, &dest) {
                Ok(()) => {
                    self.tracer
                        .record(&self.name, "move", format_args!("{}:{source_key} -> {key}", source.name()));
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(e) => {
                    // Typically a cross-device rename.
                    debug!(store = %self.name, key, error = %e, "rename failed, copying instead");
                }
            }
        }
        let tmp = scopeguard::guard(self.tmp_path(), |p| remove_quietly(&p));
        match fs::copy(&src, &*tmp) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StoreError::io(key, e)),
        }
        fs::rename(&*tmp, &dest).with_key(key)?;
        self.tracer
            .record(&self.name, "copy", format_args!("{}:{source_key} -> {key}", source.name()));
        if atomic_move {
            source.delete_blob(source_key)?;
        }
        Ok(true)
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                self.tracer.record(&self.name, "delete", key);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn list_keys(&self) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| StoreError::Fs(e.into()))?;
            if !entry.file_type().is_file() || PathStrategy::is_temp_file(entry.path()) {
                continue;
            }
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(PathStrategy::key_from_file_name)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.root)?;
        self.tracer.record(&self.name, "clear", "*");
        Ok(())
    }
}
