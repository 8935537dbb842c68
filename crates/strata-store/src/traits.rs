use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use strata_crypto::KeyStrategy;
use strata_types::{BlobContext, BlobStatus, BlobUpdate};
use tracing::debug;

use crate::error::{IoResultExt, StoreError, StoreResult};
use crate::kind::StoreKind;

/// A key/value store of immutable blobs.
///
/// All implementations must satisfy these invariants:
/// - Bytes stored under a key never change. Digest keys guarantee this by
///   construction; document keys are only rewritten through a transactional
///   layer that versions them.
/// - A write is either fully visible under its key or not at all.
/// - With a digest strategy, writing content that already exists is a no-op
///   that returns the existing key.
/// - `delete_blob` on a missing key succeeds.
/// - Reads of a missing key return `Ok(false)` / `Ok(None)`, never an error.
pub trait BlobStore: Send + Sync {
    /// Name used in logs and traces.
    fn name(&self) -> &str;

    fn kind(&self) -> StoreKind;

    fn key_strategy(&self) -> &KeyStrategy;

    /// Store the blob described by `context` and return its key.
    fn write_blob(&self, context: &BlobContext) -> StoreResult<String>;

    /// Store the content of a local file under an already-known key.
    fn write_file(&self, key: &str, file: &Path) -> StoreResult<()>;

    /// Copy the blob's bytes into `dest`. Returns `false` if the key is
    /// unknown.
    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool>;

    /// Read the whole blob into memory.
    fn read_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        if let Some(path) = self.get_file(key)? {
            return match fs::read(&path) {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StoreError::io(key, e)),
            };
        }
        let tmp = tempfile::NamedTempFile::new()?;
        if !self.read_blob(key, tmp.path())? {
            return Ok(None);
        }
        Ok(Some(fs::read(tmp.path()).with_key(key)?))
    }

    /// Path of a local file holding the blob's plaintext bytes, for stores
    /// that have one. The file must be treated as read-only.
    fn get_file(&self, _key: &str) -> StoreResult<Option<PathBuf>> {
        Ok(None)
    }

    fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Returns `true` if [`copy_blob`](Self::copy_blob) from `source` can
    /// avoid streaming bytes through this process.
    fn copy_blob_is_optimized(&self, _source: &dyn BlobStore) -> bool {
        false
    }

    /// Copy (or move, when `atomic_move`) `source_key` from `source` into
    /// this store under `key`. Returns `false` if the source blob is missing.
    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        copy_blob_generic(self, key, source, source_key, atomic_move)
    }

    /// Delete a blob. Deleting a missing key is a no-op.
    fn delete_blob(&self, key: &str) -> StoreResult<()>;

    /// Change how a blob is kept (storage class, restore, legal hold).
    fn update_blob(&self, _key: &str, _update: &BlobUpdate) -> StoreResult<()> {
        Err(StoreError::Unsupported {
            store: self.name().to_string(),
            operation: "update_blob",
        })
    }

    /// Tiering status of a blob. Stores without tiers report every existing
    /// blob as hot.
    fn status(&self, key: &str) -> StoreResult<BlobStatus> {
        if self.exists(key)? {
            Ok(BlobStatus::hot())
        } else {
            Err(StoreError::NotFound(key.to_string()))
        }
    }

    /// All keys currently stored.
    fn list_keys(&self) -> StoreResult<Vec<String>>;

    /// Remove every blob. Intended for tests and resets.
    fn clear(&self) -> StoreResult<()>;
}

/// Byte-level copy from any store into any store.
///
/// Uses the source's local file when it has one, otherwise downloads into a
/// temp file, then writes it into `dest` under `key`. With `atomic_move` the
/// source blob is deleted once the destination write succeeded.
pub fn copy_blob_generic<S: BlobStore + ?Sized>(
    dest: &S,
    key: &str,
    source: &dyn BlobStore,
    source_key: &str,
    atomic_move: bool,
) -> StoreResult<bool> {
    debug!(
        dest = dest.name(),
        source = source.name(),
        key,
        source_key,
        atomic_move,
        "generic blob copy"
    );
    if let Some(path) = source.get_file(source_key)? {
        match dest.write_file(key, &path) {
            Ok(()) => {}
            // Raced with a delete in the source.
            Err(StoreError::Io { source: e, .. }) | Err(StoreError::Fs(e))
                if e.kind() == io::ErrorKind::NotFound && !path.exists() =>
            {
                return Ok(false)
            }
            Err(e) => return Err(e),
        }
    } else {
        let tmp = tempfile::NamedTempFile::new()?;
        if !source.read_blob(source_key, tmp.path())? {
            return Ok(false);
        }
        dest.write_file(key, tmp.path())?;
    }
    if atomic_move {
        source.delete_blob(source_key)?;
    }
    Ok(true)
}
