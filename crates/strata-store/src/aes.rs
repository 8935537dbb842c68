use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use strata_crypto::{BlobCipher, CryptoError, KeyStrategy};
use strata_types::{BlobContext, BlobStatus, BlobUpdate};
use tracing::warn;

use crate::error::{IoResultExt, StoreError, StoreResult};
use crate::kind::StoreKind;
use crate::trace::Tracer;
use crate::traits::BlobStore;

/// Encrypts blobs on their way into another store.
///
/// Keys are computed over the plaintext, so digest keys and deduplication
/// behave exactly as they would without encryption. The wrapped store only
/// ever sees ciphertext, and plaintext never has a stable local file, which
/// is why [`get_file`](BlobStore::get_file) always returns `None` and copies
/// are never optimized.
pub struct AesBlobStore {
    name: String,
    inner: Arc<dyn BlobStore>,
    cipher: BlobCipher,
    key_strategy: KeyStrategy,
    tracer: Tracer,
}

impl AesBlobStore {
    pub fn new(name: impl Into<String>, inner: Arc<dyn BlobStore>, cipher: BlobCipher) -> Self {
        let key_strategy = inner.key_strategy().clone();
        Self {
            name: name.into(),
            inner,
            cipher,
            key_strategy,
            tracer: Tracer::disabled(),
        }
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn inner(&self) -> &Arc<dyn BlobStore> {
        &self.inner
    }

    fn encrypt_file(&self, key: &str, file: &Path) -> StoreResult<tempfile::NamedTempFile> {
        let mut sealed = tempfile::NamedTempFile::new()?;
        let input = BufReader::new(File::open(file).with_key(key)?);
        self.cipher
            .encrypt_stream(input, BufWriter::new(sealed.as_file_mut()))?;
        Ok(sealed)
    }
}

impl BlobStore for AesBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Encrypted(Box::new(self.inner.kind()))
    }

    fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    fn write_blob(&self, context: &BlobContext) -> StoreResult<String> {
        let mut write = self.key_strategy.write_context(context)?;
        let mut sealed = tempfile::NamedTempFile::new()?;
        {
            let mut encrypting = self
                .cipher
                .encrypting_writer(BufWriter::new(sealed.as_file_mut()))?;
            write.transfer(&mut encrypting)?;
            encrypting.finish()?;
        }
        let key = write
            .key()
            .ok_or_else(|| StoreError::Config("key strategy produced no key".into()))?
            .to_string();
        self.inner.write_file(&key, sealed.path())?;
        self.tracer.record(&self.name, "encrypt", &key);
        Ok(key)
    }

    fn write_file(&self, key: &str, file: &Path) -> StoreResult<()> {
        if self.key_strategy.use_dedup() && self.inner.exists(key)? {
            return Ok(());
        }
        let sealed = self.encrypt_file(key, file)?;
        self.inner.write_file(key, sealed.path())?;
        self.tracer.record(&self.name, "encrypt", key);
        Ok(())
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        let sealed = tempfile::NamedTempFile::new()?;
        if !self.inner.read_blob(key, sealed.path())? {
            return Ok(false);
        }
        let input = BufReader::new(File::open(sealed.path()).with_key(key)?);
        let output = BufWriter::new(File::create(dest).with_key(key)?);
        match self.cipher.decrypt_stream(input, output) {
            Ok(_) => {
                self.tracer.record(&self.name, "decrypt", key);
                Ok(true)
            }
            Err(e) => {
                // Never leave partially decrypted bytes behind.
                let _ = std::fs::remove_file(dest);
                match e {
                    CryptoError::Decryption(reason) => {
                        warn!(store = %self.name, key, %reason, "encrypted blob failed authentication");
                        Err(StoreError::Corrupt {
                            key: key.to_string(),
                            reason,
                        })
                    }
                    CryptoError::Io(e) => Err(StoreError::io(key, e)),
                    other => Err(other.into()),
                }
            }
        }
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key)
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
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
        self.inner.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBlobStore;
    use crate::path::PathStrategy;
    use strata_crypto::DigestAlgorithm;
    use strata_types::BlobSource;

    const FOO_MD5: &str = "acbd18db4cc2f85cedef654fccc4a4d8";

    fn stack(dir: &Path) -> (Arc<LocalBlobStore>, AesBlobStore) {
        let local = Arc::new(
            LocalBlobStore::open(
                "disk",
                dir,
                PathStrategy::Flat,
                KeyStrategy::Digest(DigestAlgorithm::Md5),
            )
            .unwrap(),
        );
        let aes = AesBlobStore::new(
            "aes",
            local.clone(),
            BlobCipher::from_password("correct horse", 1_000).unwrap(),
        );
        (local, aes)
    }

    fn foo() -> BlobContext {
        BlobContext::new(BlobSource::from_bytes(&b"foo"[..]))
    }

    #[test]
    fn key_is_plaintext_digest_and_bytes_are_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let (local, aes) = stack(dir.path());

        let key = aes.write_blob(&foo()).unwrap();
        assert_eq!(key, FOO_MD5);

        let raw = local.read_bytes(&key).unwrap().unwrap();
        assert_ne!(raw, b"foo");
        assert!(raw.len() > 3);

        assert_eq!(aes.read_bytes(&key).unwrap().unwrap(), b"foo");
    }

    #[test]
    fn dedup_survives_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let (local, aes) = stack(dir.path());
        aes.write_blob(&foo()).unwrap();
        aes.write_blob(&foo()).unwrap();
        assert_eq!(local.list_keys().unwrap(), vec![FOO_MD5.to_string()]);
    }

    #[test]
    fn never_exposes_a_plaintext_file() {
        let dir = tempfile::tempdir().unwrap();
        let (local, aes) = stack(dir.path());
        let key = aes.write_blob(&foo()).unwrap();
        assert!(aes.get_file(&key).unwrap().is_none());
        assert!(!aes.copy_blob_is_optimized(local.as_ref()));
        assert!(aes.kind().is_encrypted());
    }

    #[test]
    fn corrupted_ciphertext_is_an_error_not_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let (local, aes) = stack(dir.path());
        let key = aes.write_blob(&foo()).unwrap();

        let path = local.path_for(&key).unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let out = dir.path().join("out");
        let err = aes.read_blob(&key, &out).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn copy_from_plain_store_encrypts() {
        let plain_dir = tempfile::tempdir().unwrap();
        let plain = LocalBlobStore::open(
            "plain",
            plain_dir.path(),
            PathStrategy::Flat,
            KeyStrategy::Digest(DigestAlgorithm::Md5),
        )
        .unwrap();
        let key = plain.write_blob(&foo()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (local, aes) = stack(dir.path());
        assert!(aes.copy_blob(&key, &plain, &key, false).unwrap());
        assert_ne!(local.read_bytes(&key).unwrap().unwrap(), b"foo");
        assert_eq!(aes.read_bytes(&key).unwrap().unwrap(), b"foo");
    }
}
