use std::fmt;
use std::io::{self, Write};

use strata_types::BlobContext;

use crate::digest::{DigestAlgorithm, DigestHasher};
use crate::error::{CryptoError, CryptoResult};

/// Separates a key from a version or generation suffix (`{key}@{version}`).
pub const VERSION_SEPARATOR: char = '@';

const TRANSFER_BUFFER: usize = 64 * 1024;

/// How a store derives the key of a blob it is asked to write.
///
/// Two strategies are equal iff they would produce the same key for the
/// same blob: digest strategies with the same algorithm, or any two
/// document-id strategies.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyStrategy {
    /// Key is the hex content digest. Identical content shares one key.
    Digest(DigestAlgorithm),
    /// Key is derived from the owning document id.
    DocId,
}

impl KeyStrategy {
    /// Digest strategy from an algorithm name; unknown names are rejected.
    pub fn digest(algorithm: &str) -> CryptoResult<Self> {
        Ok(Self::Digest(algorithm.parse()?))
    }

    pub fn algorithm(&self) -> Option<DigestAlgorithm> {
        match self {
            Self::Digest(algorithm) => Some(*algorithm),
            Self::DocId => None,
        }
    }

    /// Returns `true` if identical content maps to a single stored copy.
    pub fn use_dedup(&self) -> bool {
        matches!(self, Self::Digest(_))
    }

    /// Returns `true` if `key` is a well-formed digest for this strategy.
    pub fn is_valid_digest(&self, key: &str) -> bool {
        match self {
            Self::Digest(algorithm) => algorithm.is_valid_digest(key),
            Self::DocId => false,
        }
    }

    /// The digest a key encodes, ignoring any `@version` suffix.
    pub fn digest_from_key<'k>(&self, key: &'k str) -> Option<&'k str> {
        let base = key
            .split_once(VERSION_SEPARATOR)
            .map_or(key, |(base, _)| base);
        self.is_valid_digest(base).then_some(base)
    }

    /// Key for a document-owned blob: the document id for the main content,
    /// `{doc_id}-{xpath}` for any other property.
    fn doc_key(context: &BlobContext) -> CryptoResult<String> {
        let doc_id = context
            .doc_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(CryptoError::MissingDocId)?;
        if context.is_main_content() {
            Ok(doc_id.to_string())
        } else {
            Ok(format!("{doc_id}-{}", context.xpath.as_deref().unwrap_or_default()))
        }
    }

    /// Prepare a write of `context`.
    ///
    /// For document keys the key is known immediately. For digest keys it
    /// becomes known once the content has been streamed through
    /// [`BlobWriteContext::transfer`].
    pub fn write_context<'a>(&self, context: &'a BlobContext) -> CryptoResult<BlobWriteContext<'a>> {
        match self {
            Self::DocId => Ok(BlobWriteContext {
                context,
                key: Some(Self::doc_key(context)?),
                observer: None,
                length: None,
            }),
            Self::Digest(algorithm) => Ok(BlobWriteContext {
                context,
                key: None,
                observer: Some(Box::new(DigestObserver::new(*algorithm))),
                length: None,
            }),
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digest(algorithm) => write!(f, "digest({algorithm})"),
            Self::DocId => f.write_str("docid"),
        }
    }
}

/// Watches the bytes of a blob as they are written.
pub trait WriteObserver: Send {
    fn observe(&mut self, chunk: &[u8]);

    /// Key determined by everything observed, if this observer yields one.
    fn finish(self: Box<Self>) -> Option<String>;
}

/// Computes the content digest while the blob streams past.
#[derive(Debug)]
pub struct DigestObserver {
    hasher: DigestHasher,
}

impl DigestObserver {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            hasher: algorithm.hasher(),
        }
    }
}

impl WriteObserver for DigestObserver {
    fn observe(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    fn finish(self: Box<Self>) -> Option<String> {
        Some(self.hasher.finalize_hex())
    }
}

/// One in-flight blob write: the source context, the key (once known) and
/// the observer that will produce it.
pub struct BlobWriteContext<'a> {
    context: &'a BlobContext,
    key: Option<String>,
    observer: Option<Box<dyn WriteObserver>>,
    length: Option<u64>,
}

impl<'a> BlobWriteContext<'a> {
    pub fn context(&self) -> &'a BlobContext {
        self.context
    }

    /// The storage key, or `None` while it still depends on unseen content.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Bytes transferred so far.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Stream the source into `dest`, feeding the observer on the way.
    ///
    /// After this returns, [`key`](Self::key) is always `Some`.
    pub fn transfer<W: Write + ?Sized>(&mut self, dest: &mut W) -> io::Result<u64> {
        let mut reader = self.context.source.open()?;
        let mut buf = vec![0u8; TRANSFER_BUFFER];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if let Some(observer) = self.observer.as_mut() {
                observer.observe(&buf[..n]);
            }
            dest.write_all(&buf[..n])?;
            total += n as u64;
        }
        if let Some(observer) = self.observer.take() {
            if let Some(key) = observer.finish() {
                self.key = Some(key);
            }
        }
        self.length = Some(total);
        Ok(total)
    }
}

impl fmt::Debug for BlobWriteContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriteContext")
            .field("context", &self.context)
            .field("key", &self.key)
            .field("length", &self.length)
            .finish()
    }
}
