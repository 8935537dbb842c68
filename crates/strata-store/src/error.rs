use std::io;

use strata_crypto::CryptoError;
use strata_types::TypeError;

/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O failure while handling a specific key.
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure not tied to a single key (scans, temp files, setup).
    #[error("I/O error: {0}")]
    Fs(#[from] io::Error),

    /// The requested blob does not exist.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Stored bytes do not match their key or fail authentication.
    #[error("corrupt blob {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The blob is in an archival tier and has not been restored.
    #[error("blob {key} is archived and not downloadable")]
    Archived { key: String },

    /// Another transaction committed a conflicting change first.
    #[error("concurrent update of {key}")]
    ConcurrentUpdate { key: String },

    /// A backend call did not complete in time.
    #[error("timed out on {key}")]
    Timeout { key: String },

    /// The remote service rejected or failed a request.
    #[error("remote error on {key}: {message}")]
    Remote { key: String, message: String },

    /// The configured bucket does not exist. Buckets are never created
    /// implicitly.
    #[error("bucket '{0}' does not exist")]
    BucketNotFound(String),

    #[error("store {store} does not support {operation}")]
    Unsupported {
        store: String,
        operation: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl StoreError {
    pub fn io(key: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }

    /// Returns `true` for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConcurrentUpdate { .. })
    }

    /// The key the error is about, when there is one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Io { key, .. }
            | Self::Corrupt { key, .. }
            | Self::Archived { key }
            | Self::ConcurrentUpdate { key }
            | Self::Timeout { key }
            | Self::Remote { key, .. } => Some(key),
            Self::NotFound(key) => Some(key),
            _ => None,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Attach the key being worked on to a raw I/O error.
pub trait IoResultExt<T> {
    fn with_key(self, key: &str) -> StoreResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_key(self, key: &str) -> StoreResult<T> {
        self.map_err(|source| StoreError::io(key, source))
    }
}
