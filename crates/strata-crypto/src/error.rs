use std::io;

use thiserror::Error;

/// Errors from digest, key strategy and cipher operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("missing document id for document-keyed blob")]
    MissingDocId,

    #[error("keystore error: {0}")]
    Keystore(String),

    #[error("key alias not found in keystore: {0}")]
    KeyNotFound(String),

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encryption,

    /// Authentication tag mismatch, truncation, or wrong key.
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias for crypto results.
pub type CryptoResult<T> = Result<T, CryptoError>;
