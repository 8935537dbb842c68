use std::io;

use strata_crypto::CryptoError;
use strata_store::StoreError;
use strata_txn::TxnError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown blob provider: {0}")]
    UnknownProvider(String),

    #[error("no object service registered for endpoint {0}")]
    UnknownEndpoint(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("Missing id")]
    MissingId,

    #[error("Cannot store blob at xpath '{xpath}' in record blob provider: {doc_id}")]
    RecordXpath { xpath: String, doc_id: String },

    /// The id would collide with the archived generations of another record.
    #[error("Invalid record id '{0}': ids must not contain '{sep}'", sep = strata_crypto::VERSION_SEPARATOR)]
    RecordId(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProviderError {
    /// Returns `true` for failures a caller may retry: timeouts and lost
    /// commit races.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Txn(e) => e.store_error().map_or(false, StoreError::is_retryable),
            _ => false,
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
