//! Cryptographic building blocks for Strata.
//!
//! - [`DigestAlgorithm`] -- MD5 / SHA-256 / SHA-512 content digests
//! - [`KeyStrategy`] -- how a blob's storage key is derived (content digest
//!   or owning document id), including streaming digest observation
//! - [`BlobCipher`] -- chunked AES-256-GCM encryption of blob streams with
//!   keys from a keystore or derived from a password
//!
//! All crypto operations wrap established libraries -- no custom cryptography.

pub mod cipher;
pub mod digest;
pub mod error;
pub mod keystore;
pub mod strategy;

pub use cipher::{BlobCipher, EncryptingWriter};
pub use digest::{DigestAlgorithm, DigestHasher};
pub use error::{CryptoError, CryptoResult};
pub use keystore::{KeySource, Keystore};
pub use strategy::{BlobWriteContext, DigestObserver, KeyStrategy, WriteObserver, VERSION_SEPARATOR};
