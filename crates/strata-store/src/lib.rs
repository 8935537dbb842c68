//! Blob storage backends for Strata.
//!
//! A blob store maps opaque keys to immutable byte sequences. Keys are
//! chosen by the store's [`KeyStrategy`](strata_crypto::KeyStrategy): either
//! the content digest (identical content is stored once) or the owning
//! document id.
//!
//! # Backends
//!
//! All backends implement the [`BlobStore`] trait:
//!
//! - [`LocalBlobStore`] -- files under a root directory, laid out by a
//!   [`PathStrategy`]
//! - [`AesBlobStore`] -- transparent encryption over any other store
//!
//! Remote, caching and transactional stores live in their own crates and
//! compose with these through the same trait.
//!
//! # Design Rules
//!
//! 1. Blob bytes are immutable once stored under a key.
//! 2. Writes land in a temp file first and become visible atomically.
//! 3. Deleting a missing key is a no-op.
//! 4. Every mutating operation can be observed through a [`Tracer`].

pub mod aes;
pub mod error;
pub mod kind;
pub mod local;
pub mod path;
pub mod trace;
pub mod traits;

pub use aes::AesBlobStore;
pub use error::{IoResultExt, StoreError, StoreResult};
pub use kind::StoreKind;
pub use local::LocalBlobStore;
pub use path::{PathStrategy, SHARD_PLACEHOLDER, TMP_PREFIX};
pub use trace::{TraceMatcher, TraceMismatch, Tracer};
pub use traits::{copy_blob_generic, BlobStore};
