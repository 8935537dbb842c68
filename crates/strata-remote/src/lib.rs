//! Remote object-service storage for Strata.
//!
//! [`RemoteBlobStore`] keeps blobs in a bucket of an S3-style object
//! service, reached through the [`ObjectClient`] trait. Beyond plain
//! put/get it handles:
//!
//! - deduplicated uploads and digest verification on download
//! - server-side copies between buckets of the same endpoint
//! - storage class changes, restores and legal holds
//! - deferred deletion of held or versioned objects
//! - importing blobs keyed with a different digest algorithm under a
//!   temporary pseudo key, rekeyed in the background
//!
//! [`InMemoryObjectClient`] is a complete in-process object service with
//! fault injection, used by tests and the CLI's `memory` endpoint.

pub mod client;
pub mod error;
pub mod memory;
pub mod pseudo;
pub mod store;

pub use client::{ObjectClient, ObjectMeta, PutOptions, RestoreState};
pub use error::{ClientError, ClientResult};
pub use memory::{Fault, InMemoryObjectClient, Operation};
pub use pseudo::{PseudoKeyState, PSEUDO_KEY_SEPARATOR};
pub use store::{
    RemoteBlobStore, RemoteConfig, RemoteStoreBuilder, SweepReport, DEFAULT_DEFERRED_DELETE_GRACE,
    DEFAULT_PSEUDO_KEY_GRACE,
};
