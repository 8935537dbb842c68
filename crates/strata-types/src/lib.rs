//! Core types for Strata, a pluggable content-addressed blob storage layer.
//!
//! Everything that crosses a crate boundary lives here:
//!
//! - [`BlobSource`] / [`BlobContext`] -- what is being written and for whom
//! - [`BlobInfo`] -- the durable reference handed back to callers
//! - [`StorageClass`], [`BlobStatus`], [`BlobUpdate`] -- tiering state and
//!   the updates that move a blob between tiers
//! - [`Clock`] -- injectable time source for eviction, grace windows and
//!   restore expiry

pub mod clock;
pub mod context;
pub mod error;
pub mod info;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{BlobContext, BlobSource, MAIN_XPATH};
pub use error::TypeError;
pub use info::BlobInfo;
pub use status::{BlobStatus, BlobUpdate, StorageClass};

/// Validate a storage key.
///
/// Keys are opaque strings chosen by a key strategy. The only structural
/// rules are that they are non-empty and free of control characters.
pub fn validate_key(key: &str) -> Result<(), TypeError> {
    if key.is_empty() {
        return Err(TypeError::InvalidKey("empty key".into()));
    }
    if key.chars().any(char::is_control) {
        return Err(TypeError::InvalidKey(format!(
            "key contains control characters: {key:?}"
        )));
    }
    Ok(())
}
