//! Blob providers and the blob manager.
//!
//! A [`BlobProvider`] is one configured store stack, assembled bottom-up
//! from a [`ProviderConfig`]:
//!
//! ```text
//! transactional (optional, record mode)
//!   └─ encrypting (optional)
//!       └─ caching (optional)
//!           └─ local directory | remote bucket
//! ```
//!
//! The [`BlobManager`] owns every provider of a [`ManagerConfig`], the
//! object-service clients they use and the shared transaction manager, and
//! resolves provider-qualified keys (`"{provider}:{key}"`).

pub mod config;
pub mod error;
pub mod gc;
pub mod manager;
pub mod provider;

pub use config::{
    BackendConfig, CacheSettings, KeyStrategyConfig, ManagerConfig, MissingBlobPolicy,
    ProviderConfig,
};
pub use error::{ProviderError, ProviderResult};
pub use gc::{collect_garbage, GcReport};
pub use manager::{BlobManager, BlobManagerBuilder};
pub use provider::{BlobProvider, ReadPolicy};
