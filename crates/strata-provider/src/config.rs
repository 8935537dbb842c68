use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_cache::CacheConfig;
use strata_crypto::{CryptoResult, DigestAlgorithm, KeySource, KeyStrategy};
use strata_remote::{RemoteConfig, DEFAULT_DEFERRED_DELETE_GRACE, DEFAULT_PSEUDO_KEY_GRACE};
use strata_store::PathStrategy;

use crate::error::{ProviderError, ProviderResult};

/// What a read of a missing blob returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingBlobPolicy {
    /// Log and return empty content.
    #[default]
    Empty,
    /// Fail with [`ProviderError::NotFound`].
    Error,
}

/// Top-level configuration: every provider plus manager-wide policies.
///
/// ```toml
/// default_provider = "default"
///
/// [providers.default]
/// backend = { type = "local", root = "/var/lib/strata/default" }
///
/// [providers.media]
/// backend = { type = "remote", endpoint = "memory", bucket = "media" }
/// key_strategy = { type = "digest", algorithm = "SHA-256" }
/// cache = { dir = "/var/cache/strata/media", max_bytes = 1073741824 }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Provider used for keys that carry no provider prefix.
    pub default_provider: Option<String>,
    pub missing_blob_policy: MissingBlobPolicy,
    /// Treat read timeouts like missing blobs instead of failing.
    pub degraded_reads: bool,
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl ManagerConfig {
    pub fn from_toml_str(text: &str) -> ProviderResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ProviderResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check everything that can be checked without touching storage.
    pub fn validate(&self) -> ProviderResult<()> {
        if let Some(default) = &self.default_provider {
            if !self.providers.contains_key(default) {
                return Err(ProviderError::Config(format!(
                    "default provider '{default}' is not configured"
                )));
            }
        }
        for (name, provider) in &self.providers {
            if name.is_empty() || name.contains(':') {
                return Err(ProviderError::Config(format!(
                    "provider name '{name}' must be non-empty and must not contain ':'"
                )));
            }
            provider.validate(name)?;
        }
        Ok(())
    }
}

/// One provider's store stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub key_strategy: KeyStrategyConfig,
    #[serde(default)]
    pub cache: Option<CacheSettings>,
    #[serde(default)]
    pub transactional: bool,
    /// Append-only document-id store. Implies a transactional wrapper.
    #[serde(default)]
    pub record: bool,
    #[serde(default)]
    pub encryption: Option<KeySource>,
    /// Staging area for transactions. Required for transactional and
    /// record providers.
    #[serde(default)]
    pub transient_dir: Option<PathBuf>,
}

impl ProviderConfig {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::with_backend(BackendConfig::Local {
            root: root.into(),
            shard_depth: 0,
        })
    }

    pub fn remote(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self::with_backend(BackendConfig::Remote {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            prefix: String::new(),
            verify_digests: true,
            deferred_delete_grace_secs: DEFAULT_DEFERRED_DELETE_GRACE.as_secs(),
            pseudo_key_grace_secs: DEFAULT_PSEUDO_KEY_GRACE.as_secs(),
        })
    }

    fn with_backend(backend: BackendConfig) -> Self {
        Self {
            backend,
            key_strategy: KeyStrategyConfig::default(),
            cache: None,
            transactional: false,
            record: false,
            encryption: None,
            transient_dir: None,
        }
    }

    /// Whether the stack gets a transactional layer.
    pub fn needs_transactions(&self) -> bool {
        self.transactional || self.record
    }

    fn validate(&self, name: &str) -> ProviderResult<()> {
        let strategy = self.key_strategy.build()?;
        if self.record && strategy.use_dedup() {
            return Err(ProviderError::Config(format!(
                "record provider '{name}' must use the doc_id key strategy"
            )));
        }
        if self.needs_transactions() && self.transient_dir.is_none() {
            return Err(ProviderError::Config(format!(
                "transactional provider '{name}' needs a transient_dir"
            )));
        }
        if let BackendConfig::Remote { bucket, .. } = &self.backend {
            if bucket.is_empty() {
                return Err(ProviderError::Config(format!(
                    "remote provider '{name}' has no bucket"
                )));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_deferred_delete_grace_secs() -> u64 {
    DEFAULT_DEFERRED_DELETE_GRACE.as_secs()
}

fn default_pseudo_key_grace_secs() -> u64 {
    DEFAULT_PSEUDO_KEY_GRACE.as_secs()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Local {
        root: PathBuf,
        /// Levels of two-character shard directories; 0 keeps a flat layout.
        #[serde(default)]
        shard_depth: usize,
    },
    Remote {
        /// Endpoint of an object-service client registered with the manager.
        endpoint: String,
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_true")]
        verify_digests: bool,
        #[serde(default = "default_deferred_delete_grace_secs")]
        deferred_delete_grace_secs: u64,
        #[serde(default = "default_pseudo_key_grace_secs")]
        pseudo_key_grace_secs: u64,
    },
}

impl BackendConfig {
    pub fn path_strategy(shard_depth: usize) -> PathStrategy {
        if shard_depth == 0 {
            PathStrategy::Flat
        } else {
            PathStrategy::Sharded { depth: shard_depth }
        }
    }

    /// Remote store settings; `None` for local backends.
    pub fn remote_config(&self) -> Option<(&str, RemoteConfig)> {
        match self {
            Self::Local { .. } => None,
            Self::Remote {
                endpoint,
                bucket,
                prefix,
                verify_digests,
                deferred_delete_grace_secs,
                pseudo_key_grace_secs,
            } => {
                let mut config = RemoteConfig::new(bucket.clone()).with_prefix(prefix.clone());
                config.verify_digests = *verify_digests;
                config.deferred_delete_grace = Duration::from_secs(*deferred_delete_grace_secs);
                config.pseudo_key_grace = Duration::from_secs(*pseudo_key_grace_secs);
                Some((endpoint.as_str(), config))
            }
        }
    }
}

fn default_algorithm() -> String {
    DigestAlgorithm::Md5.name().to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStrategyConfig {
    Digest {
        #[serde(default = "default_algorithm")]
        algorithm: String,
    },
    DocId,
}

impl Default for KeyStrategyConfig {
    fn default() -> Self {
        Self::Digest {
            algorithm: default_algorithm(),
        }
    }
}

impl KeyStrategyConfig {
    /// Fails for unknown digest algorithms.
    pub fn build(&self) -> CryptoResult<KeyStrategy> {
        match self {
            Self::Digest { algorithm } => KeyStrategy::digest(algorithm),
            Self::DocId => Ok(KeyStrategy::DocId),
        }
    }
}

fn default_max_bytes() -> u64 {
    strata_cache::config::DEFAULT_MAX_BYTES
}

fn default_max_count() -> usize {
    strata_cache::config::DEFAULT_MAX_COUNT
}

fn default_min_age_secs() -> u64 {
    strata_cache::config::DEFAULT_MIN_AGE.as_secs()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub dir: PathBuf,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    #[serde(default = "default_min_age_secs")]
    pub min_age_secs: u64,
    /// Run a background eviction pass this often.
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

impl CacheSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: default_max_bytes(),
            max_count: default_max_count(),
            min_age_secs: default_min_age_secs(),
            sweep_interval_secs: None,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(&self.dir)
            .with_max_bytes(self.max_bytes)
            .with_max_count(self.max_count)
            .with_min_age(Duration::from_secs(self.min_age_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_provider = "default"
missing_blob_policy = "error"

[providers.default]
backend = { type = "local", root = "/data/default", shard_depth = 2 }

[providers.media]
backend = { type = "remote", endpoint = "memory", bucket = "media", prefix = "blobs/" }
key_strategy = { type = "digest", algorithm = "SHA-256" }
cache = { dir = "/cache/media", max_bytes = 1000 }
encryption = { type = "password", password = "secret" }

[providers.records]
backend = { type = "local", root = "/data/records" }
key_strategy = { type = "doc_id" }
record = true
transient_dir = "/data/records-transient"
"#;

    #[test]
    fn parses_full_config() {
        let config = ManagerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("default"));
        assert_eq!(config.missing_blob_policy, MissingBlobPolicy::Error);
        assert!(!config.degraded_reads);

        let default = &config.providers["default"];
        assert_eq!(default.key_strategy, KeyStrategyConfig::default());
        assert_eq!(
            default.backend,
            BackendConfig::Local {
                root: "/data/default".into(),
                shard_depth: 2
            }
        );

        let media = &config.providers["media"];
        let (endpoint, remote) = media.backend.remote_config().unwrap();
        assert_eq!(endpoint, "memory");
        assert_eq!(remote.prefix, "blobs/");
        assert!(remote.verify_digests);
        assert_eq!(remote.deferred_delete_grace, DEFAULT_DEFERRED_DELETE_GRACE);
        let cache = media.cache.as_ref().unwrap().cache_config();
        assert_eq!(cache.max_bytes, 1000);
        assert_eq!(cache.max_count, 10_000);
        assert!(matches!(
            media.encryption,
            Some(KeySource::Password { .. })
        ));

        let records = &config.providers["records"];
        assert!(records.record && records.needs_transactions());
        assert_eq!(records.key_strategy.build().unwrap(), KeyStrategy::DocId);
    }

    #[test]
    fn unknown_digest_is_fatal() {
        let text = r#"
[providers.p]
backend = { type = "local", root = "/x" }
key_strategy = { type = "digest", algorithm = "CRC-32" }
"#;
        assert!(matches!(
            ManagerConfig::from_toml_str(text),
            Err(ProviderError::Crypto(_))
        ));
    }

    #[test]
    fn record_requires_doc_ids_and_transient_dir() {
        let mut config = ManagerConfig::default();
        let mut records = ProviderConfig::local("/x");
        records.record = true;
        records.transient_dir = Some("/t".into());
        config.providers.insert("r".into(), records.clone());
        assert!(matches!(config.validate(), Err(ProviderError::Config(_))));

        records.key_strategy = KeyStrategyConfig::DocId;
        records.transient_dir = None;
        config.providers.insert("r".into(), records.clone());
        assert!(matches!(config.validate(), Err(ProviderError::Config(_))));

        records.transient_dir = Some("/t".into());
        config.providers.insert("r".into(), records);
        config.validate().unwrap();
    }

    #[test]
    fn default_provider_must_exist() {
        let config = ManagerConfig {
            default_provider: Some("nope".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_names_cannot_hold_colons() {
        let mut config = ManagerConfig::default();
        config
            .providers
            .insert("a:b".into(), ProviderConfig::local("/x"));
        assert!(config.validate().is_err());
    }
}
