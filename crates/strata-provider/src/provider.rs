use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use strata_cache::{CacheSweeper, CachingBlobStore};
use strata_crypto::{BlobCipher, KeyStrategy, VERSION_SEPARATOR};
use strata_remote::{ObjectClient, RemoteBlobStore, SweepReport};
use strata_store::{AesBlobStore, BlobStore, LocalBlobStore, StoreError, StoreKind, Tracer};
use strata_txn::{TransactionManager, TransactionalBlobStore};
use strata_types::{BlobContext, BlobInfo, BlobStatus, BlobUpdate, Clock, MAIN_XPATH};
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, ManagerConfig, MissingBlobPolicy, ProviderConfig};
use crate::error::{ProviderError, ProviderResult};
use crate::gc::{collect_garbage, GcReport};

/// How reads react to blobs that cannot be served.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadPolicy {
    pub missing: MissingBlobPolicy,
    /// Timeouts behave like missing blobs instead of failing.
    pub degraded_reads: bool,
}

impl ReadPolicy {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            missing: config.missing_blob_policy,
            degraded_reads: config.degraded_reads,
        }
    }
}

/// Everything a provider stack may need from the manager.
pub(crate) struct StackDeps<'a> {
    pub clients: &'a HashMap<String, Arc<dyn ObjectClient>>,
    pub transactions: &'a TransactionManager,
    pub clock: &'a Arc<dyn Clock>,
    pub tracer: &'a Tracer,
    pub policy: ReadPolicy,
}

/// One configured blob store stack.
pub struct BlobProvider {
    name: String,
    store: Arc<dyn BlobStore>,
    remote: Option<Arc<RemoteBlobStore>>,
    cache: Option<Arc<CachingBlobStore>>,
    _sweeper: Option<CacheSweeper>,
    record: bool,
    policy: ReadPolicy,
}

impl BlobProvider {
    /// Assemble the stack described by `config`, bottom-up.
    pub(crate) fn build(
        name: &str,
        config: &ProviderConfig,
        deps: &StackDeps<'_>,
    ) -> ProviderResult<Self> {
        let key_strategy = config.key_strategy.build()?;
        let mut remote = None;
        let mut store: Arc<dyn BlobStore> = match &config.backend {
            BackendConfig::Local { root, shard_depth } => Arc::new(
                LocalBlobStore::open(
                    name,
                    root,
                    BackendConfig::path_strategy(*shard_depth),
                    key_strategy.clone(),
                )?
                .with_tracer(deps.tracer.clone()),
            ),
            backend @ BackendConfig::Remote { .. } => {
                let Some((endpoint, mut remote_config)) = backend.remote_config() else {
                    return Err(ProviderError::Config(format!("provider '{name}' has no remote settings")));
                };
                let client = deps
                    .clients
                    .get(endpoint)
                    .cloned()
                    .ok_or_else(|| ProviderError::UnknownEndpoint(endpoint.to_string()))?;
                // The bucket holds ciphertext keyed by plaintext digests.
                if config.encryption.is_some() {
                    remote_config.verify_digests = false;
                }
                let store = Arc::new(
                    RemoteBlobStore::builder(name, client, remote_config)
                        .key_strategy(key_strategy.clone())
                        .clock(deps.clock.clone())
                        .tracer(deps.tracer.clone())
                        .build()?,
                );
                remote = Some(store.clone());
                store
            }
        };

        let mut cache = None;
        let mut sweeper = None;
        if let Some(settings) = &config.cache {
            let caching = Arc::new(
                CachingBlobStore::open_with_clock(
                    format!("{name}.cache"),
                    store,
                    settings.cache_config(),
                    deps.clock.clone(),
                )?
                .with_tracer(deps.tracer.clone()),
            );
            if let Some(secs) = settings.sweep_interval_secs {
                sweeper = Some(caching.start_sweeper(Duration::from_secs(secs))?);
            }
            cache = Some(caching.clone());
            store = caching;
        }

        if let Some(source) = &config.encryption {
            let cipher = BlobCipher::from_key_source(source)?;
            store = Arc::new(
                AesBlobStore::new(format!("{name}.aes"), store, cipher)
                    .with_tracer(deps.tracer.clone()),
            );
        }

        if config.needs_transactions() {
            let transient_dir = config.transient_dir.as_ref().ok_or_else(|| {
                ProviderError::Config(format!("transactional provider '{name}' needs a transient_dir"))
            })?;
            store = Arc::new(
                TransactionalBlobStore::open(
                    format!("{name}.txn"),
                    store,
                    transient_dir,
                    deps.transactions.clone(),
                )?
                .with_record_mode(config.record)
                .with_tracer(deps.tracer.clone()),
            );
        }

        info!(provider = name, kind = ?store.kind(), key_strategy = %key_strategy, record = config.record, "blob provider ready");
        Ok(Self {
            name: name.to_string(),
            store,
            remote,
            cache,
            _sweeper: sweeper,
            record: config.record,
            policy: deps.policy,
        })
    }

    /// A provider over an already assembled store.
    pub fn from_store(name: impl Into<String>, store: Arc<dyn BlobStore>, policy: ReadPolicy) -> Self {
        Self {
            name: name.into(),
            store,
            remote: None,
            cache: None,
            _sweeper: None,
            record: false,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Top of the stack.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn kind(&self) -> StoreKind {
        self.store.kind()
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        self.store.key_strategy()
    }

    pub fn remote(&self) -> Option<&Arc<RemoteBlobStore>> {
        self.remote.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<CachingBlobStore>> {
        self.cache.as_ref()
    }

    pub fn is_record(&self) -> bool {
        self.record
    }

    pub fn is_transactional(&self) -> bool {
        self.kind().is_transactional()
    }

    pub fn policy(&self) -> ReadPolicy {
        self.policy
    }

    fn check_record_context(&self, context: &BlobContext) -> ProviderResult<()> {
        if !self.record {
            return Ok(());
        }
        let doc_id = context
            .doc_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(ProviderError::MissingId)?;
        if doc_id.contains(VERSION_SEPARATOR) {
            return Err(ProviderError::RecordId(doc_id.to_string()));
        }
        if !context.is_main_content() {
            return Err(ProviderError::RecordXpath {
                xpath: context.xpath.clone().unwrap_or_else(|| MAIN_XPATH.to_string()),
                doc_id: doc_id.to_string(),
            });
        }
        Ok(())
    }

    /// Describe a stored key.
    pub(crate) fn info_for(&self, key: &str, context: Option<&BlobContext>) -> BlobInfo {
        let mut info = BlobInfo::new(format!("{}:{key}", self.name));
        let strategy = self.key_strategy();
        if let (Some(digest), Some(algorithm)) = (strategy.digest_from_key(key), strategy.algorithm()) {
            info.digest = Some(digest.to_string());
            info.digest_algorithm = Some(algorithm.name().to_string());
        }
        if let Some(context) = context {
            info.length = context.source.len().ok();
            info.filename = context.filename.clone();
            info.mime_type = context.mime_type.clone();
        }
        info
    }

    pub fn write_blob(&self, context: &BlobContext) -> ProviderResult<BlobInfo> {
        self.check_record_context(context)?;
        let key = self.store.write_blob(context)?;
        debug!(provider = %self.name, key = %key, "blob written");
        Ok(self.info_for(&key, Some(context)))
    }

    /// Read into `dest`, applying the read policy. Returns `false` when the
    /// policy turned a missing or unreachable blob into empty content, in
    /// which case `dest` is an empty file.
    pub fn read_to_file(&self, key: &str, dest: &Path) -> ProviderResult<bool> {
        let outcome = self.store.read_blob(key, dest);
        match outcome {
            Ok(true) => Ok(true),
            Ok(false) => match self.policy.missing {
                MissingBlobPolicy::Empty => {
                    warn!(provider = %self.name, key, "blob is missing, returning empty content");
                    File::create(dest)?;
                    Ok(false)
                }
                MissingBlobPolicy::Error => Err(ProviderError::NotFound(format!("{}:{key}", self.name))),
            },
            Err(e @ StoreError::Timeout { .. }) if self.policy.degraded_reads => {
                warn!(provider = %self.name, key, error = %e, "blob read timed out, returning empty content");
                File::create(dest)?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the whole blob into memory, applying the read policy.
    pub fn read_bytes(&self, key: &str) -> ProviderResult<Vec<u8>> {
        let tmp = tempfile::NamedTempFile::new()?;
        self.read_to_file(key, tmp.path())?;
        Ok(fs::read(tmp.path())?)
    }

    pub fn exists(&self, key: &str) -> ProviderResult<bool> {
        Ok(self.store.exists(key)?)
    }

    pub fn delete_blob(&self, key: &str) -> ProviderResult<()> {
        self.store.delete_blob(key)?;
        Ok(())
    }

    pub fn update_blob(&self, key: &str, update: &BlobUpdate) -> ProviderResult<()> {
        self.store.update_blob(key, update)?;
        Ok(())
    }

    pub fn status(&self, key: &str) -> ProviderResult<BlobStatus> {
        Ok(self.store.status(key)?)
    }

    pub fn list_keys(&self) -> ProviderResult<Vec<String>> {
        Ok(self.store.list_keys()?)
    }

    /// Delete every stored key not in `marked`.
    pub fn garbage_collect(&self, marked: &HashSet<String>, dry_run: bool) -> ProviderResult<GcReport> {
        let report = collect_garbage(self.store.as_ref(), marked, dry_run)?;
        info!(
            provider = %self.name,
            examined = report.examined,
            deleted = report.deleted,
            ignored = report.ignored,
            dry_run,
            "garbage collection finished"
        );
        Ok(report)
    }

    /// Run deferred deletes and a cache eviction pass.
    pub fn sweep(&self) -> ProviderResult<SweepReport> {
        if let Some(cache) = &self.cache {
            cache.evict();
        }
        match &self.remote {
            Some(remote) => Ok(remote.sweep_deferred()?),
            None => Ok(SweepReport::default()),
        }
    }

    pub fn clear(&self) -> ProviderResult<()> {
        self.store.clear()?;
        Ok(())
    }
}
