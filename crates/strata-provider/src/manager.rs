use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use strata_remote::ObjectClient;
use strata_store::Tracer;
use strata_txn::{Transaction, TransactionManager};
use strata_types::{BlobContext, BlobInfo, BlobSource, BlobStatus, BlobUpdate, Clock, SystemClock};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{BlobProvider, ReadPolicy, StackDeps};

/// Builder for [`BlobManager`].
///
/// Object-service clients are registered by endpoint; a remote provider
/// naming an endpoint nobody registered fails the build.
pub struct BlobManagerBuilder {
    config: ManagerConfig,
    clients: HashMap<String, Arc<dyn ObjectClient>>,
    transactions: TransactionManager,
    clock: Arc<dyn Clock>,
    tracer: Tracer,
}

impl BlobManagerBuilder {
    pub fn object_client(mut self, client: Arc<dyn ObjectClient>) -> Self {
        self.clients.insert(client.endpoint().to_string(), client);
        self
    }

    pub fn transactions(mut self, transactions: TransactionManager) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn build(self) -> ProviderResult<BlobManager> {
        self.config.validate()?;
        let deps = StackDeps {
            clients: &self.clients,
            transactions: &self.transactions,
            clock: &self.clock,
            tracer: &self.tracer,
            policy: ReadPolicy::from_config(&self.config),
        };
        let mut providers = BTreeMap::new();
        for (name, provider_config) in &self.config.providers {
            let provider = BlobProvider::build(name, provider_config, &deps)?;
            providers.insert(name.clone(), Arc::new(provider));
        }
        info!(providers = providers.len(), "blob manager ready");
        Ok(BlobManager {
            config: self.config,
            providers,
            transactions: self.transactions,
            tracer: self.tracer,
        })
    }
}

/// Registry of configured blob providers.
///
/// Keys handed out by the manager are qualified with the provider name
/// (`"{provider}:{key}"`); unqualified keys resolve against the default
/// provider.
pub struct BlobManager {
    config: ManagerConfig,
    providers: BTreeMap<String, Arc<BlobProvider>>,
    transactions: TransactionManager,
    tracer: Tracer,
}

impl BlobManager {
    pub fn builder(config: ManagerConfig) -> BlobManagerBuilder {
        BlobManagerBuilder {
            config,
            clients: HashMap::new(),
            transactions: TransactionManager::new(),
            clock: Arc::new(SystemClock),
            tracer: Tracer::disabled(),
        }
    }

    /// Build every provider of a configuration that uses no remote backends.
    pub fn from_config(config: ManagerConfig) -> ProviderResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn provider(&self, name: &str) -> ProviderResult<&Arc<BlobProvider>> {
        self.providers
            .get(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// The configured default provider, or the only provider when there is
    /// exactly one.
    pub fn default_provider(&self) -> ProviderResult<&Arc<BlobProvider>> {
        if let Some(name) = &self.config.default_provider {
            return self.provider(name);
        }
        let mut all = self.providers.values();
        match (all.next(), all.next()) {
            (Some(only), None) => Ok(only),
            _ => Err(ProviderError::Config("no default provider configured".into())),
        }
    }

    /// Split a qualified key into its provider and store key.
    pub fn resolve<'k>(&self, qualified: &'k str) -> ProviderResult<(&Arc<BlobProvider>, &'k str)> {
        if let Some((prefix, key)) = qualified.split_once(':') {
            if let Some(provider) = self.providers.get(prefix) {
                return Ok((provider, key));
            }
        }
        Ok((self.default_provider()?, qualified))
    }

    /// Start a transaction on the calling thread. Writes through
    /// transactional providers stay private to it until commit.
    pub fn begin(&self) -> ProviderResult<Transaction> {
        Ok(self.transactions.begin()?)
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> ProviderResult<T>) -> ProviderResult<T> {
        let txn = self.begin()?;
        match f(self) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback() {
                    warn!(error = %rollback, "rollback after failed transaction body");
                }
                Err(e)
            }
        }
    }

    pub fn write_blob(&self, provider: &str, context: &BlobContext) -> ProviderResult<BlobInfo> {
        self.provider(provider)?.write_blob(context)
    }

    pub fn read_blob(&self, info: &BlobInfo) -> ProviderResult<Vec<u8>> {
        self.read_bytes(&info.key)
    }

    pub fn read_bytes(&self, qualified: &str) -> ProviderResult<Vec<u8>> {
        let (provider, key) = self.resolve(qualified)?;
        provider.read_bytes(key)
    }

    /// Read into `dest`. Returns `false` when the read policy substituted
    /// empty content.
    pub fn read_to_file(&self, qualified: &str, dest: &Path) -> ProviderResult<bool> {
        let (provider, key) = self.resolve(qualified)?;
        provider.read_to_file(key, dest)
    }

    pub fn exists(&self, qualified: &str) -> ProviderResult<bool> {
        let (provider, key) = self.resolve(qualified)?;
        provider.exists(key)
    }

    pub fn status(&self, qualified: &str) -> ProviderResult<BlobStatus> {
        let (provider, key) = self.resolve(qualified)?;
        provider.status(key)
    }

    pub fn update_blob(&self, qualified: &str, update: &BlobUpdate) -> ProviderResult<()> {
        let (provider, key) = self.resolve(qualified)?;
        provider.update_blob(key, update)
    }

    pub fn delete_blob(&self, qualified: &str) -> ProviderResult<()> {
        let (provider, key) = self.resolve(qualified)?;
        provider.delete_blob(key)
    }

    /// Copy (or move) a blob into another provider.
    ///
    /// Providers sharing a key strategy keep the key and let the stores pick
    /// the cheapest path. A plain remote digest store receives foreign blobs
    /// under a pseudo key that is replaced by the real digest in the
    /// background. Anything else is re-written, which yields a new key.
    pub fn copy_blob(
        &self,
        qualified_source: &str,
        dest_provider: &str,
        atomic_move: bool,
    ) -> ProviderResult<BlobInfo> {
        let (source, key) = self.resolve(qualified_source)?;
        let dest = self.provider(dest_provider)?;
        if Arc::ptr_eq(source, dest) {
            return Ok(dest.info_for(key, None));
        }
        let not_found = || ProviderError::NotFound(format!("{}:{key}", source.name()));

        let dest_strategy = dest.key_strategy();
        if dest_strategy == source.key_strategy() || !dest_strategy.use_dedup() {
            if !dest.store().copy_blob(key, source.store().as_ref(), key, atomic_move)? {
                return Err(not_found());
            }
            debug!(source = source.name(), dest = dest.name(), key, atomic_move, "blob copied");
            return Ok(dest.info_for(key, None));
        }

        let kind = dest.kind();
        if let Some(remote) = dest.remote().filter(|_| !kind.is_encrypted() && !kind.is_transactional()) {
            let pseudo = remote.import_foreign(source.store().as_ref(), key)?;
            if atomic_move {
                source.delete_blob(key)?;
            }
            debug!(source = source.name(), dest = dest.name(), key, %pseudo, "blob imported under pseudo key");
            return Ok(dest.info_for(&pseudo, None));
        }

        let tmp = tempfile::NamedTempFile::new()?;
        if !source.store().read_blob(key, tmp.path())? {
            return Err(not_found());
        }
        let info = dest.write_blob(&BlobContext::new(BlobSource::from_file(tmp.path())))?;
        if atomic_move {
            source.delete_blob(key)?;
        }
        debug!(source = source.name(), dest = dest.name(), key, new_key = %info.key, "blob rewritten");
        Ok(info)
    }

    pub fn move_blob(&self, qualified_source: &str, dest_provider: &str) -> ProviderResult<BlobInfo> {
        self.copy_blob(qualified_source, dest_provider, true)
    }

    /// Remove every blob from every provider.
    pub fn clear_all(&self) -> ProviderResult<()> {
        for provider in self.providers.values() {
            provider.clear()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeyStrategyConfig, ProviderConfig};
    use strata_remote::InMemoryObjectClient;

    fn two_local(dir: &Path) -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config
            .providers
            .insert("default".into(), ProviderConfig::local(dir.join("default")));
        let mut docs = ProviderConfig::local(dir.join("docs"));
        docs.key_strategy = KeyStrategyConfig::DocId;
        config.providers.insert("docs".into(), docs);
        config.default_provider = Some("default".into());
        config
    }

    #[test]
    fn qualified_keys_resolve_to_their_provider() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlobManager::from_config(two_local(dir.path())).unwrap();

        let (provider, key) = manager.resolve("docs:a:b").unwrap();
        assert_eq!((provider.name(), key), ("docs", "a:b"));
        let (provider, key) = manager.resolve("plain").unwrap();
        assert_eq!((provider.name(), key), ("default", "plain"));
        let (provider, key) = manager.resolve("nope:k").unwrap();
        assert_eq!((provider.name(), key), ("default", "nope:k"));
        assert!(matches!(manager.provider("nope"), Err(ProviderError::UnknownProvider(_))));
    }

    #[test]
    fn unknown_endpoint_fails_the_build() {
        let mut config = ManagerConfig::default();
        config
            .providers
            .insert("s3".into(), ProviderConfig::remote("nowhere", "bucket"));
        assert!(matches!(
            BlobManager::from_config(config),
            Err(ProviderError::UnknownEndpoint(e)) if e == "nowhere"
        ));
    }

    #[test]
    fn missing_bucket_fails_the_build() {
        let mut config = ManagerConfig::default();
        config
            .providers
            .insert("s3".into(), ProviderConfig::remote("memory", "absent"));
        let client = Arc::new(InMemoryObjectClient::new("memory"));
        let result = BlobManager::builder(config).object_client(client).build();
        assert!(matches!(
            result,
            Err(ProviderError::Store(strata_store::StoreError::BucketNotFound(_)))
        ));
    }

    #[test]
    fn single_provider_is_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ManagerConfig::default();
        config
            .providers
            .insert("only".into(), ProviderConfig::local(dir.path()));
        let manager = BlobManager::from_config(config).unwrap();
        assert_eq!(manager.default_provider().unwrap().name(), "only");
    }

    #[test]
    fn copy_into_document_provider_keeps_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlobManager::from_config(two_local(dir.path())).unwrap();
        let info = manager
            .write_blob("default", &BlobContext::new(BlobSource::from_bytes(&b"foo"[..])))
            .unwrap();

        let copied = manager.copy_blob(&info.key, "docs", false).unwrap();
        assert_eq!(copied.key, "docs:acbd18db4cc2f85cedef654fccc4a4d8");
        assert_eq!(manager.read_bytes(&copied.key).unwrap(), b"foo");
        assert!(manager.exists(&info.key).unwrap());
    }

    #[test]
    fn move_into_digest_provider_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlobManager::from_config(two_local(dir.path())).unwrap();
        let ctx = BlobContext::new(BlobSource::from_bytes(&b"foo"[..])).with_doc("doc-1", "content");
        let info = manager.write_blob("docs", &ctx).unwrap();
        assert_eq!(info.key, "docs:doc-1");

        let moved = manager.move_blob(&info.key, "default").unwrap();
        assert_eq!(moved.key, "default:acbd18db4cc2f85cedef654fccc4a4d8");
        assert!(!manager.exists(&info.key).unwrap());
    }

    #[test]
    fn copy_of_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlobManager::from_config(two_local(dir.path())).unwrap();
        assert!(matches!(
            manager.copy_blob("docs:ghost", "default", false),
            Err(ProviderError::NotFound(k)) if k == "docs:ghost"
        ));
    }
}
