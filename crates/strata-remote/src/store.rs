use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use strata_crypto::{DigestAlgorithm, KeyStrategy};
use strata_store::{
    copy_blob_generic, BlobStore, IoResultExt, StoreError, StoreKind, StoreResult, Tracer,
};
use strata_types::{BlobContext, BlobStatus, BlobUpdate, Clock, SystemClock};
use tracing::{debug, info, warn};

use crate::client::{ObjectClient, ObjectMeta, PutOptions};
use crate::error::ClientError;
use crate::pseudo::{pseudo_key, PseudoKeyState, RekeyJob};

/// Default wait before a deferred delete is attempted.
pub const DEFAULT_DEFERRED_DELETE_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time a pseudo-keyed object survives after its real key exists.
pub const DEFAULT_PSEUDO_KEY_GRACE: Duration = Duration::from_secs(60 * 60);

/// Where and how a remote store keeps its objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    pub bucket: String,
    /// Prepended to every key to form the object name.
    pub prefix: String,
    /// Re-hash downloads whose key is a digest.
    pub verify_digests: bool,
    pub deferred_delete_grace: Duration,
    pub pseudo_key_grace: Duration,
}

impl RemoteConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            verify_digests: true,
            deferred_delete_grace: DEFAULT_DEFERRED_DELETE_GRACE,
            pseudo_key_grace: DEFAULT_PSEUDO_KEY_GRACE,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Outcome of [`RemoteBlobStore::sweep_deferred`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Deferred deletes carried out.
    pub deleted: usize,
    /// Deferred deletes still waiting (not yet due, or still held).
    pub pending: usize,
    /// Pseudo-keyed objects removed.
    pub retired_pseudo_keys: usize,
    /// Retired pseudo keys whose alias expired.
    pub forgotten_pseudo_keys: usize,
}

/// A logically deleted key whose object is still stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Deferred {
    /// The object may be removed at or after this time.
    Due(SystemTime),
    /// A sweep is removing the object right now.
    Sweeping { due: SystemTime },
}

struct RemoteInner {
    name: String,
    client: Arc<dyn ObjectClient>,
    config: RemoteConfig,
    key_strategy: KeyStrategy,
    versioning: bool,
    clock: Arc<dyn Clock>,
    tracer: Tracer,
    /// Logically deleted keys and when their object may be removed.
    deferred: Mutex<BTreeMap<String, Deferred>>,
    /// Signalled whenever a sweep finishes with a key.
    swept: Condvar,
    pseudo: Mutex<HashMap<String, PseudoKeyState>>,
    pseudo_changed: Condvar,
    epoch: AtomicU64,
}

/// Builder for [`RemoteBlobStore`].
pub struct RemoteStoreBuilder {
    name: String,
    client: Arc<dyn ObjectClient>,
    config: RemoteConfig,
    key_strategy: KeyStrategy,
    clock: Arc<dyn Clock>,
    tracer: Tracer,
}

impl RemoteStoreBuilder {
    pub fn key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
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

    /// Connect to the bucket. Fails with [`StoreError::BucketNotFound`] if it
    /// does not exist.
    pub fn build(self) -> StoreResult<RemoteBlobStore> {
        let bucket = self.config.bucket.clone();
        let exists = self
            .client
            .bucket_exists(&bucket)
            .map_err(|e| map_client_error(&bucket, e))?;
        if !exists {
            return Err(StoreError::BucketNotFound(bucket));
        }
        let versioning = self
            .client
            .versioning_enabled(&bucket)
            .map_err(|e| map_client_error(&bucket, e))?;

        let inner = Arc::new(RemoteInner {
            name: self.name,
            client: self.client,
            config: self.config,
            key_strategy: self.key_strategy,
            versioning,
            clock: self.clock,
            tracer: self.tracer,
            deferred: Mutex::new(BTreeMap::new()),
            swept: Condvar::new(),
            pseudo: Mutex::new(HashMap::new()),
            pseudo_changed: Condvar::new(),
            epoch: AtomicU64::new(0),
        });

        let (jobs, rx) = crossbeam_channel::unbounded();
        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name(format!("strata-rekey-{}", inner.name))
            .spawn(move || rekey_worker(weak, rx))?;

        info!(
            store = %inner.name,
            endpoint = inner.client.endpoint(),
            bucket = %inner.config.bucket,
            prefix = %inner.config.prefix,
            versioning,
            "remote blob store ready"
        );
        Ok(RemoteBlobStore { inner, jobs })
    }
}

/// Blob store over a bucket of an object service.
///
/// Dropping the store stops its background rekey worker after the job in
/// progress, if any.
pub struct RemoteBlobStore {
    inner: Arc<RemoteInner>,
    jobs: Sender<RekeyJob>,
}

fn map_client_error(key: &str, err: ClientError) -> StoreError {
    match err {
        ClientError::Timeout => StoreError::Timeout {
            key: key.to_string(),
        },
        ClientError::InvalidObjectState => StoreError::Archived {
            key: key.to_string(),
        },
        ClientError::NoSuchBucket(bucket) => StoreError::BucketNotFound(bucket),
        ClientError::Io(e) => StoreError::io(key, e),
        ClientError::ObjectLocked => StoreError::Remote {
            key: key.to_string(),
            message: "object is under legal hold or retention".into(),
        },
        ClientError::Service(message) => StoreError::Remote {
            key: key.to_string(),
            message,
        },
    }
}

fn rekey_worker(inner: Weak<RemoteInner>, jobs: Receiver<RekeyJob>) {
    for job in jobs.iter() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.rekey(&job) {
            warn!(store = %inner.name, pseudo_key = %job.pseudo_key, error = %e, "rekey failed, keeping pseudo key");
        }
    }
}

/// Bucket and prefix of a store whose bytes live unmodified in an object
/// service. Caching layers keep bytes as-is; encryption does not.
fn remote_location(kind: &StoreKind) -> Option<(&str, &str, &str)> {
    match kind {
        StoreKind::Remote {
            endpoint,
            bucket,
            prefix,
        } => Some((endpoint, bucket, prefix)),
        StoreKind::Caching(inner) => remote_location(inner),
        _ => None,
    }
}

impl RemoteInner {
    fn object_name(&self, key: &str) -> String {
        format!("{}{key}", self.config.prefix)
    }

    fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        self.client
            .head_object(&self.config.bucket, &self.object_name(key))
            .map_err(|e| map_client_error(key, e))
    }

    fn is_pending_delete(&self, key: &str) -> bool {
        self.deferred.lock().contains_key(key)
    }

    /// Drop any deferred delete of `key`. Must run before the write it
    /// precedes so a concurrent sweep cannot remove the new content; waits
    /// out a sweep that is already deleting the key.
    fn cancel_deferred(&self, key: &str) {
        let mut deferred = self.deferred.lock();
        while matches!(deferred.get(key), Some(Deferred::Sweeping { .. })) {
            self.swept.wait(&mut deferred);
        }
        if deferred.remove(key).is_some() {
            debug!(store = %self.name, key, "deferred delete cancelled by write");
            self.tracer.record(&self.name, "cancel-delete", key);
        }
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        if self.is_pending_delete(key) {
            return Ok(false);
        }
        Ok(self.head(key)?.is_some())
    }

    fn put(&self, key: &str, file: &Path, options: &PutOptions) -> StoreResult<()> {
        self.cancel_deferred(key);
        if self.key_strategy.use_dedup() && self.head(key)?.is_some() {
            self.tracer.record(&self.name, "exists", key);
            return Ok(());
        }
        let meta = self
            .client
            .put_object(&self.config.bucket, &self.object_name(key), file, options)
            .map_err(|e| map_client_error(key, e))?;
        debug!(store = %self.name, key, length = meta.length, "uploaded blob");
        self.tracer.record(&self.name, "put", key);
        Ok(())
    }

    fn real_key_for(&self, key: &str) -> Option<String> {
        self.pseudo
            .lock()
            .get(key)
            .and_then(|s| s.real_key().map(str::to_string))
    }

    fn verify_digest(&self, key: &str, file: &Path) -> StoreResult<()> {
        let (Some(expected), Some(algorithm)) =
            (self.key_strategy.digest_from_key(key), self.key_strategy.algorithm())
        else {
            return Ok(());
        };
        let actual = digest_file(algorithm, file, key)?;
        if actual != expected {
            warn!(store = %self.name, key, %actual, "downloaded blob does not match its digest");
            return Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("content digest is {actual}"),
            });
        }
        Ok(())
    }

    fn read(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        if self.is_pending_delete(key) {
            self.tracer.record(&self.name, "get-missing", key);
            return Ok(false);
        }
        let found = self
            .client
            .get_object(&self.config.bucket, &self.object_name(key), dest)
            .map_err(|e| map_client_error(key, e))?;
        if found.is_none() {
            if let Some(real) = self.real_key_for(key) {
                debug!(store = %self.name, key, %real, "pseudo key resolved to real key");
                return self.read(&real, dest);
            }
            self.tracer.record(&self.name, "get-missing", key);
            return Ok(false);
        }
        if self.config.verify_digests {
            if let Err(e) = self.verify_digest(key, dest) {
                let _ = std::fs::remove_file(dest);
                return Err(e);
            }
        }
        self.tracer.record(&self.name, "get", key);
        Ok(true)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let Some(meta) = self.head(key)? else {
            self.tracer.record(&self.name, "delete-missing", key);
            return Ok(());
        };
        if meta.is_locked_at(self.clock.now()) || self.versioning {
            self.defer_delete(key);
            return Ok(());
        }
        match self
            .client
            .delete_object(&self.config.bucket, &self.object_name(key))
        {
            Ok(_) => {
                self.tracer.record(&self.name, "delete", key);
                Ok(())
            }
            Err(ClientError::ObjectLocked) => {
                self.defer_delete(key);
                Ok(())
            }
            Err(e) => Err(map_client_error(key, e)),
        }
    }

    fn defer_delete(&self, key: &str) {
        let due = self.clock.now() + self.config.deferred_delete_grace;
        self.deferred
            .lock()
            .insert(key.to_string(), Deferred::Due(due));
        debug!(store = %self.name, key, "delete deferred");
        self.tracer.record(&self.name, "defer-delete", key);
    }

    fn sweep(&self) -> StoreResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let due: Vec<String> = {
            let deferred = self.deferred.lock();
            deferred
                .iter()
                .filter(|(_, d)| matches!(d, Deferred::Due(t) if *t <= now))
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in due {
            let due = {
                let mut deferred = self.deferred.lock();
                // Gone if a write cancelled it meanwhile.
                let Some(&Deferred::Due(due)) = deferred.get(&key) else {
                    continue;
                };
                deferred.insert(key.clone(), Deferred::Sweeping { due });
                due
            };
            // Writes of this key wait in `cancel_deferred` until the entry
            // leaves the sweeping state; other keys are not held up.
            let result = self
                .client
                .delete_object(&self.config.bucket, &self.object_name(&key));
            let mut deferred = self.deferred.lock();
            let outcome = match result {
                Ok(_) => {
                    deferred.remove(&key);
                    report.deleted += 1;
                    self.tracer.record(&self.name, "sweep-delete", &key);
                    Ok(())
                }
                Err(ClientError::ObjectLocked) => {
                    deferred.insert(key.clone(), Deferred::Due(due));
                    report.pending += 1;
                    Ok(())
                }
                Err(e) => {
                    deferred.insert(key.clone(), Deferred::Due(due));
                    Err(map_client_error(&key, e))
                }
            };
            drop(deferred);
            self.swept.notify_all();
            outcome?;
        }
        report.pending += self
            .deferred
            .lock()
            .values()
            .filter(|d| matches!(d, Deferred::Due(t) if *t > now))
            .count();

        self.retire_pseudo_keys(now, &mut report)?;
        Ok(report)
    }

    /// Delete pseudo-keyed objects past their grace window, and forget
    /// aliases that stayed retired for another grace window.
    fn retire_pseudo_keys(&self, now: SystemTime, report: &mut SweepReport) -> StoreResult<()> {
        let retiring: Vec<(String, String)> = {
            let mut states = self.pseudo.lock();
            let before = states.len();
            states.retain(|_, state| {
                !matches!(*state, PseudoKeyState::Retired { forget_after, .. } if forget_after <= now)
            });
            report.forgotten_pseudo_keys = before - states.len();
            states
                .iter()
                .filter_map(|(pseudo, state)| match state {
                    PseudoKeyState::EligibleForDeletion { real_key, after } if *after <= now => {
                        Some((pseudo.clone(), real_key.clone()))
                    }
                    _ => None,
                })
                .collect()
        };
        for (pseudo, real_key) in retiring {
            match self
                .client
                .delete_object(&self.config.bucket, &self.object_name(&pseudo))
            {
                Ok(_) | Err(ClientError::ObjectLocked) => {}
                Err(e) => return Err(map_client_error(&pseudo, e)),
            }
            let mut states = self.pseudo.lock();
            // A cancellation may have raced with the delete; the alias keeps
            // reads working either way.
            states.insert(
                pseudo.clone(),
                PseudoKeyState::Retired {
                    real_key,
                    forget_after: now + self.config.pseudo_key_grace,
                },
            );
            report.retired_pseudo_keys += 1;
            self.tracer.record(&self.name, "retire", &pseudo);
        }
        self.pseudo_changed.notify_all();
        Ok(())
    }

    /// Compute the real digest of a pseudo-keyed object and store it under
    /// that key.
    fn rekey(&self, job: &RekeyJob) -> StoreResult<()> {
        if self.epoch.load(Ordering::SeqCst) != job.epoch {
            return Ok(());
        }
        let Some(algorithm) = self.key_strategy.algorithm() else {
            return Ok(());
        };
        let tmp = tempfile::NamedTempFile::new()?;
        let found = self
            .client
            .get_object(&self.config.bucket, &self.object_name(&job.pseudo_key), tmp.path())
            .map_err(|e| map_client_error(&job.pseudo_key, e))?;
        if found.is_none() {
            debug!(store = %self.name, pseudo_key = %job.pseudo_key, "pseudo-keyed object vanished before rekey");
            return Ok(());
        }
        let real_key = digest_file(algorithm, tmp.path(), &job.pseudo_key)?;
        self.put(&real_key, tmp.path(), &PutOptions::default())?;

        {
            let mut states = self.pseudo.lock();
            if self.epoch.load(Ordering::SeqCst) != job.epoch {
                return Ok(());
            }
            states.insert(
                job.pseudo_key.clone(),
                PseudoKeyState::RealKeyConfirmed {
                    real_key: real_key.clone(),
                },
            );
            self.tracer.record(
                &self.name,
                "rekey",
                format_args!("{} -> {real_key}", job.pseudo_key),
            );
            states.insert(
                job.pseudo_key.clone(),
                PseudoKeyState::EligibleForDeletion {
                    real_key,
                    after: self.clock.now() + self.config.pseudo_key_grace,
                },
            );
        }
        self.pseudo_changed.notify_all();
        Ok(())
    }
}

fn digest_file(algorithm: DigestAlgorithm, path: &Path, key: &str) -> StoreResult<String> {
    let file = File::open(path).with_key(key)?;
    algorithm.digest_reader(BufReader::new(file)).with_key(key)
}

impl RemoteBlobStore {
    pub fn builder(
        name: impl Into<String>,
        client: Arc<dyn ObjectClient>,
        config: RemoteConfig,
    ) -> RemoteStoreBuilder {
        RemoteStoreBuilder {
            name: name.into(),
            client,
            config,
            key_strategy: KeyStrategy::Digest(DigestAlgorithm::Md5),
            clock: Arc::new(SystemClock),
            tracer: Tracer::disabled(),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &Arc<dyn ObjectClient> {
        &self.inner.client
    }

    /// Keys whose deletion is deferred, with their due time.
    pub fn deferred_deletes(&self) -> Vec<(String, SystemTime)> {
        self.inner
            .deferred
            .lock()
            .iter()
            .map(|(k, d)| match d {
                Deferred::Due(t) | Deferred::Sweeping { due: t } => (k.clone(), *t),
            })
            .collect()
    }

    /// Carry out deferred deletes that are due and retire pseudo-keyed
    /// objects whose grace window has passed.
    pub fn sweep_deferred(&self) -> StoreResult<SweepReport> {
        let report = self.inner.sweep()?;
        if report.deleted > 0 || report.retired_pseudo_keys > 0 || report.forgotten_pseudo_keys > 0 {
            info!(
                store = %self.inner.name,
                deleted = report.deleted,
                pending = report.pending,
                retired = report.retired_pseudo_keys,
                forgotten = report.forgotten_pseudo_keys,
                "deferred deletes swept"
            );
        }
        Ok(report)
    }

    /// Bring in a blob from a store with a different key strategy.
    ///
    /// When both stores key by the same digest the blob keeps its key.
    /// Otherwise it is stored at once under a pseudo key, returned to the
    /// caller, and a background job computes and stores the real digest.
    pub fn import_foreign(&self, source: &dyn BlobStore, source_key: &str) -> StoreResult<String> {
        if !self.inner.key_strategy.use_dedup() {
            return Err(StoreError::Unsupported {
                store: self.inner.name.clone(),
                operation: "import_foreign",
            });
        }
        if source.key_strategy() == &self.inner.key_strategy {
            if !self.copy_blob(source_key, source, source_key, false)? {
                return Err(StoreError::NotFound(source_key.to_string()));
            }
            return Ok(source_key.to_string());
        }

        let pseudo = pseudo_key(source_key);
        if !self.copy_blob(&pseudo, source, source_key, false)? {
            return Err(StoreError::NotFound(source_key.to_string()));
        }
        let epoch = {
            let mut states = self.inner.pseudo.lock();
            states.insert(pseudo.clone(), PseudoKeyState::PseudoKeyed);
            self.inner.epoch.load(Ordering::SeqCst)
        };
        self.inner.tracer.record(
            &self.inner.name,
            "import",
            format_args!("{}:{source_key} -> {pseudo}", source.name()),
        );
        let job = RekeyJob {
            pseudo_key: pseudo.clone(),
            epoch,
        };
        if self.jobs.send(job).is_err() {
            warn!(store = %self.inner.name, %pseudo, "rekey worker is gone, blob stays pseudo-keyed");
        }
        Ok(pseudo)
    }

    pub fn pseudo_key_state(&self, pseudo: &str) -> Option<PseudoKeyState> {
        self.inner.pseudo.lock().get(pseudo).cloned()
    }

    /// Block until `pseudo` has a confirmed real key, or `timeout` passes.
    pub fn wait_for_real_key(&self, pseudo: &str, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut states = self.inner.pseudo.lock();
        loop {
            match states.get(pseudo) {
                None => return None,
                Some(state) => {
                    if let Some(real) = state.real_key() {
                        return Some(real.to_string());
                    }
                }
            }
            if self
                .inner
                .pseudo_changed
                .wait_until(&mut states, deadline)
                .timed_out()
            {
                return states
                    .get(pseudo)
                    .and_then(|s| s.real_key().map(str::to_string));
            }
        }
    }

    /// Keep a pseudo-keyed object that was scheduled for deletion. Returns
    /// `false` if it was not scheduled.
    pub fn cancel_pseudo_key_deletion(&self, pseudo: &str) -> bool {
        let mut states = self.inner.pseudo.lock();
        match states.get(pseudo) {
            Some(PseudoKeyState::EligibleForDeletion { real_key, .. }) => {
                let real_key = real_key.clone();
                states.insert(pseudo.to_string(), PseudoKeyState::RealKeyConfirmed { real_key });
                true
            }
            _ => false,
        }
    }
}

impl BlobStore for RemoteBlobStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Remote {
            endpoint: self.inner.client.endpoint().to_string(),
            bucket: self.inner.config.bucket.clone(),
            prefix: self.inner.config.prefix.clone(),
        }
    }

    fn key_strategy(&self) -> &KeyStrategy {
        &self.inner.key_strategy
    }

    fn write_blob(&self, context: &BlobContext) -> StoreResult<String> {
        let mut write = self.inner.key_strategy.write_context(context)?;
        let mut tmp = tempfile::NamedTempFile::new()?;
        write.transfer(tmp.as_file_mut())?;
        let key = write
            .key()
            .ok_or_else(|| StoreError::Config("key strategy produced no key".into()))?
            .to_string();
        let options = PutOptions::for_blob(context.filename.as_deref(), context.mime_type.as_deref());
        self.inner.put(&key, tmp.path(), &options)?;
        Ok(key)
    }

    fn write_file(&self, key: &str, file: &Path) -> StoreResult<()> {
        self.inner.put(key, file, &PutOptions::default())
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        self.inner.read(key, dest)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        remote_location(&source.kind())
            .map_or(false, |(endpoint, _, _)| endpoint == self.inner.client.endpoint())
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        let kind = source.kind();
        let location = remote_location(&kind)
            .filter(|(endpoint, _, _)| *endpoint == self.inner.client.endpoint());
        let Some((_, source_bucket, source_prefix)) = location else {
            return copy_blob_generic(self, key, source, source_key, atomic_move);
        };

        self.inner.cancel_deferred(key);
        if self.inner.key_strategy.use_dedup() && self.inner.head(key)?.is_some() {
            self.inner.tracer.record(&self.inner.name, "exists", key);
        } else {
            let source_object = format!("{source_prefix}{source_key}");
            match self.inner.client.copy_object(
                source_bucket,
                &source_object,
                &self.inner.config.bucket,
                &self.inner.object_name(key),
            ) {
                Ok(false) => return Ok(false),
                Ok(true) => {
                    self.inner.tracer.record(
                        &self.inner.name,
                        "copy",
                        format_args!("{source_bucket}/{source_object} -> {key}"),
                    );
                }
                Err(ClientError::Timeout) => {
                    return Err(StoreError::Timeout {
                        key: key.to_string(),
                    })
                }
                Err(e) => {
                    warn!(store = %self.inner.name, key, error = %e, "direct copy failed, falling back to generic copy");
                    return copy_blob_generic(self, key, source, source_key, atomic_move);
                }
            }
        }
        if atomic_move {
            source.delete_blob(source_key)?;
        }
        Ok(true)
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key)
    }

    fn update_blob(&self, key: &str, update: &BlobUpdate) -> StoreResult<()> {
        let bucket = &self.inner.config.bucket;
        let object = self.inner.object_name(key);
        let client = &self.inner.client;
        let found = match update {
            BlobUpdate::StorageClass { class } => client.set_storage_class(bucket, &object, *class),
            BlobUpdate::Restore { days } => client.restore_object(bucket, &object, *days),
            BlobUpdate::LegalHold { hold } => client.set_legal_hold(bucket, &object, *hold),
            BlobUpdate::RetainUntil { until } => client.set_retention(bucket, &object, *until),
        }
        .map_err(|e| map_client_error(key, e))?;
        if !found {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.inner
            .tracer
            .record(&self.inner.name, "update", format_args!("{key} {update:?}"));
        Ok(())
    }

    fn status(&self, key: &str) -> StoreResult<BlobStatus> {
        if self.inner.is_pending_delete(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        match self.inner.head(key)? {
            Some(meta) => Ok(meta.status_at(self.inner.clock.now())),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    /// Stored keys. Objects that cannot be valid keys for this store
    /// (pseudo keys, foreign objects under the prefix) and logically deleted
    /// keys are left out, so garbage collection never touches them.
    fn list_keys(&self) -> StoreResult<Vec<String>> {
        let prefix = &self.inner.config.prefix;
        let objects = self
            .inner
            .client
            .list_objects(&self.inner.config.bucket, prefix)
            .map_err(|e| map_client_error(prefix, e))?;
        let deferred = self.inner.deferred.lock();
        Ok(objects
            .into_iter()
            .filter_map(|(name, _)| name.strip_prefix(prefix.as_str()).map(str::to_string))
            .filter(|key| !deferred.contains_key(key))
            .filter(|key| {
                !self.inner.key_strategy.use_dedup() || self.inner.key_strategy.is_valid_digest(key)
            })
            .collect())
    }

    fn clear(&self) -> StoreResult<()> {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.deferred.lock().clear();
        self.inner.pseudo.lock().clear();
        self.inner.pseudo_changed.notify_all();

        let bucket = &self.inner.config.bucket;
        let prefix = &self.inner.config.prefix;
        let client = &self.inner.client;
        let objects = client
            .list_objects(bucket, prefix)
            .map_err(|e| map_client_error(prefix, e))?;
        for (name, _) in objects {
            client
                .set_legal_hold(bucket, &name, false)
                .and_then(|_| client.set_retention(bucket, &name, None))
                .and_then(|_| client.delete_object(bucket, &name))
                .map_err(|e| map_client_error(&name, e))?;
        }
        self.inner.tracer.record(&self.inner.name, "clear", "*");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, InMemoryObjectClient, Operation};
    use strata_store::{LocalBlobStore, PathStrategy};
    use strata_types::{BlobSource, ManualClock, StorageClass, MAIN_XPATH};

    const FOO_MD5: &str = "acbd18db4cc2f85cedef654fccc4a4d8";
    const FOO_SHA256: &str = "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

    struct Fixture {
        client: Arc<InMemoryObjectClient>,
        clock: Arc<ManualClock>,
        store: RemoteBlobStore,
        tracer: Tracer,
    }

    fn fixture_with(bucket_setup: impl FnOnce(&InMemoryObjectClient)) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let client = Arc::new(InMemoryObjectClient::new("mem").with_clock(clock.clone()));
        bucket_setup(&client);
        let tracer = Tracer::recording();
        let store = RemoteBlobStore::builder(
            "remote",
            client.clone(),
            RemoteConfig::new("blobs").with_prefix("p/"),
        )
        .clock(clock.clone())
        .tracer(tracer.clone())
        .build()
        .unwrap();
        Fixture {
            client,
            clock,
            store,
            tracer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|c| c.create_bucket("blobs"))
    }

    fn foo() -> BlobContext {
        BlobContext::new(BlobSource::from_bytes(&b"foo"[..]))
    }

    // ----------------------------------------------------------------
    // Construction
    // ----------------------------------------------------------------

    #[test]
    fn missing_bucket_fails_construction() {
        let client = Arc::new(InMemoryObjectClient::new("mem"));
        let result = RemoteBlobStore::builder("remote", client, RemoteConfig::new("absent")).build();
        assert!(matches!(result, Err(StoreError::BucketNotFound(b)) if b == "absent"));
    }

    // ----------------------------------------------------------------
    // Write / read
    // ----------------------------------------------------------------

    #[test]
    fn write_uploads_once_under_prefix() {
        let f = fixture();
        assert_eq!(f.store.write_blob(&foo()).unwrap(), FOO_MD5);
        assert_eq!(f.store.write_blob(&foo()).unwrap(), FOO_MD5);
        assert_eq!(f.client.call_count(Operation::Put), 1);
        assert!(f.client.object_data("blobs", &format!("p/{FOO_MD5}")).is_some());
        assert_eq!(
            f.tracer.lines(),
            vec![format!("remote: put {FOO_MD5}"), format!("remote: exists {FOO_MD5}")]
        );
        assert_eq!(f.store.read_bytes(FOO_MD5).unwrap().unwrap(), b"foo");
    }

    #[test]
    fn write_sets_filename_and_mime_metadata() {
        let f = fixture();
        let ctx = foo().with_filename("foo.txt").with_mime_type("text/plain");
        let key = f.store.write_blob(&ctx).unwrap();
        let meta = f.client.head_object("blobs", &format!("p/{key}")).unwrap().unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            meta.content_disposition.as_deref(),
            Some("attachment; filename=\"foo.txt\"")
        );
    }

    #[test]
    fn timed_out_write_stores_nothing_and_is_retryable() {
        let f = fixture();
        f.client.inject_fault(Operation::Put, Fault::Timeout);
        let err = f.store.write_blob(&foo()).unwrap_err();
        assert!(err.is_retryable());
        assert!(!f.store.exists(FOO_MD5).unwrap());
        assert_eq!(f.store.write_blob(&foo()).unwrap(), FOO_MD5);
    }

    #[test]
    fn corrupted_download_is_detected() {
        let f = fixture();
        f.store.write_blob(&foo()).unwrap();
        assert!(f.client.corrupt_object("blobs", &format!("p/{FOO_MD5}"), &b"fox"[..]));
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let err = f.store.read_blob(FOO_MD5, &out).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn doc_id_keys_skip_digest_check() {
        let clock = Arc::new(ManualClock::starting_now());
        let client = Arc::new(InMemoryObjectClient::new("mem").with_clock(clock.clone()));
        client.create_bucket("docs");
        let store = RemoteBlobStore::builder("docs", client.clone(), RemoteConfig::new("docs"))
            .key_strategy(KeyStrategy::DocId)
            .build()
            .unwrap();
        let ctx = foo().with_doc("doc-1", MAIN_XPATH);
        assert_eq!(store.write_blob(&ctx).unwrap(), "doc-1");
        let v2 = BlobContext::new(BlobSource::from_bytes(&b"bar"[..])).with_doc("doc-1", MAIN_XPATH);
        store.write_blob(&v2).unwrap();
        assert_eq!(store.read_bytes("doc-1").unwrap().unwrap(), b"bar");
        assert_eq!(store.list_keys().unwrap(), vec!["doc-1".to_string()]);
    }

    // ----------------------------------------------------------------
    // Delete
    // ----------------------------------------------------------------

    #[test]
    fn delete_missing_is_noop() {
        let f = fixture();
        f.store.delete_blob(FOO_MD5).unwrap();
        assert_eq!(f.client.call_count(Operation::Delete), 0);
    }

    #[test]
    fn legal_hold_defers_delete_until_released() {
        let f = fixture();
        let key = f.store.write_blob(&foo()).unwrap();
        f.store
            .update_blob(&key, &BlobUpdate::LegalHold { hold: true })
            .unwrap();

        f.store.delete_blob(&key).unwrap();
        assert!(!f.store.exists(&key).unwrap());
        assert!(f.client.object_data("blobs", &format!("p/{key}")).is_some());
        assert!(f.store.list_keys().unwrap().is_empty());

        f.clock.advance(DEFAULT_DEFERRED_DELETE_GRACE + Duration::from_secs(1));
        let report = f.store.sweep_deferred().unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.pending, 1);

        f.client.set_legal_hold("blobs", &format!("p/{key}"), false).unwrap();
        let report = f.store.sweep_deferred().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(f.client.object_data("blobs", &format!("p/{key}")).is_none());
    }

    #[test]
    fn later_write_cancels_deferred_delete() {
        let f = fixture_with(|c| c.create_versioned_bucket("blobs"));
        let key = f.store.write_blob(&foo()).unwrap();
        f.store.delete_blob(&key).unwrap();
        assert_eq!(f.store.deferred_deletes().len(), 1);

        assert_eq!(f.store.write_blob(&foo()).unwrap(), key);
        assert!(f.store.deferred_deletes().is_empty());

        f.clock.advance(DEFAULT_DEFERRED_DELETE_GRACE * 2);
        let report = f.store.sweep_deferred().unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(f.store.read_bytes(&key).unwrap().unwrap(), b"foo");
    }

    #[test]
    fn sweep_waits_for_grace_window() {
        let f = fixture_with(|c| c.create_versioned_bucket("blobs"));
        let key = f.store.write_blob(&foo()).unwrap();
        f.store.delete_blob(&key).unwrap();
        assert_eq!(f.store.sweep_deferred().unwrap().pending, 1);
        f.clock.advance(DEFAULT_DEFERRED_DELETE_GRACE);
        assert_eq!(f.store.sweep_deferred().unwrap().deleted, 1);
    }

    #[test]
    fn retention_defers_delete_until_it_expires() {
        let f = fixture();
        let key = f.store.write_blob(&foo()).unwrap();
        let until = f.clock.now() + Duration::from_secs(48 * 60 * 60);
        f.store
            .update_blob(&key, &BlobUpdate::RetainUntil { until: Some(until) })
            .unwrap();

        f.store.delete_blob(&key).unwrap();
        assert!(!f.store.exists(&key).unwrap());
        assert_eq!(f.client.object_count("blobs"), 1);

        // Grace window over, retention not.
        f.clock.advance(DEFAULT_DEFERRED_DELETE_GRACE + Duration::from_secs(60 * 60));
        let report = f.store.sweep_deferred().unwrap();
        assert_eq!((report.deleted, report.pending), (0, 1));
        assert_eq!(f.client.object_count("blobs"), 1);

        f.clock.advance(DEFAULT_DEFERRED_DELETE_GRACE);
        assert_eq!(f.store.sweep_deferred().unwrap().deleted, 1);
        assert_eq!(f.client.object_count("blobs"), 0);
    }

    #[test]
    fn lifted_retention_deletes_at_once() {
        let f = fixture();
        let key = f.store.write_blob(&foo()).unwrap();
        let until = f.clock.now() + Duration::from_secs(60);
        f.store
            .update_blob(&key, &BlobUpdate::RetainUntil { until: Some(until) })
            .unwrap();
        f.store
            .update_blob(&key, &BlobUpdate::RetainUntil { until: None })
            .unwrap();
        f.store.delete_blob(&key).unwrap();
        assert!(f.store.deferred_deletes().is_empty());
        assert_eq!(f.client.object_count("blobs"), 0);
    }

    #[test]
    fn slow_sweep_does_not_block_other_keys() {
        let f = fixture_with(|c| c.create_versioned_bucket("blobs"));
        let key = f.store.write_blob(&foo()).unwrap();
        let other = f
            .store
            .write_blob(&BlobContext::new(BlobSource::from_bytes(&b"bar"[..])))
            .unwrap();
        f.store.delete_blob(&key).unwrap();
        f.clock.advance(DEFAULT_DEFERRED_DELETE_GRACE);
        f.client
            .inject_fault(Operation::Delete, Fault::Delay(Duration::from_millis(500)));

        thread::scope(|s| {
            let sweep = s.spawn(|| f.store.sweep_deferred().unwrap());
            thread::sleep(Duration::from_millis(100));

            let started = Instant::now();
            assert!(f.store.exists(&other).unwrap());
            assert!(!f.store.exists(&key).unwrap());
            assert_eq!(f.store.list_keys().unwrap(), vec![other.clone()]);
            assert!(started.elapsed() < Duration::from_millis(300));

            // Rewriting the key being swept waits for that delete, then
            // uploads again.
            assert_eq!(f.store.write_blob(&foo()).unwrap(), key);
            assert_eq!(sweep.join().unwrap().deleted, 1);
        });
        assert!(f.store.deferred_deletes().is_empty());
        assert_eq!(f.store.read_bytes(&key).unwrap().unwrap(), b"foo");
    }

    // ----------------------------------------------------------------
    // Tiering
    // ----------------------------------------------------------------

    #[test]
    fn archive_and_restore_status() {
        let f = fixture();
        let key = f.store.write_blob(&foo()).unwrap();
        assert_eq!(f.store.status(&key).unwrap(), BlobStatus::hot());

        f.store
            .update_blob(
                &key,
                &BlobUpdate::StorageClass {
                    class: StorageClass::Glacier,
                },
            )
            .unwrap();
        let status = f.store.status(&key).unwrap();
        assert!(!status.downloadable);
        assert!(matches!(f.store.read_bytes(&key), Err(StoreError::Archived { .. })));

        f.store.update_blob(&key, &BlobUpdate::Restore { days: 1 }).unwrap();
        assert!(f.store.status(&key).unwrap().restore_in_progress);

        f.clock.advance(Duration::from_secs(2 * 60 * 60));
        let status = f.store.status(&key).unwrap();
        assert!(status.downloadable);
        assert_eq!(status.storage_class, StorageClass::Glacier);
        assert_eq!(f.store.read_bytes(&key).unwrap().unwrap(), b"foo");
    }

    #[test]
    fn update_of_missing_blob_is_not_found() {
        let f = fixture();
        let err = f
            .store
            .update_blob(FOO_MD5, &BlobUpdate::Restore { days: 1 })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    // ----------------------------------------------------------------
    // Copy
    // ----------------------------------------------------------------

    #[test]
    fn same_endpoint_copy_is_server_side() {
        let f = fixture();
        f.client.create_bucket("other");
        let other = RemoteBlobStore::builder("other", f.client.clone(), RemoteConfig::new("other"))
            .build()
            .unwrap();
        let key = f.store.write_blob(&foo()).unwrap();

        assert!(other.copy_blob_is_optimized(&f.store));
        assert!(other.copy_blob(&key, &f.store, &key, true).unwrap());
        assert_eq!(f.client.call_count(Operation::Copy), 1);
        assert_eq!(f.client.call_count(Operation::Get), 0);
        assert!(!f.store.exists(&key).unwrap());
        assert_eq!(other.read_bytes(&key).unwrap().unwrap(), b"foo");
    }

    #[test]
    fn failed_direct_copy_falls_back() {
        let f = fixture();
        f.client.create_bucket("other");
        let other = RemoteBlobStore::builder("other", f.client.clone(), RemoteConfig::new("other"))
            .build()
            .unwrap();
        let key = f.store.write_blob(&foo()).unwrap();
        f.client
            .inject_fault(Operation::Copy, Fault::Error("AccessDenied".into()));

        assert!(other.copy_blob(&key, &f.store, &key, false).unwrap());
        assert_eq!(other.read_bytes(&key).unwrap().unwrap(), b"foo");
        assert!(f.store.exists(&key).unwrap());
    }

    #[test]
    fn copy_from_local_store_uploads() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let local = LocalBlobStore::open(
            "local",
            dir.path(),
            PathStrategy::Flat,
            KeyStrategy::Digest(DigestAlgorithm::Md5),
        )
        .unwrap();
        let key = local.write_blob(&foo()).unwrap();
        assert!(!f.store.copy_blob_is_optimized(&local));
        assert!(f.store.copy_blob(&key, &local, &key, false).unwrap());
        assert_eq!(f.store.read_bytes(&key).unwrap().unwrap(), b"foo");
        assert!(!f.store.copy_blob("missing", &local, "missing", false).unwrap());
    }

    // ----------------------------------------------------------------
    // Pseudo keys
    // ----------------------------------------------------------------

    #[test]
    fn foreign_digest_import_goes_through_pseudo_key() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let sha_store = LocalBlobStore::open(
            "sha",
            dir.path(),
            PathStrategy::Flat,
            KeyStrategy::Digest(DigestAlgorithm::Sha256),
        )
        .unwrap();
        let source_key = sha_store.write_blob(&foo()).unwrap();
        assert_eq!(source_key, FOO_SHA256);

        let pseudo = f.store.import_foreign(&sha_store, &source_key).unwrap();
        assert!(pseudo.starts_with(FOO_SHA256));
        assert!(!f.store.key_strategy().is_valid_digest(&pseudo));
        assert_eq!(f.store.read_bytes(&pseudo).unwrap().unwrap(), b"foo");

        let real = f
            .store
            .wait_for_real_key(&pseudo, Duration::from_secs(10))
            .unwrap();
        assert_eq!(real, FOO_MD5);
        assert!(f.store.exists(FOO_MD5).unwrap());
        assert!(matches!(
            f.store.pseudo_key_state(&pseudo),
            Some(PseudoKeyState::EligibleForDeletion { .. })
        ));

        // Same content written normally lands on the real key.
        assert_eq!(f.store.write_blob(&foo()).unwrap(), FOO_MD5);

        // GC listing never sees the pseudo key.
        assert_eq!(f.store.list_keys().unwrap(), vec![FOO_MD5.to_string()]);

        f.clock.advance(DEFAULT_PSEUDO_KEY_GRACE + Duration::from_secs(1));
        let report = f.store.sweep_deferred().unwrap();
        assert_eq!(report.retired_pseudo_keys, 1);
        assert!(f
            .client
            .object_data("blobs", &format!("p/{pseudo}"))
            .is_none());

        // Old references keep working through the alias.
        assert_eq!(f.store.read_bytes(&pseudo).unwrap().unwrap(), b"foo");
    }

    #[test]
    fn pseudo_key_deletion_can_be_cancelled() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let sha_store = LocalBlobStore::open(
            "sha",
            dir.path(),
            PathStrategy::Flat,
            KeyStrategy::Digest(DigestAlgorithm::Sha256),
        )
        .unwrap();
        let source_key = sha_store.write_blob(&foo()).unwrap();
        let pseudo = f.store.import_foreign(&sha_store, &source_key).unwrap();
        f.store
            .wait_for_real_key(&pseudo, Duration::from_secs(10))
            .unwrap();

        assert!(f.store.cancel_pseudo_key_deletion(&pseudo));
        assert!(!f.store.cancel_pseudo_key_deletion(&pseudo));
        f.clock.advance(DEFAULT_PSEUDO_KEY_GRACE * 2);
        assert_eq!(f.store.sweep_deferred().unwrap().retired_pseudo_keys, 0);
        assert!(f
            .client
            .object_data("blobs", &format!("p/{pseudo}"))
            .is_some());
    }

    #[test]
    fn retired_pseudo_key_alias_expires() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let sha_store = LocalBlobStore::open(
            "sha",
            dir.path(),
            PathStrategy::Flat,
            KeyStrategy::Digest(DigestAlgorithm::Sha256),
        )
        .unwrap();
        let source_key = sha_store.write_blob(&foo()).unwrap();
        let pseudo = f.store.import_foreign(&sha_store, &source_key).unwrap();
        f.store
            .wait_for_real_key(&pseudo, Duration::from_secs(10))
            .unwrap();

        f.clock.advance(DEFAULT_PSEUDO_KEY_GRACE + Duration::from_secs(1));
        assert_eq!(f.store.sweep_deferred().unwrap().retired_pseudo_keys, 1);
        assert!(matches!(
            f.store.pseudo_key_state(&pseudo),
            Some(PseudoKeyState::Retired { .. })
        ));

        f.clock.advance(DEFAULT_PSEUDO_KEY_GRACE + Duration::from_secs(1));
        let report = f.store.sweep_deferred().unwrap();
        assert_eq!(report.forgotten_pseudo_keys, 1);
        assert!(f.store.pseudo_key_state(&pseudo).is_none());
        assert!(f.store.read_bytes(&pseudo).unwrap().is_none());
        assert_eq!(f.store.read_bytes(FOO_MD5).unwrap().unwrap(), b"foo");
    }

    #[test]
    fn same_digest_import_keeps_key() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let md5_store = LocalBlobStore::open(
            "md5",
            dir.path(),
            PathStrategy::Flat,
            KeyStrategy::Digest(DigestAlgorithm::Md5),
        )
        .unwrap();
        let key = md5_store.write_blob(&foo()).unwrap();
        assert_eq!(f.store.import_foreign(&md5_store, &key).unwrap(), FOO_MD5);
        assert!(f.store.pseudo_key_state(FOO_MD5).is_none());
    }

    #[test]
    fn clear_voids_pending_rekeys() {
        let f = fixture();
        f.store.write_blob(&foo()).unwrap();
        f.store.clear().unwrap();
        assert_eq!(f.client.object_count("blobs"), 0);
        assert!(f.store.list_keys().unwrap().is_empty());
        assert_eq!(f.store.wait_for_real_key("nope", Duration::from_millis(1)), None);
    }
}
