use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use strata_crypto::DigestAlgorithm;
use strata_types::{Clock, StorageClass, SystemClock};

use crate::client::{restore_window, ObjectClient, ObjectMeta, PutOptions, RestoreState};
use crate::error::{ClientError, ClientResult};

/// Default time an archived object takes to become readable after a
/// restore request.
pub const DEFAULT_RESTORE_DELAY: Duration = Duration::from_secs(60 * 60);

/// Object service call kinds, for fault injection and call counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Head,
    Put,
    Get,
    Copy,
    Delete,
    List,
    Update,
}

/// A failure to inject into the next call of some [`Operation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    Error(String),
    /// Stall for the given time, then carry out the call normally.
    Delay(Duration),
}

struct StoredObject {
    data: Bytes,
    meta: ObjectMeta,
}

#[derive(Default)]
struct Bucket {
    versioning: bool,
    objects: BTreeMap<String, StoredObject>,
}

/// In-memory, HashMap-based object service.
///
/// Intended for tests and embedding. Behaves like a small S3: buckets must
/// exist before use, archived objects must be restored before download,
/// held or retained objects cannot be deleted. Faults queued with
/// [`inject_fault`](Self::inject_fault) fire on the next matching calls; a
/// failed call has no effect on stored state.
pub struct InMemoryObjectClient {
    endpoint: String,
    clock: Arc<dyn Clock>,
    restore_delay: Duration,
    buckets: RwLock<HashMap<String, Bucket>>,
    faults: Mutex<HashMap<Operation, VecDeque<Fault>>>,
    calls: Mutex<HashMap<Operation, u64>>,
}

impl InMemoryObjectClient {
    /// Create an empty service identified by `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            clock: Arc::new(SystemClock),
            restore_delay: DEFAULT_RESTORE_DELAY,
            buckets: RwLock::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_restore_delay(mut self, delay: Duration) -> Self {
        self.restore_delay = delay;
        self
    }

    pub fn create_bucket(&self, name: &str) {
        self.buckets.write().entry(name.to_string()).or_default();
    }

    pub fn create_versioned_bucket(&self, name: &str) {
        self.buckets.write().entry(name.to_string()).or_default().versioning = true;
    }

    /// Make the next call of `operation` fail with `fault`. Faults queue up.
    pub fn inject_fault(&self, operation: Operation, fault: Fault) {
        self.faults.lock().entry(operation).or_default().push_back(fault);
    }

    /// Number of calls of `operation` so far, including failed ones.
    pub fn call_count(&self, operation: Operation) -> u64 {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    /// Number of objects in `bucket`.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .read()
            .get(bucket)
            .map_or(0, |b| b.objects.len())
    }

    /// Raw stored bytes, bypassing tiering rules.
    pub fn object_data(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.data.clone())
    }

    /// Overwrite stored bytes without touching metadata, to simulate
    /// corruption at rest.
    pub fn corrupt_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) -> bool {
        match self
            .buckets
            .write()
            .get_mut(bucket)
            .and_then(|b| b.objects.get_mut(key))
        {
            Some(object) => {
                object.data = data.into();
                true
            }
            None => false,
        }
    }

    fn begin(&self, operation: Operation) -> ClientResult<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        let fault = self
            .faults
            .lock()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        match fault {
            None => Ok(()),
            Some(Fault::Timeout) => Err(ClientError::Timeout),
            Some(Fault::Error(message)) => Err(ClientError::Service(message)),
            Some(Fault::Delay(delay)) => {
                std::thread::sleep(delay);
                Ok(())
            }
        }
    }

    /// Settle a finished restore into `Restored`.
    fn effective_meta(&self, meta: &ObjectMeta) -> ObjectMeta {
        let mut meta = meta.clone();
        if let Some(RestoreState::InProgress { ready_at, days }) = meta.restore {
            if self.clock.now() >= ready_at {
                meta.restore = Some(RestoreState::Restored {
                    expires_at: ready_at + restore_window(days),
                });
            }
        }
        meta
    }

    fn with_bucket<T>(&self, bucket: &str, f: impl FnOnce(&Bucket) -> T) -> ClientResult<T> {
        let buckets = self.buckets.read();
        let b = buckets
            .get(bucket)
            .ok_or_else(|| ClientError::NoSuchBucket(bucket.to_string()))?;
        Ok(f(b))
    }

    fn with_bucket_mut<T>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut Bucket) -> ClientResult<T>,
    ) -> ClientResult<T> {
        let mut buckets = self.buckets.write();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| ClientError::NoSuchBucket(bucket.to_string()))?;
        f(b)
    }

    fn update_object(
        &self,
        bucket: &str,
        key: &str,
        f: impl FnOnce(&mut ObjectMeta),
    ) -> ClientResult<bool> {
        self.begin(Operation::Update)?;
        self.with_bucket_mut(bucket, |b| match b.objects.get_mut(key) {
            Some(object) => {
                f(&mut object.meta);
                Ok(true)
            }
            None => Ok(false),
        })
    }
}

impl fmt::Debug for InMemoryObjectClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryObjectClient")
            .field("endpoint", &self.endpoint)
            .field("buckets", &self.buckets.read().len())
            .finish()
    }
}

impl ObjectClient for InMemoryObjectClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn bucket_exists(&self, bucket: &str) -> ClientResult<bool> {
        self.begin(Operation::Head)?;
        Ok(self.buckets.read().contains_key(bucket))
    }

    fn versioning_enabled(&self, bucket: &str) -> ClientResult<bool> {
        self.begin(Operation::Head)?;
        self.with_bucket(bucket, |b| b.versioning)
    }

    fn head_object(&self, bucket: &str, key: &str) -> ClientResult<Option<ObjectMeta>> {
        self.begin(Operation::Head)?;
        self.with_bucket(bucket, |b| {
            b.objects.get(key).map(|o| self.effective_meta(&o.meta))
        })
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
        options: &PutOptions,
    ) -> ClientResult<ObjectMeta> {
        self.begin(Operation::Put)?;
        let data = Bytes::from(std::fs::read(file)?);
        let meta = ObjectMeta {
            length: data.len() as u64,
            etag: DigestAlgorithm::Md5.digest_hex(&data),
            storage_class: StorageClass::Standard,
            restore: None,
            legal_hold: false,
            retain_until: None,
            content_type: options.content_type.clone(),
            content_disposition: options.content_disposition.clone(),
        };
        self.with_bucket_mut(bucket, |b| {
            b.objects.insert(
                key.to_string(),
                StoredObject {
                    data,
                    meta: meta.clone(),
                },
            );
            Ok(meta)
        })
    }

    fn get_object(&self, bucket: &str, key: &str, dest: &Path) -> ClientResult<Option<ObjectMeta>> {
        self.begin(Operation::Get)?;
        let found = self.with_bucket(bucket, |b| {
            b.objects
                .get(key)
                .map(|o| (o.data.clone(), self.effective_meta(&o.meta)))
        })?;
        let Some((data, meta)) = found else {
            return Ok(None);
        };
        if !meta.status_at(self.clock.now()).downloadable {
            return Err(ClientError::InvalidObjectState);
        }
        std::fs::write(dest, &data)?;
        Ok(Some(meta))
    }

    fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> ClientResult<bool> {
        self.begin(Operation::Copy)?;
        let mut buckets = self.buckets.write();
        if !buckets.contains_key(dest_bucket) {
            return Err(ClientError::NoSuchBucket(dest_bucket.to_string()));
        }
        let source = buckets
            .get(source_bucket)
            .ok_or_else(|| ClientError::NoSuchBucket(source_bucket.to_string()))?;
        let Some(object) = source.objects.get(source_key) else {
            return Ok(false);
        };
        let copied = StoredObject {
            data: object.data.clone(),
            meta: ObjectMeta {
                storage_class: StorageClass::Standard,
                restore: None,
                legal_hold: false,
                retain_until: None,
                ..object.meta.clone()
            },
        };
        if let Some(dest) = buckets.get_mut(dest_bucket) {
            dest.objects.insert(dest_key.to_string(), copied);
        }
        Ok(true)
    }

    fn delete_object(&self, bucket: &str, key: &str) -> ClientResult<bool> {
        self.begin(Operation::Delete)?;
        let now = self.clock.now();
        self.with_bucket_mut(bucket, |b| {
            if b.objects.get(key).map_or(false, |o| o.meta.is_locked_at(now)) {
                return Err(ClientError::ObjectLocked);
            }
            Ok(b.objects.remove(key).is_some())
        })
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> ClientResult<Vec<(String, u64)>> {
        self.begin(Operation::List)?;
        self.with_bucket(bucket, |b| {
            b.objects
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, o)| (k.clone(), o.meta.length))
                .collect()
        })
    }

    fn set_storage_class(&self, bucket: &str, key: &str, class: StorageClass) -> ClientResult<bool> {
        self.update_object(bucket, key, |meta| {
            meta.storage_class = class;
            meta.restore = None;
        })
    }

    fn restore_object(&self, bucket: &str, key: &str, days: u32) -> ClientResult<bool> {
        let ready_at = self.clock.now() + self.restore_delay;
        self.update_object(bucket, key, |meta| {
            if meta.storage_class.is_archival() && meta.restore.is_none() {
                meta.restore = Some(RestoreState::InProgress { ready_at, days });
            }
        })
    }

    fn set_legal_hold(&self, bucket: &str, key: &str, hold: bool) -> ClientResult<bool> {
        self.update_object(bucket, key, |meta| meta.legal_hold = hold)
    }

    fn set_retention(&self, bucket: &str, key: &str, until: Option<SystemTime>) -> ClientResult<bool> {
        self.update_object(bucket, key, |meta| meta.retain_until = until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::ManualClock;

    fn client_with_object(data: &[u8]) -> (InMemoryObjectClient, tempfile::TempDir) {
        let client = InMemoryObjectClient::new("mem");
        client.create_bucket("b");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("src");
        std::fs::write(&file, data).unwrap();
        client.put_object("b", "k", &file, &PutOptions::default()).unwrap();
        (client, dir)
    }

    #[test]
    fn put_head_get() {
        let (client, dir) = client_with_object(b"foo");
        let meta = client.head_object("b", "k").unwrap().unwrap();
        assert_eq!(meta.length, 3);
        assert_eq!(meta.etag, "acbd18db4cc2f85cedef654fccc4a4d8");

        let out = dir.path().join("out");
        assert!(client.get_object("b", "k", &out).unwrap().is_some());
        assert_eq!(std::fs::read(&out).unwrap(), b"foo");
        assert!(client.get_object("b", "nope", &out).unwrap().is_none());
    }

    #[test]
    fn missing_bucket_is_an_error() {
        let client = InMemoryObjectClient::new("mem");
        assert!(!client.bucket_exists("b").unwrap());
        assert!(matches!(
            client.head_object("b", "k"),
            Err(ClientError::NoSuchBucket(name)) if name == "b"
        ));
    }

    #[test]
    fn injected_timeout_has_no_effect() {
        let (client, dir) = client_with_object(b"foo");
        client.inject_fault(Operation::Put, Fault::Timeout);
        let file = dir.path().join("other");
        std::fs::write(&file, b"bar").unwrap();
        assert!(matches!(
            client.put_object("b", "k2", &file, &PutOptions::default()),
            Err(ClientError::Timeout)
        ));
        assert!(client.head_object("b", "k2").unwrap().is_none());
        assert!(client.put_object("b", "k2", &file, &PutOptions::default()).is_ok());
        assert_eq!(client.call_count(Operation::Put), 3);
    }

    #[test]
    fn archived_object_needs_restore() {
        let clock = Arc::new(ManualClock::starting_now());
        let client = InMemoryObjectClient::new("mem")
            .with_clock(clock.clone())
            .with_restore_delay(Duration::from_secs(10));
        client.create_bucket("b");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("src");
        std::fs::write(&file, b"cold").unwrap();
        client.put_object("b", "k", &file, &PutOptions::default()).unwrap();

        assert!(client.set_storage_class("b", "k", StorageClass::Glacier).unwrap());
        let out = dir.path().join("out");
        assert!(matches!(
            client.get_object("b", "k", &out),
            Err(ClientError::InvalidObjectState)
        ));

        assert!(client.restore_object("b", "k", 1).unwrap());
        let status = client.head_object("b", "k").unwrap().unwrap().status_at(clock.now());
        assert!(status.restore_in_progress);

        clock.advance(Duration::from_secs(11));
        assert!(client.get_object("b", "k", &out).unwrap().is_some());
        assert!(matches!(
            client.head_object("b", "k").unwrap().unwrap().restore,
            Some(RestoreState::Restored { .. })
        ));
    }

    #[test]
    fn legal_hold_blocks_delete() {
        let (client, _dir) = client_with_object(b"foo");
        client.set_legal_hold("b", "k", true).unwrap();
        assert!(matches!(client.delete_object("b", "k"), Err(ClientError::ObjectLocked)));
        client.set_legal_hold("b", "k", false).unwrap();
        assert!(client.delete_object("b", "k").unwrap());
        assert!(!client.delete_object("b", "k").unwrap());
    }

    #[test]
    fn retention_blocks_delete_until_expiry() {
        let clock = Arc::new(ManualClock::starting_now());
        let client = InMemoryObjectClient::new("mem").with_clock(clock.clone());
        client.create_bucket("b");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("src");
        std::fs::write(&file, b"kept").unwrap();
        client.put_object("b", "k", &file, &PutOptions::default()).unwrap();

        let until = clock.now() + Duration::from_secs(60);
        assert!(client.set_retention("b", "k", Some(until)).unwrap());
        assert!(!client.set_retention("b", "missing", Some(until)).unwrap());
        assert!(matches!(client.delete_object("b", "k"), Err(ClientError::ObjectLocked)));

        clock.advance(Duration::from_secs(60));
        assert!(client.delete_object("b", "k").unwrap());
    }

    #[test]
    fn copy_and_list() {
        let (client, _dir) = client_with_object(b"foo");
        client.create_bucket("other");
        assert!(client.copy_object("b", "k", "other", "p/k").unwrap());
        assert!(!client.copy_object("b", "missing", "other", "p/x").unwrap());
        assert_eq!(
            client.list_objects("other", "p/").unwrap(),
            vec![("p/k".to_string(), 3)]
        );
        assert!(client.list_objects("other", "q/").unwrap().is_empty());
    }
}
