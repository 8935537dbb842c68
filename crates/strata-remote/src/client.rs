use std::fmt;
use std::path::Path;
use std::time::SystemTime;

use strata_types::{BlobStatus, StorageClass};

use crate::error::ClientResult;

/// Progress of a restore out of an archival tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreState {
    /// Restore requested; data becomes readable at `ready_at`.
    InProgress { ready_at: SystemTime, days: u32 },
    /// A readable copy exists until `expires_at`.
    Restored { expires_at: SystemTime },
}

/// Object metadata as reported by the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub length: u64,
    /// Lowercase hex MD5 of the content.
    pub etag: String,
    pub storage_class: StorageClass,
    pub restore: Option<RestoreState>,
    pub legal_hold: bool,
    /// Retention date before which the object cannot be deleted.
    pub retain_until: Option<SystemTime>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl ObjectMeta {
    /// Whether a delete at `now` is refused by a legal hold or retention.
    pub fn is_locked_at(&self, now: SystemTime) -> bool {
        self.legal_hold || self.retain_until.map_or(false, |until| now < until)
    }

    /// Tiering status as of `now`.
    pub fn status_at(&self, now: SystemTime) -> BlobStatus {
        if !self.storage_class.is_archival() {
            return BlobStatus {
                downloadable: true,
                storage_class: self.storage_class,
                restore_in_progress: false,
            };
        }
        let (downloadable, restore_in_progress) = match self.restore {
            Some(RestoreState::InProgress { ready_at, .. }) if now < ready_at => (false, true),
            Some(RestoreState::InProgress { ready_at, days }) => {
                (now < ready_at + restore_window(days), false)
            }
            Some(RestoreState::Restored { expires_at }) => (now < expires_at, false),
            None => (false, false),
        };
        BlobStatus {
            downloadable,
            storage_class: self.storage_class,
            restore_in_progress,
        }
    }
}

/// How long a restored copy stays readable.
pub fn restore_window(days: u32) -> std::time::Duration {
    std::time::Duration::from_secs(u64::from(days) * 24 * 60 * 60)
}

/// Per-upload object metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl PutOptions {
    /// Metadata for a blob with an optional original filename and MIME type.
    pub fn for_blob(filename: Option<&str>, mime_type: Option<&str>) -> Self {
        Self {
            content_type: mime_type.map(str::to_string),
            content_disposition: filename
                .map(|name| format!("attachment; filename=\"{}\"", name.replace('"', "\\\""))),
        }
    }
}

/// Minimal S3-style object service API.
///
/// Calls returning `bool` report whether the object existed. Every call may
/// fail with [`ClientError::Timeout`](crate::ClientError::Timeout), after
/// which the caller cannot assume anything about the object's state.
pub trait ObjectClient: Send + Sync + fmt::Debug {
    /// Identity of the service. Two clients with the same endpoint can copy
    /// objects server-side.
    fn endpoint(&self) -> &str;

    fn bucket_exists(&self, bucket: &str) -> ClientResult<bool>;

    fn versioning_enabled(&self, bucket: &str) -> ClientResult<bool>;

    fn head_object(&self, bucket: &str, key: &str) -> ClientResult<Option<ObjectMeta>>;

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
        options: &PutOptions,
    ) -> ClientResult<ObjectMeta>;

    /// Download into `dest`. Fails with `InvalidObjectState` for archived,
    /// unrestored objects.
    fn get_object(&self, bucket: &str, key: &str, dest: &Path) -> ClientResult<Option<ObjectMeta>>;

    fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> ClientResult<bool>;

    /// Fails with `ObjectLocked` for held or retained objects.
    fn delete_object(&self, bucket: &str, key: &str) -> ClientResult<bool>;

    /// Keys and lengths under `prefix`, sorted by key.
    fn list_objects(&self, bucket: &str, prefix: &str) -> ClientResult<Vec<(String, u64)>>;

    fn set_storage_class(&self, bucket: &str, key: &str, class: StorageClass) -> ClientResult<bool>;

    fn restore_object(&self, bucket: &str, key: &str, days: u32) -> ClientResult<bool>;

    fn set_legal_hold(&self, bucket: &str, key: &str, hold: bool) -> ClientResult<bool>;

    /// Set or lift (`None`) the retention date of an object.
    fn set_retention(&self, bucket: &str, key: &str, until: Option<SystemTime>) -> ClientResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn meta(class: StorageClass, restore: Option<RestoreState>) -> ObjectMeta {
        ObjectMeta {
            length: 1,
            etag: String::new(),
            storage_class: class,
            restore,
            legal_hold: false,
            retain_until: None,
            content_type: None,
            content_disposition: None,
        }
    }

    #[test]
    fn hot_object_is_downloadable() {
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let status = meta(StorageClass::InfrequentAccess, None).status_at(now);
        assert!(status.downloadable);
        assert!(!status.restore_in_progress);
    }

    #[test]
    fn restore_lifecycle() {
        let t0 = UNIX_EPOCH + Duration::from_secs(1_000);
        let ready_at = t0 + Duration::from_secs(60);
        let m = meta(
            StorageClass::Glacier,
            Some(RestoreState::InProgress { ready_at, days: 1 }),
        );

        let during = m.status_at(t0);
        assert!(!during.downloadable);
        assert!(during.restore_in_progress);

        let after = m.status_at(ready_at + Duration::from_secs(1));
        assert!(after.downloadable);
        assert!(!after.restore_in_progress);

        let expired = m.status_at(ready_at + restore_window(1) + Duration::from_secs(1));
        assert!(!expired.downloadable);
        assert!(!expired.restore_in_progress);

        assert!(!meta(StorageClass::DeepArchive, None).status_at(t0).downloadable);
    }

    #[test]
    fn retention_locks_until_it_passes() {
        let t0 = UNIX_EPOCH + Duration::from_secs(1_000);
        let mut m = meta(StorageClass::Standard, None);
        assert!(!m.is_locked_at(t0));
        m.retain_until = Some(t0 + Duration::from_secs(60));
        assert!(m.is_locked_at(t0));
        assert!(!m.is_locked_at(t0 + Duration::from_secs(60)));
        m.retain_until = None;
        m.legal_hold = true;
        assert!(m.is_locked_at(t0));
    }

    #[test]
    fn content_disposition_quotes_filename() {
        let opts = PutOptions::for_blob(Some("a \"b\".txt"), Some("text/plain"));
        assert_eq!(opts.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            opts.content_disposition.as_deref(),
            Some("attachment; filename=\"a \\\"b\\\".txt\"")
        );
        assert_eq!(PutOptions::for_blob(None, None), PutOptions::default());
    }
}
