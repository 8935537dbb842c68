use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Storage tier of a blob.
///
/// Archival classes are cheap to keep but must be restored before their
/// data can be read again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    #[default]
    Standard,
    InfrequentAccess,
    Glacier,
    DeepArchive,
}

impl StorageClass {
    /// Returns `true` for tiers whose data is not directly retrievable.
    pub fn is_archival(&self) -> bool {
        matches!(self, Self::Glacier | Self::DeepArchive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::InfrequentAccess => "INFREQUENT_ACCESS",
            Self::Glacier => "GLACIER",
            Self::DeepArchive => "DEEP_ARCHIVE",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageClass {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "STANDARD" => Ok(Self::Standard),
            "INFREQUENT_ACCESS" | "STANDARD_IA" => Ok(Self::InfrequentAccess),
            "GLACIER" => Ok(Self::Glacier),
            "DEEP_ARCHIVE" => Ok(Self::DeepArchive),
            _ => Err(TypeError::UnknownStorageClass(s.to_string())),
        }
    }
}

/// A request to change how a stored blob is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobUpdate {
    /// Move the blob to another storage tier.
    StorageClass { class: StorageClass },
    /// Temporarily restore an archived blob for `days` days.
    Restore { days: u32 },
    /// Place or lift a legal hold. Held blobs cannot be deleted.
    LegalHold { hold: bool },
    /// Keep the blob from being deleted before `until`; `None` lifts the
    /// retention.
    RetainUntil { until: Option<SystemTime> },
}

/// Observable tiering state of a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStatus {
    /// Data can be read right now.
    pub downloadable: bool,
    pub storage_class: StorageClass,
    pub restore_in_progress: bool,
}

impl BlobStatus {
    /// Status of a blob in the standard tier.
    pub const fn hot() -> Self {
        Self {
            downloadable: true,
            storage_class: StorageClass::Standard,
            restore_in_progress: false,
        }
    }

    /// The status this blob would have right after `update` is applied.
    ///
    /// A restore only starts for an archived blob that is not already
    /// readable; it is a no-op otherwise. Legal holds and retention do not
    /// affect tiering.
    pub fn apply(&self, update: &BlobUpdate) -> Self {
        match update {
            BlobUpdate::StorageClass { class } => Self {
                downloadable: !class.is_archival(),
                storage_class: *class,
                restore_in_progress: false,
            },
            BlobUpdate::Restore { .. } => {
                if self.storage_class.is_archival() && !self.downloadable {
                    Self {
                        restore_in_progress: true,
                        ..*self
                    }
                } else {
                    *self
                }
            }
            BlobUpdate::LegalHold { .. } | BlobUpdate::RetainUntil { .. } => *self,
        }
    }
}

impl Default for BlobStatus {
    fn default() -> Self {
        Self::hot()
    }
}
