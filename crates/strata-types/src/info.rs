use serde::{Deserialize, Serialize};

/// Durable reference to a stored blob.
///
/// `key` is the provider-qualified key (`"{provider}:{key}"`) when the info
/// comes out of a blob manager, and the bare store key otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl BlobInfo {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            digest: None,
            digest_algorithm: None,
            length: None,
            filename: None,
            mime_type: None,
        }
    }

    /// Split a provider-qualified key into `(provider, key)`.
    ///
    /// Provider ids never contain `':'`, so the first colon is the split
    /// point. Returns `None` for a bare key.
    pub fn provider_and_key(&self) -> Option<(&str, &str)> {
        self.key.split_once(':')
    }
}
