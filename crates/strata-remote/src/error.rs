use std::io;

/// Errors reported by an object service.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,

    #[error("bucket '{0}' does not exist")]
    NoSuchBucket(String),

    /// The object is in an archival tier and has not been restored.
    #[error("object is archived and not restored")]
    InvalidObjectState,

    /// A legal hold or an unexpired retention date refuses the delete.
    #[error("object is under legal hold or retention")]
    ObjectLocked,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("service error: {0}")]
    Service(String),
}

/// Result alias for object service calls.
pub type ClientResult<T> = Result<T, ClientError>;
