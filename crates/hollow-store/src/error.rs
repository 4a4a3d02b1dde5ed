use std::sync::Arc;

use hollow_model::ObjectId;
use thiserror::Error;

/// Errors from the store facades.
///
/// `Clone` because a single blob-load failure fans out to every subscriber
/// of the in-flight load.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The object id was not a recognized proxy-hash shape, or the stored
    /// bytes for it failed validation. Treated as data corruption.
    #[error("malformed proxy hash {id}: {reason}")]
    MalformedProxyHash { id: ObjectId, reason: String },

    /// A legacy proxy hash id with no entry in the local store.
    #[error("unknown proxy hash {0}")]
    UnknownProxyHash(ObjectId),

    /// The requested object does not exist in the object store.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// A transient fetch failure; the caller may retry.
    #[error("blob fetch failed for {id}: {reason}")]
    BlobFetchFailed { id: ObjectId, reason: String },

    /// An in-flight load went away without producing a result.
    #[error("blob load interrupted for {0}")]
    LoadInterrupted(ObjectId),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
