use std::sync::Arc;

use async_trait::async_trait;
use hollow_model::{Blob, FetchContext, Hash20, ObjectId};

use crate::Result;

/// Client for the source-control object store.
///
/// Implementations are shared across every inode and must be thread-safe;
/// the inode core does not serialize access to them.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Arc<Blob>>;

    /// SHA-1 of the blob contents, possibly served from metadata without
    /// fetching the blob itself.
    async fn get_blob_sha1(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Hash20>;

    /// Size of the blob in bytes, possibly served from metadata.
    async fn get_blob_size(&self, id: &ObjectId, ctx: &FetchContext) -> Result<u64>;

    /// Non-blocking SHA-1 lookup: `Some` only when the answer is already at
    /// hand. Used opportunistically at materialization time so writing the
    /// overlay file never waits on a metadata fetch.
    fn blob_sha1_if_ready(&self, _id: &ObjectId) -> Option<Hash20> {
        None
    }
}
