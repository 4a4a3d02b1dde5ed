use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hollow_model::{Blob, FetchContext, ObjectId};
use tokio::sync::watch;
use tracing::debug;

use crate::{BlobCache, BlobInterestHandle, Interest, ObjectStore, Result, StoreError};

type LoadResult = std::result::Result<Arc<Blob>, StoreError>;

/// Single-flight blob loader in front of the cache and the object store.
///
/// Concurrent requests for the same id share one underlying fetch. The
/// fetch runs on a spawned task, so a caller dropping its future neither
/// cancels the load nor strands the other subscribers.
pub struct BlobAccess {
    store: Arc<dyn ObjectStore>,
    cache: Arc<BlobCache>,
    inflight: Arc<DashMap<ObjectId, watch::Receiver<Option<LoadResult>>>>,
}

impl BlobAccess {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<BlobCache>) -> Arc<Self> {
        Arc::new(BlobAccess {
            store,
            cache,
            inflight: Arc::new(DashMap::new()),
        })
    }

    pub fn cache(&self) -> &Arc<BlobCache> {
        &self.cache
    }

    /// Fetch a blob, deduplicating concurrent fetches of the same id.
    ///
    /// The returned interest handle keeps the blob cached according to
    /// `interest`.
    pub async fn get_blob(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
        interest: Interest,
    ) -> Result<(Arc<Blob>, BlobInterestHandle)> {
        let lookup = self.cache.get(id, interest);
        if let Some(blob) = lookup.blob {
            return Ok((blob, lookup.interest_handle));
        }

        let mut rx = self.subscribe_or_start(id, ctx);
        let result = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| StoreError::LoadInterrupted(id.clone()))?
            .clone()
            .expect("wait_for only returns filled slots");

        let blob = result?;
        let handle = self.cache.insert(Arc::clone(&blob), interest);
        Ok((blob, handle))
    }

    fn subscribe_or_start(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
    ) -> watch::Receiver<Option<LoadResult>> {
        match self.inflight.entry(id.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx.clone());

                let store = Arc::clone(&self.store);
                let inflight = Arc::clone(&self.inflight);
                let id = id.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    debug!(blob = %id, "fetching blob from object store");
                    let result = store.get_blob(&id, &ctx).await;
                    inflight.remove(&id);
                    // send_replace never fails; late subscribers raced the
                    // removal above and still observe the stored value.
                    tx.send_replace(Some(result));
                });
                rx
            }
        }
    }
}
