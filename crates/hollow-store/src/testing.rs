//! Test doubles for the store facades.
//!
//! [`FakeObjectStore`] serves blobs injected directly by the test and counts
//! accesses per id, so tests can assert how often the backing store was
//! consulted. Fetches can optionally be held at a gate to build loading
//! races deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hollow_model::{Blob, FetchContext, Hash20, ObjectId};
use tokio::sync::Semaphore;

use crate::{ObjectStore, Result, StoreError};

#[derive(Default)]
struct Counters {
    blob: HashMap<ObjectId, usize>,
    sha1: HashMap<ObjectId, usize>,
    size: HashMap<ObjectId, usize>,
}

/// In-memory [`ObjectStore`] for tests.
pub struct FakeObjectStore {
    blobs: Mutex<HashMap<ObjectId, Arc<Blob>>>,
    counters: Mutex<Counters>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        FakeObjectStore {
            blobs: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            gate: Mutex::new(None),
        }
    }

    pub fn add_blob(&self, id: ObjectId, contents: Vec<u8>) {
        let blob = Arc::new(Blob::new(id.clone(), contents));
        self.blobs.lock().unwrap().insert(id, blob);
    }

    /// Add a blob whose id is the SHA-1 of its contents; returns the id.
    pub fn add_blob_contents(&self, contents: Vec<u8>) -> ObjectId {
        let id = ObjectId::sha1(&contents);
        self.add_blob(id.clone(), contents);
        id
    }

    /// Hold all subsequent fetches until [`release_fetches`](Self::release_fetches).
    pub fn hold_fetches(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_fetches(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn blob_access_count(&self, id: &ObjectId) -> usize {
        *self.counters.lock().unwrap().blob.get(id).unwrap_or(&0)
    }

    pub fn size_access_count(&self, id: &ObjectId) -> usize {
        *self.counters.lock().unwrap().size.get(id).unwrap_or(&0)
    }

    pub fn sha1_access_count(&self, id: &ObjectId) -> usize {
        *self.counters.lock().unwrap().sha1.get(id).unwrap_or(&0)
    }

    async fn wait_at_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            // Permits are never returned; each held fetch consumes one once
            // the gate opens.
            let permit = gate.acquire().await.expect("gate never closed");
            permit.forget();
        }
    }

    fn lookup(&self, id: &ObjectId) -> Result<Arc<Blob>> {
        self.blobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

impl Default for FakeObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn get_blob(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Arc<Blob>> {
        *self
            .counters
            .lock()
            .unwrap()
            .blob
            .entry(id.clone())
            .or_insert(0) += 1;
        self.wait_at_gate().await;
        self.lookup(id)
    }

    async fn get_blob_sha1(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Hash20> {
        *self
            .counters
            .lock()
            .unwrap()
            .sha1
            .entry(id.clone())
            .or_insert(0) += 1;
        Ok(self.lookup(id)?.content_sha1())
    }

    async fn get_blob_size(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<u64> {
        *self
            .counters
            .lock()
            .unwrap()
            .size
            .entry(id.clone())
            .or_insert(0) += 1;
        self.wait_at_gate().await;
        Ok(self.lookup(id)?.size())
    }

    fn blob_sha1_if_ready(&self, id: &ObjectId) -> Option<Hash20> {
        self.blobs
            .lock()
            .unwrap()
            .get(id)
            .map(|blob| blob.content_sha1())
    }
}
