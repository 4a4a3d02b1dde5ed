use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use hollow_model::ObjectId;

use crate::Result;

/// Column families of the host-local key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// Legacy proxy-hash entries: serialized (revision, path) tuples keyed
    /// by the SHA-1 of the serialization.
    ProxyHash,
}

/// The host-local key/value store.
///
/// The inode core only ever persists proxy-hash entries through this
/// interface; everything else it stores goes through the overlay.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, family: KeySpace, key: &ObjectId) -> Result<Option<Vec<u8>>>;

    /// Fetch many keys in one round trip. The result vector is positional:
    /// `result[i]` corresponds to `keys[i]`.
    async fn get_batch(
        &self,
        family: KeySpace,
        keys: &[ObjectId],
    ) -> Result<Vec<Option<Vec<u8>>>>;

    /// Apply a prepared batch of writes atomically.
    async fn put_batch(&self, batch: WriteBatch) -> Result<()>;
}

/// A buffered set of writes, applied together via [`LocalStore::put_batch`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    entries: Vec<(KeySpace, ObjectId, Vec<u8>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, family: KeySpace, key: ObjectId, value: Vec<u8>) {
        self.entries.push((family, key, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<(KeySpace, ObjectId, Vec<u8>)> {
        self.entries
    }
}

/// In-process [`LocalStore`] backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    families: DashMap<KeySpace, HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, family: KeySpace, key: &ObjectId) -> Result<Option<Vec<u8>>> {
        Ok(self
            .families
            .get(&family)
            .and_then(|m| m.get(key.as_bytes()).cloned()))
    }

    async fn get_batch(
        &self,
        family: KeySpace,
        keys: &[ObjectId],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let map = self.families.get(&family);
        Ok(keys
            .iter()
            .map(|k| {
                map.as_ref()
                    .and_then(|m| m.get(k.as_bytes()).cloned())
            })
            .collect())
    }

    async fn put_batch(&self, batch: WriteBatch) -> Result<()> {
        for (family, key, value) in batch.into_entries() {
            self.families
                .entry(family)
                .or_default()
                .insert(key.as_bytes().to_vec(), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryLocalStore::new();
        let key = ObjectId::from_bytes(vec![1, 2, 3]);

        assert!(store.get(KeySpace::ProxyHash, &key).await.unwrap().is_none());

        let mut batch = WriteBatch::new();
        batch.put(KeySpace::ProxyHash, key.clone(), b"value".to_vec());
        store.put_batch(batch).await.unwrap();

        assert_eq!(
            store.get(KeySpace::ProxyHash, &key).await.unwrap(),
            Some(b"value".to_vec())
        );
    }

    #[tokio::test]
    async fn test_get_batch_is_positional() {
        let store = MemoryLocalStore::new();
        let present = ObjectId::from_bytes(vec![1]);
        let missing = ObjectId::from_bytes(vec![2]);

        let mut batch = WriteBatch::new();
        batch.put(KeySpace::ProxyHash, present.clone(), b"x".to_vec());
        store.put_batch(batch).await.unwrap();

        let results = store
            .get_batch(KeySpace::ProxyHash, &[missing.clone(), present.clone()])
            .await
            .unwrap();
        assert_eq!(results, vec![None, Some(b"x".to_vec())]);
    }
}
