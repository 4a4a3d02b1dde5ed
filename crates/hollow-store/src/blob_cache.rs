use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use hollow_model::{Blob, ObjectId};
use tracing::trace;

/// How likely the caller is to need the blob again.
///
/// Determines whether a live interest handle is issued. Blobs with at least
/// one live handle are never evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// The blob will be dropped into the overlay or consumed once; do not
    /// retain it on the caller's behalf.
    UnlikelyNeededAgain,
    /// Issue a handle; the blob stays resident while the handle lives.
    WantHandle,
    /// Issue a handle and keep the blob around even once handles go away,
    /// budget permitting.
    LikelyNeededAgain,
}

struct CacheEntry {
    blob: Arc<Blob>,
    generation: u64,
    interest_count: u32,
    keep_after_release: bool,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<ObjectId, CacheEntry>,
    total_bytes: u64,
    next_generation: u64,
}

/// In-memory blob cache with interest-handle accounting.
///
/// Eviction only considers entries with no live interest handles, oldest
/// generation first, and only once the byte budget is exceeded.
pub struct BlobCache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
}

/// Result of a cache probe: the blob if present, plus a handle expressing
/// the caller's interest (which may be empty for
/// [`Interest::UnlikelyNeededAgain`] or a miss).
pub struct CacheLookup {
    pub blob: Option<Arc<Blob>>,
    pub interest_handle: BlobInterestHandle,
}

impl BlobCache {
    /// Default in-memory budget for cached blobs.
    pub const DEFAULT_MAX_BYTES: u64 = 64 * 1024 * 1024;

    pub fn new(max_bytes: u64) -> Arc<Self> {
        Arc::new(BlobCache {
            inner: Mutex::new(CacheInner::default()),
            max_bytes,
        })
    }

    pub fn with_default_budget() -> Arc<Self> {
        Self::new(Self::DEFAULT_MAX_BYTES)
    }

    pub fn get(self: &Arc<Self>, id: &ObjectId, interest: Interest) -> CacheLookup {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(id) {
            Some(entry) => {
                let blob = Arc::clone(&entry.blob);
                let handle = Self::issue_handle(self, entry, id, interest);
                CacheLookup {
                    blob: Some(blob),
                    interest_handle: handle,
                }
            }
            None => CacheLookup {
                blob: None,
                interest_handle: BlobInterestHandle::none(),
            },
        }
    }

    /// Insert a blob, returning a handle for the caller's interest.
    /// Re-inserting an existing id only adds interest.
    pub fn insert(
        self: &Arc<Self>,
        blob: Arc<Blob>,
        interest: Interest,
    ) -> BlobInterestHandle {
        let id = blob.id().clone();
        let mut inner = self.inner.lock().unwrap();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        if !inner.entries.contains_key(&id) {
            inner.total_bytes += blob.size();
            inner.entries.insert(
                id.clone(),
                CacheEntry {
                    blob,
                    generation,
                    interest_count: 0,
                    keep_after_release: false,
                },
            );
        }
        let entry = inner.entries.get_mut(&id).expect("entry just ensured");
        let handle = Self::issue_handle(self, entry, &id, interest);
        Self::evict_to_budget(&mut inner, self.max_bytes);
        handle
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner.lock().unwrap().entries.contains_key(id)
    }

    fn issue_handle(
        cache: &Arc<Self>,
        entry: &mut CacheEntry,
        id: &ObjectId,
        interest: Interest,
    ) -> BlobInterestHandle {
        match interest {
            Interest::UnlikelyNeededAgain => BlobInterestHandle::none(),
            Interest::WantHandle | Interest::LikelyNeededAgain => {
                entry.interest_count += 1;
                if interest == Interest::LikelyNeededAgain {
                    entry.keep_after_release = true;
                }
                BlobInterestHandle {
                    inner: Some(HandleInner {
                        cache: Arc::downgrade(cache),
                        id: id.clone(),
                        generation: entry.generation,
                    }),
                }
            }
        }
    }

    fn release(&self, id: &ObjectId, generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(id) {
            if entry.generation == generation && entry.interest_count > 0 {
                entry.interest_count -= 1;
            }
        }
        Self::evict_to_budget(&mut inner, self.max_bytes);
    }

    fn evict_to_budget(inner: &mut CacheInner, max_bytes: u64) {
        while inner.total_bytes > max_bytes {
            // Unpinned entries only; blobs marked likely-needed-again go
            // after everything else, oldest first within each class.
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| e.interest_count == 0)
                .min_by_key(|(_, e)| (e.keep_after_release, e.generation))
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    if let Some(entry) = inner.entries.remove(&id) {
                        inner.total_bytes -= entry.blob.size();
                        trace!(blob = %id, "evicted blob from cache");
                    }
                }
                // Everything left is pinned by interest handles.
                None => break,
            }
        }
    }
}

struct HandleInner {
    cache: Weak<BlobCache>,
    id: ObjectId,
    generation: u64,
}

/// A token whose liveness keeps a cached blob resident.
///
/// Dropping (or [`reset`](Self::reset)ting) the handle releases the
/// interest, making the blob eligible for eviction.
pub struct BlobInterestHandle {
    inner: Option<HandleInner>,
}

impl BlobInterestHandle {
    /// A handle expressing no interest.
    pub fn none() -> Self {
        BlobInterestHandle { inner: None }
    }

    /// Fast revalidation: return the blob if this handle still pins a live
    /// cache entry from the same generation.
    pub fn get_object(&self) -> Option<Arc<Blob>> {
        let inner = self.inner.as_ref()?;
        let cache = inner.cache.upgrade()?;
        let guard = cache.inner.lock().unwrap();
        let entry = guard.entries.get(&inner.id)?;
        if entry.generation == inner.generation {
            Some(Arc::clone(&entry.blob))
        } else {
            None
        }
    }

    /// Drop the interest now, leaving an empty handle behind.
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Some(cache) = inner.cache.upgrade() {
                cache.release(&inner.id, inner.generation);
            }
        }
    }

    pub fn is_none(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for BlobInterestHandle {
    fn drop(&mut self) {
        self.reset();
    }
}

impl fmt::Debug for BlobInterestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => write!(f, "BlobInterestHandle({})", inner.id),
            None => f.write_str("BlobInterestHandle(none)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(byte: u8, len: usize) -> Arc<Blob> {
        Arc::new(Blob::new(
            ObjectId::from_bytes(vec![byte]),
            vec![byte; len],
        ))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = BlobCache::new(1024);
        let b = blob(1, 10);
        let _handle = cache.insert(Arc::clone(&b), Interest::WantHandle);

        let lookup = cache.get(b.id(), Interest::WantHandle);
        assert_eq!(lookup.blob.as_deref(), Some(&*b));
        assert!(lookup.interest_handle.get_object().is_some());
    }

    #[test]
    fn test_unlikely_needed_issues_no_handle() {
        let cache = BlobCache::new(1024);
        let b = blob(1, 10);
        let handle = cache.insert(b, Interest::UnlikelyNeededAgain);
        assert!(handle.is_none());
        assert!(handle.get_object().is_none());
    }

    #[test]
    fn test_interest_pins_entry_over_budget() {
        let cache = BlobCache::new(16);
        let pinned = blob(1, 12);
        let handle = cache.insert(Arc::clone(&pinned), Interest::WantHandle);

        // Exceeds the budget, but the only other entry is pinned.
        let _ = cache.insert(blob(2, 12), Interest::UnlikelyNeededAgain);
        assert!(cache.contains(pinned.id()));

        drop(handle);
        // Releasing the pin lets the next churn evict the oldest entry.
        let _ = cache.insert(blob(3, 12), Interest::UnlikelyNeededAgain);
        assert!(!cache.contains(pinned.id()));
    }

    #[test]
    fn test_reset_releases_interest() {
        let cache = BlobCache::new(8);
        let b = blob(1, 6);
        let mut handle = cache.insert(Arc::clone(&b), Interest::WantHandle);
        handle.reset();
        assert!(handle.get_object().is_none());

        // Over budget now that nothing is pinned: the old entry goes.
        let _ = cache.insert(blob(2, 6), Interest::UnlikelyNeededAgain);
        assert!(!cache.contains(b.id()));
    }
}
