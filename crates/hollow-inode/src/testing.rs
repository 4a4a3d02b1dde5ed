//! In-process fixtures for exercising the inode core.
//!
//! [`TestMount`] wires a [`FakeObjectStore`] behind a real blob cache and
//! single-flight loader, an in-memory overlay, and counters for journal and
//! telemetry traffic, so tests can assert exactly what the state machine
//! did.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use hollow_model::{Blob, Hash20, ObjectId};
use hollow_store::testing::FakeObjectStore;
use hollow_store::{BlobAccess, BlobCache, ObjectStore};

use crate::file::FileInode;
use crate::metadata::{FileType, InodeStat};
use crate::mount::{
    Clock, FileAccess, FileParent, InodeNumber, Mount, RenameLock, RenameLockGuard,
    SystemClock,
};
use crate::overlay::{OverlayError, OverlayFileAccess};

/// Inode number handed to the administrative directory in tests.
pub const TEST_CONTROL_DIR_INO: InodeNumber = 17;

/// An [`OverlayFileAccess`] holding file contents in a map.
#[derive(Default)]
pub struct MemoryOverlay {
    files: Mutex<HashMap<InodeNumber, Vec<u8>>>,
}

impl MemoryOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.files.lock().unwrap().contains_key(&ino)
    }

    fn with_file<R>(
        &self,
        ino: InodeNumber,
        f: impl FnOnce(&mut Vec<u8>) -> R,
    ) -> Result<R, OverlayError> {
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&ino).ok_or(OverlayError::MissingFile(ino))?;
        Ok(f(file))
    }
}

impl OverlayFileAccess for MemoryOverlay {
    fn create_file(
        &self,
        ino: InodeNumber,
        blob: &Blob,
        _sha1: Option<Hash20>,
    ) -> Result<(), OverlayError> {
        self.files
            .lock()
            .unwrap()
            .insert(ino, blob.contents().to_vec());
        Ok(())
    }

    fn create_empty_file(&self, ino: InodeNumber) -> Result<(), OverlayError> {
        self.files.lock().unwrap().insert(ino, Vec::new());
        Ok(())
    }

    fn truncate(&self, ino: InodeNumber, size: u64) -> Result<(), OverlayError> {
        self.with_file(ino, |file| file.resize(size as usize, 0))
    }

    fn file_size(&self, ino: InodeNumber) -> Result<u64, OverlayError> {
        self.with_file(ino, |file| file.len() as u64)
    }

    fn read(&self, ino: InodeNumber, size: u64, off: u64) -> Result<Vec<u8>, OverlayError> {
        self.with_file(ino, |file| {
            let off = off as usize;
            if off >= file.len() {
                return Vec::new();
            }
            let end = (off + size as usize).min(file.len());
            file[off..end].to_vec()
        })
    }

    fn write(&self, ino: InodeNumber, data: &[u8], off: u64) -> Result<u64, OverlayError> {
        self.with_file(ino, |file| {
            let off = off as usize;
            if file.len() < off + data.len() {
                file.resize(off + data.len(), 0);
            }
            file[off..off + data.len()].copy_from_slice(data);
            data.len() as u64
        })
    }

    fn read_all(&self, ino: InodeNumber) -> Result<Vec<u8>, OverlayError> {
        self.with_file(ino, |file| file.clone())
    }

    fn sha1(&self, ino: InodeNumber) -> Result<Hash20, OverlayError> {
        self.with_file(ino, |file| Hash20::sha1(file))
    }

    fn fsync(&self, _ino: InodeNumber, _datasync: bool) -> Result<(), OverlayError> {
        Ok(())
    }

    fn fallocate(&self, ino: InodeNumber, off: u64, len: u64) -> Result<(), OverlayError> {
        self.with_file(ino, |file| {
            let end = (off + len) as usize;
            if file.len() < end {
                file.resize(end, 0);
            }
        })
    }

    fn remove(&self, ino: InodeNumber) -> Result<(), OverlayError> {
        self.files.lock().unwrap().remove(&ino);
        Ok(())
    }
}

/// A parent directory that records materialization notifications.
#[derive(Default)]
pub struct TestParent {
    materialized: Mutex<Vec<String>>,
}

impl TestParent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn materialized_children(&self) -> Vec<String> {
        self.materialized.lock().unwrap().clone()
    }
}

impl FileParent for TestParent {
    fn child_materialized(&self, _rename_lock: &RenameLockGuard<'_>, name: &str) {
        self.materialized.lock().unwrap().push(name.to_string());
    }
}

/// A fully wired in-process mount.
pub struct TestMount {
    path: std::path::PathBuf,
    fake_store: Arc<FakeObjectStore>,
    object_store: Arc<dyn ObjectStore>,
    blob_cache: Arc<BlobCache>,
    blob_access: Arc<BlobAccess>,
    overlay: MemoryOverlay,
    clock: SystemClock,
    rename_lock: RenameLock,
    journal: Mutex<Vec<InodeNumber>>,
    accesses: Mutex<Vec<FileAccess>>,
}

impl TestMount {
    pub fn new() -> Arc<Self> {
        let fake_store = Arc::new(FakeObjectStore::new());
        let object_store: Arc<dyn ObjectStore> = Arc::clone(&fake_store) as Arc<dyn ObjectStore>;
        let blob_cache = BlobCache::with_default_budget();
        let blob_access = BlobAccess::new(Arc::clone(&object_store), Arc::clone(&blob_cache));
        Arc::new(TestMount {
            path: std::path::PathBuf::from("/hollow-test-mount"),
            fake_store,
            object_store,
            blob_cache,
            blob_access,
            overlay: MemoryOverlay::new(),
            clock: SystemClock,
            rename_lock: RenameLock::new(),
            journal: Mutex::new(Vec::new()),
            accesses: Mutex::new(Vec::new()),
        })
    }

    pub fn fake_store(&self) -> &Arc<FakeObjectStore> {
        &self.fake_store
    }

    pub fn memory_overlay(&self) -> &MemoryOverlay {
        &self.overlay
    }

    pub fn journal_entries(&self) -> Vec<InodeNumber> {
        self.journal.lock().unwrap().clone()
    }

    pub fn logged_accesses(&self) -> usize {
        self.accesses.lock().unwrap().len()
    }

    /// Inject a blob and return its object id.
    pub fn put_blob(&self, contents: &[u8]) -> ObjectId {
        self.fake_store.add_blob_contents(contents.to_vec())
    }

    /// A regular file inode backed by `hash` (or freshly created when
    /// `None`), with a recording parent.
    pub fn new_regular_file(
        self: &Arc<Self>,
        ino: InodeNumber,
        hash: Option<ObjectId>,
    ) -> (Arc<FileInode>, Arc<TestParent>) {
        self.new_file(ino, FileType::Regular, 0o644, hash, 2)
    }

    pub fn new_file(
        self: &Arc<Self>,
        ino: InodeNumber,
        file_type: FileType,
        perms: u32,
        hash: Option<ObjectId>,
        parent_ino: InodeNumber,
    ) -> (Arc<FileInode>, Arc<TestParent>) {
        let parent = TestParent::new();
        let mount: Arc<dyn Mount> = Arc::clone(self) as Arc<dyn Mount>;
        let weak_parent: Weak<dyn FileParent> = Arc::downgrade(&parent) as Weak<dyn FileParent>;
        let inode = FileInode::new(
            mount,
            ino,
            weak_parent,
            parent_ino,
            format!("file{ino}"),
            file_type,
            perms,
            hash,
        );
        if inode.blob_hash().is_none() {
            // Freshly created files start materialized; give them their
            // (empty) overlay file the way the directory layer would.
            self.overlay.create_empty_file(ino).unwrap();
        }
        (inode, parent)
    }
}

impl Mount for TestMount {
    fn mount_path(&self) -> &std::path::Path {
        &self.path
    }

    fn acquire_rename_lock(&self) -> RenameLockGuard<'_> {
        self.rename_lock.acquire()
    }

    fn init_stat(&self) -> InodeStat {
        InodeStat {
            ino: 0,
            size: 0,
            blocks: 0,
            mode: 0,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
        }
    }

    fn overlay(&self) -> &dyn OverlayFileAccess {
        &self.overlay
    }

    fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    fn blob_cache(&self) -> &Arc<BlobCache> {
        &self.blob_cache
    }

    fn blob_access(&self) -> &Arc<BlobAccess> {
        &self.blob_access
    }

    fn clock(&self) -> &dyn Clock {
        &self.clock
    }

    fn control_dir_ino(&self) -> InodeNumber {
        TEST_CONTROL_DIR_INO
    }

    fn update_journal(&self, ino: InodeNumber) {
        self.journal.lock().unwrap().push(ino);
    }

    fn log_file_access(&self, access: FileAccess) {
        self.accesses.lock().unwrap().push(access);
    }
}
