//! The inode state machine driving the real file-backed overlay: lazy
//! reads out of the object store, then materialization onto disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use hollow_inode::{
    Clock, DesiredMetadata, FileAccess, FileInode, FileParent, FileType, InodeNumber,
    InodeStat, Mount, OverlayFileAccess, RenameLock, RenameLockGuard, SystemClock,
};
use hollow_model::{FetchContext, Hash20, ObjectId};
use hollow_overlay::FileOverlay;
use hollow_store::testing::FakeObjectStore;
use hollow_store::{BlobAccess, BlobCache, ObjectStore};
use tempfile::TempDir;

struct DiskMount {
    path: PathBuf,
    fake_store: Arc<FakeObjectStore>,
    object_store: Arc<dyn ObjectStore>,
    blob_cache: Arc<BlobCache>,
    blob_access: Arc<BlobAccess>,
    overlay: FileOverlay,
    clock: SystemClock,
    rename_lock: RenameLock,
    journal: Mutex<Vec<InodeNumber>>,
}

impl DiskMount {
    fn new(state_dir: &Path) -> Arc<Self> {
        let fake_store = Arc::new(FakeObjectStore::new());
        let object_store: Arc<dyn ObjectStore> = Arc::clone(&fake_store) as Arc<dyn ObjectStore>;
        let blob_cache = BlobCache::with_default_budget();
        let blob_access = BlobAccess::new(Arc::clone(&object_store), Arc::clone(&blob_cache));
        Arc::new(DiskMount {
            path: PathBuf::from("/mnt/disk-test"),
            fake_store,
            object_store,
            blob_cache,
            blob_access,
            overlay: FileOverlay::new(state_dir.join("overlay")).unwrap(),
            clock: SystemClock,
            rename_lock: RenameLock::new(),
            journal: Mutex::new(Vec::new()),
        })
    }
}

impl Mount for DiskMount {
    fn mount_path(&self) -> &Path {
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
        u64::MAX
    }

    fn update_journal(&self, ino: InodeNumber) {
        self.journal.lock().unwrap().push(ino);
    }

    fn log_file_access(&self, _access: FileAccess) {}
}

struct NullParent;

impl FileParent for NullParent {
    fn child_materialized(&self, _rename_lock: &RenameLockGuard<'_>, _name: &str) {}
}

fn new_inode(mount: &Arc<DiskMount>, ino: InodeNumber, id: ObjectId) -> Arc<FileInode> {
    let parent = Arc::new(NullParent);
    let weak: Weak<dyn FileParent> = Arc::downgrade(&parent) as Weak<dyn FileParent>;
    let mount: Arc<dyn Mount> = Arc::clone(mount) as Arc<dyn Mount>;
    // The parent is dropped immediately; materialization must tolerate that.
    FileInode::new(
        mount,
        ino,
        weak,
        2,
        "f",
        FileType::Regular,
        0o644,
        Some(id),
    )
}

#[tokio::test]
async fn test_write_lands_in_overlay_files() {
    let dir = TempDir::new().unwrap();
    let mount = DiskMount::new(dir.path());
    let id = mount.fake_store.add_blob_contents(b"original".to_vec());
    let inode = new_inode(&mount, 5, id);

    // Lazy read straight from the store.
    let (data, _) = inode.read(4096, 0, &FetchContext::fs()).await.unwrap();
    assert_eq!(data, b"original");
    assert!(!inode.is_materialized());

    // The first write moves the bytes onto disk.
    inode.write(b"edited!!", 0, &FetchContext::fs()).await.unwrap();
    assert!(inode.is_materialized());
    assert_eq!(mount.overlay.read_all(5).unwrap(), b"edited!!");

    // Reads now come from the overlay file.
    let (data, _) = inode.read(4096, 0, &FetchContext::fs()).await.unwrap();
    assert_eq!(data, b"edited!!");
    assert_eq!(inode.sha1(&FetchContext::fs()).await.unwrap(), Hash20::sha1(b"edited!!"));
}

#[tokio::test]
async fn test_truncate_creates_empty_overlay_file() {
    let dir = TempDir::new().unwrap();
    let mount = DiskMount::new(dir.path());
    let id = mount.fake_store.add_blob_contents(b"doomed contents".to_vec());
    let inode = new_inode(&mount, 6, id.clone());

    let stat = inode
        .setattr(DesiredMetadata::truncate(0), &FetchContext::fs())
        .await
        .unwrap();
    assert_eq!(stat.size, 0);
    assert_eq!(mount.overlay.file_size(6).unwrap(), 0);
    // The blob was never fetched.
    assert_eq!(mount.fake_store.blob_access_count(&id), 0);
}

#[tokio::test]
async fn test_survives_reopen_of_overlay_directory() {
    let dir = TempDir::new().unwrap();
    let mount = DiskMount::new(dir.path());
    let id = mount.fake_store.add_blob_contents(b"persist me".to_vec());
    let inode = new_inode(&mount, 7, id);
    inode.write(b"persisted", 0, &FetchContext::fs()).await.unwrap();
    drop(inode);
    drop(mount);

    // A second overlay over the same directory sees the same file, the way
    // a restarted daemon would.
    let reopened = FileOverlay::new(dir.path().join("overlay")).unwrap();
    assert_eq!(reopened.read_all(7).unwrap(), b"persisted");
}
