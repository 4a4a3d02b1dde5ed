use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use hollow_model::FetchCause;
use hollow_store::{BlobAccess, BlobCache, ObjectStore};

use crate::metadata::InodeStat;
use crate::overlay::OverlayFileAccess;

/// Per-mount inode number. The root directory is always [`ROOT_INODE`].
pub type InodeNumber = u64;

pub const ROOT_INODE: InodeNumber = 1;

/// The mount-wide rename lock.
///
/// Directory structure changes (and parent materialization notifications)
/// serialize on this lock. It is always acquired *after* any inode state
/// lock has been released, never while one is held.
#[derive(Debug, Default)]
pub struct RenameLock(Mutex<()>);

impl RenameLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> RenameLockGuard<'_> {
        RenameLockGuard(self.0.lock().unwrap())
    }
}

/// Proof of holding the mount rename lock.
pub struct RenameLockGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

/// Wall-clock source for timestamp updates.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A telemetry record for one data access on a file.
#[derive(Debug, Clone)]
pub struct FileAccess {
    pub ino: InodeNumber,
    pub cause: FetchCause,
    pub detail: Option<String>,
}

/// The directory-inode side of parent/child bookkeeping.
///
/// Inodes hold only a weak back reference to their parent; the directory
/// tree owns inodes, not the other way around.
pub trait FileParent: Send + Sync {
    /// Record that the named child's authoritative bytes now live in the
    /// overlay. Called with the mount rename lock held.
    fn child_materialized(&self, rename_lock: &RenameLockGuard<'_>, name: &str);
}

/// What a file inode needs from the mount that owns it.
pub trait Mount: Send + Sync {
    /// Absolute path of the mount point.
    fn mount_path(&self) -> &Path;

    fn acquire_rename_lock(&self) -> RenameLockGuard<'_>;

    /// A stat template with mount-wide fields (uid/gid defaults) filled in.
    fn init_stat(&self) -> InodeStat;

    fn overlay(&self) -> &dyn OverlayFileAccess;

    fn object_store(&self) -> &Arc<dyn ObjectStore>;

    fn blob_cache(&self) -> &Arc<BlobCache>;

    fn blob_access(&self) -> &Arc<BlobAccess>;

    fn clock(&self) -> &dyn Clock;

    /// Inode number of the synthetic administrative directory. Entries
    /// under it reject attribute changes.
    fn control_dir_ino(&self) -> InodeNumber;

    /// Record a working-copy change for journal subscribers.
    fn update_journal(&self, ino: InodeNumber);

    /// Forward one access record to the telemetry sink.
    fn log_file_access(&self, access: FileAccess);
}
