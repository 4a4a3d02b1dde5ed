use std::time::SystemTime;

use crate::mount::InodeNumber;

/// st_blocks always counts 512-byte units, independent of the block size
/// reported elsewhere.
const STAT_BLOCK_SIZE: u64 = 512;

/// The kind of filesystem object a [`FileInode`](crate::FileInode) backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Symlink,
}

impl FileType {
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::Regular => libc::S_IFREG as u32,
            FileType::Symlink => libc::S_IFLNK as u32,
        }
    }
}

/// Entry type as recorded in a source-control tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    RegularFile,
    ExecutableFile,
    Symlink,
}

/// Classify a mode the way tree entries do.
pub fn entry_type_from_mode(mode: u32) -> EntryType {
    if mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32 {
        EntryType::Symlink
    } else if mode & 0o111 != 0 {
        EntryType::ExecutableFile
    } else {
        EntryType::RegularFile
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeTimestamps {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl InodeTimestamps {
    pub fn all(at: SystemTime) -> Self {
        InodeTimestamps {
            atime: at,
            mtime: at,
            ctime: at,
        }
    }
}

/// Mutable per-inode metadata, guarded by the inode state lock.
#[derive(Debug, Clone)]
pub struct InodeMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub timestamps: InodeTimestamps,
}

impl InodeMetadata {
    pub fn apply_to_stat(&self, stat: &mut InodeStat) {
        stat.mode = self.mode;
        stat.uid = self.uid;
        stat.gid = self.gid;
        stat.atime = self.timestamps.atime;
        stat.mtime = self.timestamps.mtime;
        stat.ctime = self.timestamps.ctime;
    }

    /// Fold a setattr request in. ctime always advances; the file type bits
    /// of the mode are preserved.
    pub fn apply_desired(&mut self, desired: &DesiredMetadata, now: SystemTime) {
        if let Some(mode) = desired.mode {
            let fmt = libc::S_IFMT as u32;
            self.mode = (self.mode & fmt) | (mode & !fmt);
        }
        if let Some(uid) = desired.uid {
            self.uid = uid;
        }
        if let Some(gid) = desired.gid {
            self.gid = gid;
        }
        if let Some(atime) = desired.atime {
            self.timestamps.atime = atime;
        }
        if let Some(mtime) = desired.mtime {
            self.timestamps.mtime = mtime;
        }
        self.timestamps.ctime = now;
    }
}

/// A setattr request: only the populated fields change.
#[derive(Debug, Clone, Default)]
pub struct DesiredMetadata {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl DesiredMetadata {
    pub fn truncate(size: u64) -> Self {
        DesiredMetadata {
            size: Some(size),
            ..Default::default()
        }
    }

    pub fn is_truncate_to_zero(&self) -> bool {
        self.size == Some(0)
    }
}

/// The answer to a stat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStat {
    pub ino: InodeNumber,
    pub size: u64,
    pub blocks: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl InodeStat {
    pub fn update_block_count(&mut self) {
        self.blocks = self.size.div_ceil(STAT_BLOCK_SIZE);
    }
}
