//! # hollow-overlay
//!
//! File-backed overlay storage for materialized inodes.
//!
//! One content file per inode, organized under a two-level fan-out so no
//! single directory grows unboundedly:
//!
//! ```text
//! <root>/
//! └── 1a/
//!     └── 26  # inode 0x261a's contents
//! ```
//!
//! Creation is atomic (temp file + rename), so a crash mid-materialization
//! leaves either no overlay file or a complete one, never a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tracing::instrument;

use hollow_inode::{InodeNumber, OverlayError, OverlayFileAccess};
use hollow_model::{Blob, Hash20};

/// Overlay store rooted at a directory inside the mount's state directory.
#[derive(Debug)]
pub struct FileOverlay {
    root: PathBuf,
}

impl FileOverlay {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, OverlayError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FileOverlay { root })
    }

    fn file_path(&self, ino: InodeNumber) -> PathBuf {
        // Low byte first: consecutive inode numbers spread across shards.
        let shard = format!("{:02x}", ino & 0xff);
        self.root.join(shard).join(format!("{:x}", ino))
    }

    fn open(&self, ino: InodeNumber) -> Result<File, OverlayError> {
        match File::open(self.file_path(ino)) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(OverlayError::MissingFile(ino))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn open_rw(&self, ino: InodeNumber) -> Result<File, OverlayError> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(ino))
        {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(OverlayError::MissingFile(ino))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write `contents` to the inode's path via a temp file and rename.
    fn write_atomic(&self, ino: InodeNumber, contents: &[u8]) -> Result<(), OverlayError> {
        let path = self.file_path(ino);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;

        if let Err(err) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

impl OverlayFileAccess for FileOverlay {
    #[instrument(skip(self, blob, _sha1), level = "debug")]
    fn create_file(
        &self,
        ino: InodeNumber,
        blob: &Blob,
        _sha1: Option<Hash20>,
    ) -> Result<(), OverlayError> {
        // The SHA-1 hint is accepted for interface parity but not persisted;
        // content hashes are recomputed from the file on demand.
        self.write_atomic(ino, blob.contents())
    }

    #[instrument(skip(self), level = "debug")]
    fn create_empty_file(&self, ino: InodeNumber) -> Result<(), OverlayError> {
        self.write_atomic(ino, &[])
    }

    fn truncate(&self, ino: InodeNumber, size: u64) -> Result<(), OverlayError> {
        let file = self.open_rw(ino)?;
        file.set_len(size)?;
        Ok(())
    }

    fn file_size(&self, ino: InodeNumber) -> Result<u64, OverlayError> {
        Ok(self.open(ino)?.metadata()?.len())
    }

    fn read(&self, ino: InodeNumber, size: u64, off: u64) -> Result<Vec<u8>, OverlayError> {
        let file = self.open(ino)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], off + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, ino: InodeNumber, data: &[u8], off: u64) -> Result<u64, OverlayError> {
        let file = self.open_rw(ino)?;
        file.write_all_at(data, off)?;
        Ok(data.len() as u64)
    }

    fn read_all(&self, ino: InodeNumber) -> Result<Vec<u8>, OverlayError> {
        let mut contents = Vec::new();
        self.open(ino)?.read_to_end(&mut contents)?;
        Ok(contents)
    }

    fn sha1(&self, ino: InodeNumber) -> Result<Hash20, OverlayError> {
        let mut file = self.open(ino)?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Hash20::from_bytes(hasher.finalize().into()))
    }

    fn fsync(&self, ino: InodeNumber, datasync: bool) -> Result<(), OverlayError> {
        let file = self.open(ino)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn fallocate(&self, ino: InodeNumber, off: u64, len: u64) -> Result<(), OverlayError> {
        // Space reservation is advisory here; extending the file is the
        // observable part of the contract.
        let file = self.open_rw(ino)?;
        let end = off + len;
        if file.metadata()?.len() < end {
            file.set_len(end)?;
        }
        Ok(())
    }

    fn remove(&self, ino: InodeNumber) -> Result<(), OverlayError> {
        match fs::remove_file(self.file_path(ino)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
