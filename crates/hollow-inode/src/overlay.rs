use hollow_model::{Blob, Hash20};
use thiserror::Error;

use crate::mount::InodeNumber;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("no overlay file for inode {0}")]
    MissingFile(InodeNumber),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The per-mount store holding materialized file contents.
///
/// The inode core drives this interface; it never touches overlay storage
/// directly. All calls are synchronous local I/O — the only suspension
/// point in a file operation is the blob load, never the overlay.
pub trait OverlayFileAccess: Send + Sync {
    /// Create the overlay file for `ino` from blob contents. The SHA-1 is a
    /// hint that may be recorded to serve later content-hash queries.
    fn create_file(
        &self,
        ino: InodeNumber,
        blob: &Blob,
        sha1: Option<Hash20>,
    ) -> Result<(), OverlayError>;

    fn create_empty_file(&self, ino: InodeNumber) -> Result<(), OverlayError>;

    fn truncate(&self, ino: InodeNumber, size: u64) -> Result<(), OverlayError>;

    fn file_size(&self, ino: InodeNumber) -> Result<u64, OverlayError>;

    /// Read up to `size` bytes at `off`. Short reads mean EOF.
    fn read(&self, ino: InodeNumber, size: u64, off: u64) -> Result<Vec<u8>, OverlayError>;

    /// Write at `off`, extending the file as needed. Returns bytes written.
    fn write(&self, ino: InodeNumber, data: &[u8], off: u64) -> Result<u64, OverlayError>;

    fn read_all(&self, ino: InodeNumber) -> Result<Vec<u8>, OverlayError>;

    /// SHA-1 of the current file contents.
    fn sha1(&self, ino: InodeNumber) -> Result<Hash20, OverlayError>;

    fn fsync(&self, ino: InodeNumber, datasync: bool) -> Result<(), OverlayError>;

    /// Reserve space for `[off, off + len)`.
    fn fallocate(&self, ino: InodeNumber, off: u64, len: u64) -> Result<(), OverlayError>;

    /// Remove the overlay file once the inode is unlinked and forgotten.
    fn remove(&self, ino: InodeNumber) -> Result<(), OverlayError>;
}
