use hollow_store::StoreError;
use thiserror::Error;

use crate::overlay::OverlayError;

/// Errors surfaced by inode operations.
///
/// Kernel-channel adapters map these to an errno via [`errno`](Self::errno).
#[derive(Error, Debug)]
pub enum InodeError {
    #[error("not a symlink")]
    NotASymlink,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("no such entry")]
    NoEntry,

    #[error("no such attribute")]
    NoAttribute,

    /// Object-store failures, including transient blob-fetch errors. The
    /// inode reverts to its pre-load state; callers may retry.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The overlay raised an I/O error. The state lock was released before
    /// this was surfaced.
    #[error(transparent)]
    Overlay(#[from] OverlayError),
}

impl InodeError {
    pub fn errno(&self) -> i32 {
        match self {
            InodeError::NotASymlink | InodeError::InvalidArgument(_) => libc::EINVAL,
            InodeError::PermissionDenied => libc::EPERM,
            InodeError::NoEntry => libc::ENOENT,
            InodeError::NoAttribute => libc::ENODATA,
            InodeError::Store(_) | InodeError::Overlay(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(InodeError::NotASymlink.errno(), libc::EINVAL);
        assert_eq!(InodeError::PermissionDenied.errno(), libc::EPERM);
        assert_eq!(InodeError::NoEntry.errno(), libc::ENOENT);
        assert_eq!(InodeError::NoAttribute.errno(), libc::ENODATA);
        let store_err: InodeError =
            StoreError::NotFound(hollow_model::ObjectId::from_bytes(vec![0])).into();
        assert_eq!(store_err.errno(), libc::EIO);
    }
}
