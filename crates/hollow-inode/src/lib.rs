//! # hollow-inode
//!
//! The per-file inode core of hollowfs.
//!
//! Every file in a mounted working copy is represented by a [`FileInode`]
//! running a three-state automaton:
//!
//! ```text
//!                    start loading
//! NOT_LOADING ──────────────────────────▶ LOADING
//!      ▲                                     │
//!      │        load completes               │
//!      └─────────────────────────────────────┘
//!      │
//!      │ materialize / truncate
//!      ▼
//! MATERIALIZED   (terminal)
//! ```
//!
//! Non-materialized files answer reads from a lazily loaded blob; the first
//! write (or truncate, or metadata-with-size change) moves the authoritative
//! bytes into the local overlay, permanently. Kernel-channel adapters call
//! the operations on [`FileInode`]; everything else (directory tree, object
//! store, overlay storage) is reached through the traits in [`mount`] and
//! [`overlay`].

mod coverage;
mod error;
mod file;
mod metadata;
mod mount;
mod overlay;
mod state;
pub mod testing;

pub use coverage::CoverageSet;
pub use error::InodeError;
pub use file::{CacheHint, FileInode, XATTR_SHA1};
pub use metadata::{
    entry_type_from_mode, DesiredMetadata, EntryType, FileType, InodeMetadata, InodeStat,
    InodeTimestamps,
};
pub use mount::{
    Clock, FileAccess, FileParent, InodeNumber, Mount, RenameLock, RenameLockGuard,
    SystemClock, ROOT_INODE,
};
pub use overlay::{OverlayError, OverlayFileAccess};
