//! # hollow-takeover
//!
//! Graceful handoff of live mounts between two daemon processes.
//!
//! An outgoing daemon transfers its whole serving state to its successor
//! over a local unix socket: every mount descriptor, the daemon lock file,
//! the admin socket, and — as SCM_RIGHTS ancillary data — each mount's live
//! kernel channel descriptor. The kernel never notices the swap.
//!
//! Two wire dialects exist for the message body. The *custom* dialect
//! (protocol version 1) is hand-rolled big-endian framing; the *compact*
//! dialect (versions 3 and 4) is a version word followed by a
//! serde-serialized record. Version 2 was burned by a historical wire
//! accident and is never reassigned.

mod capabilities;
mod data;
pub mod handoff;
mod socket;

pub use capabilities::{
    capabilities_to_version, compute_compatible_version, version_to_capabilities,
    COMPACT_SERIALIZATION, CUSTOM_SERIALIZATION, FUSE, PING, SUPPORTED_VERSIONS,
    VERSION_FOUR, VERSION_NEVER_SUPPORTED, VERSION_ONE, VERSION_THREE,
};
pub use data::{
    KernelConnInfo, MountHandoff, TakeoverData, MESSAGE_TYPE_ERROR, MESSAGE_TYPE_MOUNTS,
    MESSAGE_TYPE_PING,
};
pub use socket::{SocketMessage, UnixSocket};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TakeoverError {
    #[error("unsupported takeover version: {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported capability combination: {0:#x}")]
    UnsupportedCapabilities(u64),

    #[error("no takeover version supported by both daemons")]
    NoCompatibleVersion,

    #[error("malformed takeover message: {0}")]
    Malformed(String),

    /// The peer reported a failure instead of mounts.
    #[error("{class}: {message}")]
    Peer { class: String, message: String },

    #[error("received {mounts} mounts but {fds} descriptors (lock file and admin socket included)")]
    FdCountMismatch { mounts: usize, fds: usize },

    #[error("descriptor missing for {0}")]
    MissingFd(&'static str),

    #[error("serialization failed: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for TakeoverError {
    fn from(errno: nix::errno::Errno) -> Self {
        TakeoverError::Io(std::io::Error::from(errno))
    }
}

impl From<bincode::Error> for TakeoverError {
    fn from(err: bincode::Error) -> Self {
        TakeoverError::Encode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TakeoverError>;
