//! # hollow-model
//!
//! Core value types shared by every hollowfs crate.
//!
//! - [`Hash20`]: fixed 20-byte content hash produced by the source control
//!   system.
//! - [`ObjectId`]: variable-length object identifier. Opaque to most of the
//!   system; only the proxy-hash codec knows its internal structure.
//! - [`Blob`]: the content-addressed byte sequence of a file at a revision.
//! - [`FetchContext`]: per-request attribution forwarded to telemetry.

mod blob;
mod fetch;
mod hash;

pub use blob::Blob;
pub use fetch::{FetchCause, FetchContext};
pub use hash::{Hash20, ObjectId, HASH20_RAW_SIZE};

use thiserror::Error;

/// Errors from parsing hashes and object ids.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid hash length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex string: {0:?}")]
    InvalidHex(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
