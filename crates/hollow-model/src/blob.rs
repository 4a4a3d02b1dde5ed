use crate::{Hash20, ObjectId};

/// The content-addressed byte sequence of a file at a particular revision.
///
/// Blobs are immutable once constructed and are shared between the cache,
/// in-flight loads and inode continuations behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    id: ObjectId,
    contents: Vec<u8>,
}

impl Blob {
    pub fn new(id: ObjectId, contents: impl Into<Vec<u8>>) -> Self {
        Blob {
            id,
            contents: contents.into(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    /// SHA-1 of the blob contents (not of the object id).
    pub fn content_sha1(&self) -> Hash20 {
        Hash20::sha1(&self.contents)
    }
}
