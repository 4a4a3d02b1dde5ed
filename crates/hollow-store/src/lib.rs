//! # hollow-store
//!
//! Store facades consumed by the inode layer.
//!
//! - [`LocalStore`]: the host-local key/value store, keyed per [`KeySpace`].
//! - [`ObjectStore`]: the source-control object store client.
//! - [`BlobCache`]: in-memory blob cache with interest-handle accounting.
//! - [`BlobAccess`]: single-flight loader in front of cache + object store.
//! - [`ProxyHash`]: the (path, revision) ⇄ object-id binding, with an
//!   embedded short form and a legacy stored form.

mod blob_access;
mod blob_cache;
mod error;
mod local_store;
mod object_store;
mod proxy;
pub mod testing;

pub use blob_access::BlobAccess;
pub use blob_cache::{BlobCache, BlobInterestHandle, CacheLookup, Interest};
pub use error::{Result, StoreError};
pub use local_store::{KeySpace, LocalStore, MemoryLocalStore, WriteBatch};
pub use object_store::ObjectStore;
pub use proxy::{ProxyHash, EMBEDDED_PROXY_TAG};
