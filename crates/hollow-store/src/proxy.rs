use std::cmp::Ordering;
use std::fmt;

use hollow_model::{Hash20, ObjectId, HASH20_RAW_SIZE};
use tracing::error;

use crate::{KeySpace, LocalStore, Result, StoreError, WriteBatch};

/// Tag byte marking the embedded (path-less) proxy-hash form.
pub const EMBEDDED_PROXY_TAG: u8 = 0x01;

const LENGTH_PREFIX_SIZE: usize = 4;
const MIN_LEGACY_SIZE: usize = HASH20_RAW_SIZE + LENGTH_PREFIX_SIZE;

/// SHA-1 of the serialized empty proxy hash, `(Hash20::ZERO, "")`.
/// Asserted in tests.
const EMPTY_PROXY_SHA1_HEX: &str = "d3399b7262fb56cb9ed053d68db9291c410839c4";

/// The binding of a repository path and a source-control revision hash,
/// addressable by a compact object id.
///
/// Two wire shapes exist:
///
/// - *Embedded*: object id = one tag byte ([`EMBEDDED_PROXY_TAG`]) followed
///   by the 20-byte revision hash. Path is empty and no store lookup is
///   needed.
/// - *Legacy*: the tuple `rev_hash || be32(path_len) || path_bytes` lives in
///   the local store, keyed by the SHA-1 of those bytes; that SHA-1 is the
///   object id.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ProxyHash {
    /// Serialized `(rev_hash, path)` tuple, or empty for the default value.
    value: Vec<u8>,
}

impl ProxyHash {
    pub fn new(path: &str, rev_hash: Hash20) -> Self {
        ProxyHash {
            value: Self::serialize(path, rev_hash),
        }
    }

    /// Object id for the embedded, path-less form.
    pub fn embedded_id(rev_hash: Hash20) -> ObjectId {
        let mut bytes = Vec::with_capacity(HASH20_RAW_SIZE + 1);
        bytes.push(EMBEDDED_PROXY_TAG);
        bytes.extend_from_slice(rev_hash.as_bytes());
        ObjectId::from_bytes(bytes)
    }

    /// Compute the legacy object id and the bytes to persist under it.
    pub fn prepare_to_store(path: &str, rev_hash: Hash20) -> (ObjectId, Vec<u8>) {
        let buf = Self::serialize(path, rev_hash);
        let id = ObjectId::sha1(&buf);
        (id, buf)
    }

    /// Produce the object id for `(path, rev_hash)`.
    ///
    /// With a write batch, the legacy tuple is queued for persistence and
    /// its SHA-1 returned. Without one, the self-describing embedded form is
    /// returned and nothing needs to be written.
    pub fn store(path: &str, rev_hash: Hash20, batch: Option<&mut WriteBatch>) -> ObjectId {
        match batch {
            None => Self::embedded_id(rev_hash),
            Some(batch) => {
                let (id, buf) = Self::prepare_to_store(path, rev_hash);
                batch.put(KeySpace::ProxyHash, id.clone(), buf);
                id
            }
        }
    }

    /// Attempt the embedded shape. Returns `Ok(None)` for ids short enough
    /// to be legacy SHA-1 keys; ids longer than a bare hash that are not the
    /// embedded form are malformed.
    pub fn try_parse_embedded(id: &ObjectId) -> Result<Option<ProxyHash>> {
        if id.len() <= HASH20_RAW_SIZE {
            return Ok(None);
        }
        let bytes = id.as_bytes();
        if id.len() == HASH20_RAW_SIZE + 1 && bytes[0] == EMBEDDED_PROXY_TAG {
            let rev = Hash20::from_slice(&bytes[1..]).expect("length checked above");
            Ok(Some(ProxyHash::new("", rev)))
        } else {
            Err(StoreError::MalformedProxyHash {
                id: id.clone(),
                reason: format!("unknown type: size {}, tag {:#04x}", id.len(), bytes[0]),
            })
        }
    }

    /// Resolve an object id to its proxy hash, consulting the local store
    /// for the legacy form.
    pub async fn load(
        store: &dyn LocalStore,
        id: &ObjectId,
        context: &str,
    ) -> Result<ProxyHash> {
        if let Some(embedded) = Self::try_parse_embedded(id)? {
            return Ok(embedded);
        }
        match store.get(KeySpace::ProxyHash, id).await? {
            Some(value) => Self::from_stored(id, value),
            None => {
                error!(id = %id, context, "received unknown proxy hash");
                Err(StoreError::UnknownProxyHash(id.clone()))
            }
        }
    }

    /// Resolve many ids with a single batch lookup for the non-embedded
    /// remainder. No ordering guarantee; callers re-associate by id.
    pub async fn get_batch(
        store: &dyn LocalStore,
        ids: &[ObjectId],
    ) -> Result<Vec<ProxyHash>> {
        let mut results = Vec::with_capacity(ids.len());
        let mut legacy_ids = Vec::new();
        for id in ids {
            match Self::try_parse_embedded(id)? {
                Some(embedded) => results.push(embedded),
                None => legacy_ids.push(id.clone()),
            }
        }
        if legacy_ids.is_empty() {
            return Ok(results);
        }

        let stored = store.get_batch(KeySpace::ProxyHash, &legacy_ids).await?;
        for (id, value) in legacy_ids.iter().zip(stored) {
            match value {
                Some(value) => results.push(Self::from_stored(id, value)?),
                None => {
                    error!(id = %id, "batch lookup returned no proxy hash entry");
                    return Err(StoreError::UnknownProxyHash(id.clone()));
                }
            }
        }
        Ok(results)
    }

    pub fn path(&self) -> &str {
        if self.value.is_empty() {
            ""
        } else {
            // Validated UTF-8 at construction or load time.
            std::str::from_utf8(&self.value[MIN_LEGACY_SIZE..])
                .expect("proxy hash path was validated")
        }
    }

    pub fn rev_hash(&self) -> Hash20 {
        if self.value.is_empty() {
            Hash20::ZERO
        } else {
            Hash20::from_slice(&self.value[..HASH20_RAW_SIZE])
                .expect("proxy hash value was validated")
        }
    }

    /// SHA-1 of the serialized tuple; the legacy object id of this value.
    pub fn sha1(&self) -> ObjectId {
        if self.value.is_empty() {
            ObjectId::from_hex(EMPTY_PROXY_SHA1_HEX).expect("constant is valid hex")
        } else {
            ObjectId::sha1(&self.value)
        }
    }

    fn from_stored(id: &ObjectId, value: Vec<u8>) -> Result<ProxyHash> {
        Self::validate(id, &value)?;
        Ok(ProxyHash { value })
    }

    /// The serialized tuple: `rev_hash || be32(path_len) || path_bytes`.
    fn serialize(path: &str, rev_hash: Hash20) -> Vec<u8> {
        let path_len =
            u32::try_from(path.len()).expect("repository path exceeds u32::MAX bytes");
        let mut buf = Vec::with_capacity(MIN_LEGACY_SIZE + path.len());
        buf.extend_from_slice(rev_hash.as_bytes());
        buf.extend_from_slice(&path_len.to_be_bytes());
        buf.extend_from_slice(path.as_bytes());
        buf
    }

    fn validate(id: &ObjectId, value: &[u8]) -> Result<()> {
        if value.len() < MIN_LEGACY_SIZE {
            return Err(StoreError::MalformedProxyHash {
                id: id.clone(),
                reason: format!("stored entry too short ({} bytes)", value.len()),
            });
        }
        let declared = u32::from_be_bytes(
            value[HASH20_RAW_SIZE..MIN_LEGACY_SIZE]
                .try_into()
                .expect("slice is 4 bytes"),
        ) as usize;
        let actual = value.len() - MIN_LEGACY_SIZE;
        if declared != actual {
            return Err(StoreError::MalformedProxyHash {
                id: id.clone(),
                reason: format!(
                    "inconsistent path length: declared {declared}, got {actual}"
                ),
            });
        }
        if std::str::from_utf8(&value[MIN_LEGACY_SIZE..]).is_err() {
            return Err(StoreError::MalformedProxyHash {
                id: id.clone(),
                reason: "path is not valid UTF-8".to_string(),
            });
        }
        Ok(())
    }
}

impl PartialOrd for ProxyHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProxyHash {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl fmt::Debug for ProxyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProxyHash(path={:?}, rev={})",
            self.path(),
            self.rev_hash()
        )
    }
}
