use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{ModelError, Result};

/// Raw size of a [`Hash20`] in bytes.
pub const HASH20_RAW_SIZE: usize = 20;

/// A fixed 20-byte content hash, as produced by the source control system.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash20([u8; HASH20_RAW_SIZE]);

impl Hash20 {
    /// The all-zero hash, used as a placeholder identity.
    pub const ZERO: Hash20 = Hash20([0u8; HASH20_RAW_SIZE]);

    pub const fn from_bytes(bytes: [u8; HASH20_RAW_SIZE]) -> Self {
        Hash20(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; HASH20_RAW_SIZE] =
            bytes.try_into().map_err(|_| ModelError::InvalidLength {
                expected: HASH20_RAW_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Hash20(arr))
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes = decode_hex(hex)?;
        Self::from_slice(&bytes)
    }

    /// SHA-1 digest of the given bytes.
    pub fn sha1(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Hash20(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; HASH20_RAW_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl fmt::Display for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash20({})", self.to_hex())
    }
}

/// A variable-length object identifier.
///
/// The rest of the system treats the contents as opaque bytes; only the
/// proxy-hash codec in `hollow-store` assigns structure to them.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(Vec<u8>);

impl ObjectId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ObjectId(bytes.into())
    }

    /// An object id equal to the SHA-1 of the given bytes.
    pub fn sha1(data: &[u8]) -> Self {
        ObjectId(Hash20::sha1(data).as_bytes().to_vec())
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        Ok(ObjectId(decode_hex(hex)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl From<Hash20> for ObjectId {
    fn from(hash: Hash20) -> Self {
        ObjectId(hash.as_bytes().to_vec())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(ModelError::InvalidHex(hex.to_string()));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|chunk| {
            let s = std::str::from_utf8(chunk)
                .map_err(|_| ModelError::InvalidHex(hex.to_string()))?;
            u8::from_str_radix(s, 16).map_err(|_| ModelError::InvalidHex(hex.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash20_hex_round_trip() {
        let hash = Hash20::sha1(b"hello");
        let parsed = Hash20::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_sha1_known_value() {
        // sha1("hello")
        let hash = Hash20::sha1(b"hello");
        assert_eq!(hash.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        let err = Hash20::from_slice(&[0u8; 19]).unwrap_err();
        assert_eq!(
            err,
            ModelError::InvalidLength {
                expected: 20,
                actual: 19
            }
        );
    }

    #[test]
    fn test_object_id_from_hash() {
        let hash = Hash20::sha1(b"x");
        let id = ObjectId::from(hash);
        assert_eq!(id.len(), HASH20_RAW_SIZE);
        assert_eq!(id.as_bytes(), hash.as_bytes());
    }

    #[test]
    fn test_bad_hex() {
        assert!(Hash20::from_hex("zz").is_err());
        assert!(ObjectId::from_hex("abc").is_err());
    }
}
