//! Protocol versions and their capability sets.
//!
//! Peers negotiate by version number (small integers on the wire, kept for
//! compatibility); everything behind the handshake works in terms of the
//! capability bits a version implies.

use crate::{Result, TakeoverError};

/// Body framing is the hand-rolled big-endian dialect.
pub const CUSTOM_SERIALIZATION: u64 = 1 << 0;
/// Body framing is a version word plus a serde-serialized record.
pub const COMPACT_SERIALIZATION: u64 = 1 << 1;
/// Mounts carry a FUSE kernel channel descriptor.
pub const FUSE: u64 = 1 << 2;
/// The sender may probe liveness with ping messages before committing.
pub const PING: u64 = 1 << 3;

/// Reserved for the no-common-capability error path.
pub const VERSION_NEVER_SUPPORTED: u32 = 0;
pub const VERSION_ONE: u32 = 1;
// There is no version 2: the version-1 wire used the values 1 and 2 as
// message types, so 2 can never be distinguished from a MOUNTS header.
// Do not reassign it.
pub const VERSION_THREE: u32 = 3;
pub const VERSION_FOUR: u32 = 4;

pub const SUPPORTED_VERSIONS: [u32; 3] = [VERSION_ONE, VERSION_THREE, VERSION_FOUR];

/// Pick the best version both sides speak: the maximum of the intersection.
pub fn compute_compatible_version(offered: &[u32], supported: &[u32]) -> Option<u32> {
    offered
        .iter()
        .filter(|version| supported.contains(version))
        .max()
        .copied()
}

pub fn version_to_capabilities(version: u32) -> Result<u64> {
    match version {
        VERSION_NEVER_SUPPORTED => Ok(0),
        VERSION_ONE => Ok(CUSTOM_SERIALIZATION | FUSE),
        VERSION_THREE => Ok(FUSE | COMPACT_SERIALIZATION),
        VERSION_FOUR => Ok(FUSE | COMPACT_SERIALIZATION | PING),
        other => Err(TakeoverError::UnsupportedVersion(other)),
    }
}

pub fn capabilities_to_version(capabilities: u64) -> Result<u32> {
    if capabilities == 0 {
        return Ok(VERSION_NEVER_SUPPORTED);
    }
    if capabilities == CUSTOM_SERIALIZATION | FUSE {
        return Ok(VERSION_ONE);
    }
    if capabilities == FUSE | COMPACT_SERIALIZATION {
        return Ok(VERSION_THREE);
    }
    if capabilities == FUSE | COMPACT_SERIALIZATION | PING {
        return Ok(VERSION_FOUR);
    }
    Err(TakeoverError::UnsupportedCapabilities(capabilities))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_picks_maximum_common() {
        assert_eq!(
            compute_compatible_version(&[1, 3, 4], &SUPPORTED_VERSIONS),
            Some(4)
        );
        assert_eq!(
            compute_compatible_version(&[1, 3], &SUPPORTED_VERSIONS),
            Some(3)
        );
        assert_eq!(
            compute_compatible_version(&[1], &SUPPORTED_VERSIONS),
            Some(1)
        );
        assert_eq!(compute_compatible_version(&[], &SUPPORTED_VERSIONS), None);
        assert_eq!(
            compute_compatible_version(&[7, 9], &SUPPORTED_VERSIONS),
            None
        );
    }

    #[test]
    fn test_version_two_gap_is_preserved() {
        // The gap is intentional; 2 must never negotiate.
        assert!(!SUPPORTED_VERSIONS.contains(&2));
        assert_eq!(compute_compatible_version(&[2], &SUPPORTED_VERSIONS), None);
        assert!(version_to_capabilities(2).is_err());
    }

    #[test]
    fn test_version_capability_round_trip() {
        for version in SUPPORTED_VERSIONS {
            let caps = version_to_capabilities(version).unwrap();
            assert_eq!(capabilities_to_version(caps).unwrap(), version);
        }
        assert_eq!(version_to_capabilities(VERSION_NEVER_SUPPORTED).unwrap(), 0);
        assert_eq!(
            capabilities_to_version(0).unwrap(),
            VERSION_NEVER_SUPPORTED
        );
    }

    #[test]
    fn test_unknown_capability_combination_is_rejected() {
        assert!(capabilities_to_version(CUSTOM_SERIALIZATION | PING).is_err());
    }
}
