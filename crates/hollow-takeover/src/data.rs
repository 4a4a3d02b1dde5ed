//! The takeover message codec.
//!
//! Every body starts with a 32-bit big-endian word. In the custom dialect
//! it is the message type; in the compact dialect it is the advertised
//! protocol version, followed by a serde-serialized record. Kernel channel
//! descriptors never appear in the body — they ride as ancillary data on
//! the carrying socket message, strictly ordered: lock file, admin socket,
//! then one per mount.

use std::os::fd::OwnedFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capabilities::{
    capabilities_to_version, version_to_capabilities, COMPACT_SERIALIZATION,
    CUSTOM_SERIALIZATION, VERSION_FOUR, VERSION_ONE, VERSION_THREE,
};
use crate::socket::SocketMessage;
use crate::{Result, TakeoverError};

pub const MESSAGE_TYPE_ERROR: u32 = 1;
pub const MESSAGE_TYPE_MOUNTS: u32 = 2;
pub const MESSAGE_TYPE_PING: u32 = 3;

const HEADER_LENGTH: usize = 4;

/// Kernel channel initialization state, copied verbatim to the successor.
///
/// Sender and receiver run on the same host, so this crosses the wire as a
/// native-endian blob rather than a re-encoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelConnInfo {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
}

impl KernelConnInfo {
    pub const WIRE_SIZE: usize = 28;

    pub fn to_ne_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut bytes = [0u8; Self::WIRE_SIZE];
        bytes[0..4].copy_from_slice(&self.major.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.minor.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.max_readahead.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.flags.to_ne_bytes());
        bytes[16..18].copy_from_slice(&self.max_background.to_ne_bytes());
        bytes[18..20].copy_from_slice(&self.congestion_threshold.to_ne_bytes());
        bytes[20..24].copy_from_slice(&self.max_write.to_ne_bytes());
        bytes[24..28].copy_from_slice(&self.time_gran.to_ne_bytes());
        bytes
    }

    pub fn from_ne_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIRE_SIZE {
            return Err(TakeoverError::Malformed(format!(
                "kernel conn info must be {} bytes, got {}",
                Self::WIRE_SIZE,
                bytes.len()
            )));
        }
        let u32_at = |at: usize| u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap());
        let u16_at = |at: usize| u16::from_ne_bytes(bytes[at..at + 2].try_into().unwrap());
        Ok(KernelConnInfo {
            major: u32_at(0),
            minor: u32_at(4),
            max_readahead: u32_at(8),
            flags: u32_at(12),
            max_background: u16_at(16),
            congestion_threshold: u16_at(18),
            max_write: u32_at(20),
            time_gran: u32_at(24),
        })
    }
}

/// One live mount being handed over.
#[derive(Debug)]
pub struct MountHandoff {
    pub mount_path: PathBuf,
    pub state_directory: PathBuf,
    pub bind_mounts: Vec<PathBuf>,
    pub conn_info: KernelConnInfo,
    /// Serialized inode-table snapshot, produced and consumed by an
    /// external serializer; pass-through bytes here.
    pub inode_map: Vec<u8>,
    /// The live kernel channel. Travels as ancillary data, not body bytes.
    pub channel_fd: Option<OwnedFd>,
}

/// Everything an outgoing daemon transfers to its successor.
#[derive(Debug, Default)]
pub struct TakeoverData {
    pub lock_file: Option<OwnedFd>,
    pub admin_socket: Option<OwnedFd>,
    pub mount_points: Vec<MountHandoff>,
}

/// The compact-dialect record. Paths are raw bytes: mount paths are not
/// required to be UTF-8.
#[derive(Serialize, Deserialize)]
enum CompactBody {
    Mounts(Vec<CompactMount>),
    Error(String),
}

#[derive(Serialize, Deserialize)]
struct CompactMount {
    mount_path: Vec<u8>,
    state_directory: Vec<u8>,
    bind_mounts: Vec<Vec<u8>>,
    conn_info: Vec<u8>,
    inode_map: Vec<u8>,
}

impl TakeoverData {
    /// Serialize into a ready-to-send socket message, attaching descriptors
    /// in wire order: lock file, admin socket, then one per mount.
    pub fn serialize_message(mut self, capabilities: u64) -> Result<SocketMessage> {
        let data = self.serialize_body(capabilities)?;
        let mut files = Vec::with_capacity(2 + self.mount_points.len());
        files.push(
            self.lock_file
                .take()
                .ok_or(TakeoverError::MissingFd("lock file"))?,
        );
        files.push(
            self.admin_socket
                .take()
                .ok_or(TakeoverError::MissingFd("admin socket"))?,
        );
        for mount in &mut self.mount_points {
            files.push(
                mount
                    .channel_fd
                    .take()
                    .ok_or(TakeoverError::MissingFd("kernel channel"))?,
            );
        }
        Ok(SocketMessage { data, files })
    }

    /// Receive side of [`serialize_message`](Self::serialize_message):
    /// decode the body and reattach descriptors positionally. A count
    /// mismatch means the transfer cannot be trusted at all.
    pub fn deserialize_message(msg: SocketMessage) -> Result<TakeoverData> {
        let (version, body_offset) = Self::probe_version(&msg.data)?;
        let capabilities = version_to_capabilities(version)?;
        let mut data = Self::deserialize_body(capabilities, &msg.data[body_offset..])?;

        let expected_fds = data.mount_points.len() + 2;
        if msg.files.len() != expected_fds {
            return Err(TakeoverError::FdCountMismatch {
                mounts: data.mount_points.len(),
                fds: msg.files.len(),
            });
        }
        let mut files = msg.files.into_iter();
        data.lock_file = files.next();
        data.admin_socket = files.next();
        for mount in data.mount_points.iter_mut() {
            mount.channel_fd = files.next();
        }
        Ok(data)
    }

    /// Classify the leading word without consuming anything.
    ///
    /// Returns the protocol version and how many body bytes the probe
    /// accounts for (the version word of the compact dialect; nothing for
    /// the custom dialect, whose decoder needs the message type back).
    ///
    /// Callers must check [`is_ping`](Self::is_ping) first: a ping body is
    /// indistinguishable from a version-3 header by its leading word alone.
    pub fn probe_version(body: &[u8]) -> Result<(u32, usize)> {
        let word = read_header(body)?;
        match word {
            MESSAGE_TYPE_ERROR | MESSAGE_TYPE_MOUNTS => Ok((VERSION_ONE, 0)),
            VERSION_THREE | VERSION_FOUR => Ok((word, HEADER_LENGTH)),
            other => Err(TakeoverError::Malformed(format!(
                "unrecognized takeover header {other:#x}"
            ))),
        }
    }

    pub fn serialize_body(&self, capabilities: u64) -> Result<Vec<u8>> {
        match capabilities & (CUSTOM_SERIALIZATION | COMPACT_SERIALIZATION) {
            CUSTOM_SERIALIZATION => Ok(self.serialize_custom()),
            COMPACT_SERIALIZATION => self.serialize_compact(capabilities),
            _ => Err(TakeoverError::UnsupportedCapabilities(capabilities)),
        }
    }

    /// Serialize a failure report. Capability 0 (never-supported) is
    /// allowed here so a version mismatch can still be answered instead of
    /// crashing the outgoing daemon.
    pub fn serialize_error_body(
        capabilities: u64,
        class: &str,
        message: &str,
    ) -> Result<Vec<u8>> {
        let method = capabilities & (CUSTOM_SERIALIZATION | COMPACT_SERIALIZATION);
        if method == CUSTOM_SERIALIZATION || capabilities == 0 {
            let mut w = WireWriter::new();
            w.write_u32(MESSAGE_TYPE_ERROR);
            w.write_len_prefixed(class.as_bytes());
            w.write_len_prefixed(message.as_bytes());
            Ok(w.into_bytes())
        } else if method == COMPACT_SERIALIZATION {
            let mut body = Vec::new();
            body.extend_from_slice(&VERSION_THREE.to_be_bytes());
            let record = CompactBody::Error(format!("{class}: {message}"));
            body.extend_from_slice(&bincode::serialize(&record)?);
            Ok(body)
        } else {
            Err(TakeoverError::UnsupportedCapabilities(capabilities))
        }
    }

    pub fn deserialize_body(capabilities: u64, body: &[u8]) -> Result<TakeoverData> {
        match capabilities & (CUSTOM_SERIALIZATION | COMPACT_SERIALIZATION) {
            CUSTOM_SERIALIZATION => Self::deserialize_custom(body),
            COMPACT_SERIALIZATION => Self::deserialize_compact(body),
            _ => Err(TakeoverError::UnsupportedCapabilities(capabilities)),
        }
    }

    /// A ping is exactly one header word carrying the ping message type.
    pub fn is_ping(body: &[u8]) -> bool {
        body.len() == HEADER_LENGTH && matches!(read_header(body), Ok(MESSAGE_TYPE_PING))
    }

    pub fn serialize_ping() -> Vec<u8> {
        MESSAGE_TYPE_PING.to_be_bytes().to_vec()
    }

    // -- custom dialect ---------------------------------------------------

    fn serialize_custom(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u32(MESSAGE_TYPE_MOUNTS);
        w.write_u32(self.mount_points.len() as u32);
        for mount in &self.mount_points {
            w.write_len_prefixed(mount.mount_path.as_os_str().as_bytes());
            w.write_len_prefixed(mount.state_directory.as_os_str().as_bytes());
            w.write_u32(mount.bind_mounts.len() as u32);
            for bind in &mount.bind_mounts {
                w.write_len_prefixed(bind.as_os_str().as_bytes());
            }
            w.write_bytes(&mount.conn_info.to_ne_bytes());
            // Obsolete file-handle-map: the size field survives, always 0.
            w.write_u32(0);
            w.write_len_prefixed(&mount.inode_map);
        }
        w.into_bytes()
    }

    fn deserialize_custom(body: &[u8]) -> Result<TakeoverData> {
        let mut r = WireReader::new(body);
        let message_type = r.read_u32()?;
        if message_type == MESSAGE_TYPE_ERROR {
            let class = String::from_utf8_lossy(r.read_len_prefixed()?).into_owned();
            let message = String::from_utf8_lossy(r.read_len_prefixed()?).into_owned();
            return Err(TakeoverError::Peer { class, message });
        }
        if message_type != MESSAGE_TYPE_MOUNTS {
            return Err(TakeoverError::Malformed(format!(
                "unknown takeover message type {message_type}"
            )));
        }

        let mut data = TakeoverData::default();
        let count = r.read_u32()?;
        for _ in 0..count {
            let mount_path = path_from_bytes(r.read_len_prefixed()?);
            let state_directory = path_from_bytes(r.read_len_prefixed()?);

            let bind_count = r.read_u32()?;
            let mut bind_mounts = Vec::with_capacity(bind_count as usize);
            for _ in 0..bind_count {
                bind_mounts.push(path_from_bytes(r.read_len_prefixed()?));
            }

            let conn_info =
                KernelConnInfo::from_ne_bytes(r.read_exact(KernelConnInfo::WIRE_SIZE)?)?;
            // Skip the obsolete file-handle-map bytes.
            let obsolete_len = r.read_u32()?;
            r.read_exact(obsolete_len as usize)?;
            let inode_map = r.read_len_prefixed()?.to_vec();

            data.mount_points.push(MountHandoff {
                mount_path,
                state_directory,
                bind_mounts,
                conn_info,
                inode_map,
                channel_fd: None,
            });
        }
        Ok(data)
    }

    // -- compact dialect --------------------------------------------------

    fn serialize_compact(&self, capabilities: u64) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut version = capabilities_to_version(capabilities)?;
        // Version 4 goes out advertised as 3: peers that predate 4 assume
        // its body is laid out like 3 (it is), and a rollback to such a
        // peer must keep working.
        if version == VERSION_FOUR {
            version = VERSION_THREE;
        }
        body.extend_from_slice(&version.to_be_bytes());

        let mounts = self
            .mount_points
            .iter()
            .map(|mount| CompactMount {
                mount_path: mount.mount_path.as_os_str().as_bytes().to_vec(),
                state_directory: mount.state_directory.as_os_str().as_bytes().to_vec(),
                bind_mounts: mount
                    .bind_mounts
                    .iter()
                    .map(|bind| bind.as_os_str().as_bytes().to_vec())
                    .collect(),
                conn_info: mount.conn_info.to_ne_bytes().to_vec(),
                inode_map: mount.inode_map.clone(),
            })
            .collect();
        body.extend_from_slice(&bincode::serialize(&CompactBody::Mounts(mounts))?);
        Ok(body)
    }

    fn deserialize_compact(body: &[u8]) -> Result<TakeoverData> {
        let record: CompactBody = bincode::deserialize(body)?;
        match record {
            CompactBody::Error(reason) => Err(TakeoverError::Peer {
                class: "TakeoverError".to_string(),
                message: reason,
            }),
            CompactBody::Mounts(mounts) => {
                let mut data = TakeoverData::default();
                for mount in mounts {
                    data.mount_points.push(MountHandoff {
                        mount_path: path_from_bytes(&mount.mount_path),
                        state_directory: path_from_bytes(&mount.state_directory),
                        bind_mounts: mount
                            .bind_mounts
                            .iter()
                            .map(|bind| path_from_bytes(bind))
                            .collect(),
                        conn_info: KernelConnInfo::from_ne_bytes(&mount.conn_info)?,
                        inode_map: mount.inode_map,
                        channel_fd: None,
                    });
                }
                Ok(data)
            }
        }
    }
}

fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(std::ffi::OsString::from_vec(bytes.to_vec()))
}

fn read_header(body: &[u8]) -> Result<u32> {
    if body.len() < HEADER_LENGTH {
        return Err(TakeoverError::Malformed(format!(
            "body too short for header ({} bytes)",
            body.len()
        )));
    }
    Ok(u32::from_be_bytes(body[..HEADER_LENGTH].try_into().unwrap()))
}

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new() -> Self {
        WireWriter { buf: Vec::new() }
    }

    fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_len_prefixed(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(TakeoverError::Malformed(format!(
                "truncated message: wanted {len} bytes at offset {}",
                self.pos
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()?;
        self.read_exact(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SUPPORTED_VERSIONS;

    fn sample_mounts() -> Vec<MountHandoff> {
        vec![
            MountHandoff {
                mount_path: PathBuf::from("/home/user/repo"),
                state_directory: PathBuf::from("/home/user/.hollowfs/clients/repo"),
                bind_mounts: vec![PathBuf::from("/home/user/repo/buck-out")],
                conn_info: KernelConnInfo {
                    major: 7,
                    minor: 31,
                    max_readahead: 128 * 1024,
                    flags: 0x1b,
                    max_background: 12,
                    congestion_threshold: 9,
                    max_write: 1 << 20,
                    time_gran: 0,
                },
                inode_map: b"opaque inode snapshot".to_vec(),
                channel_fd: None,
            },
            MountHandoff {
                mount_path: PathBuf::from("/data/other"),
                state_directory: PathBuf::from("/data/.hollowfs/clients/other"),
                bind_mounts: vec![],
                conn_info: KernelConnInfo::default(),
                inode_map: vec![],
                channel_fd: None,
            },
        ]
    }

    fn assert_mounts_match(actual: &[MountHandoff], expected: &[MountHandoff]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert_eq!(a.mount_path, e.mount_path);
            assert_eq!(a.state_directory, e.state_directory);
            assert_eq!(a.bind_mounts, e.bind_mounts);
            assert_eq!(a.conn_info, e.conn_info);
            assert_eq!(a.inode_map, e.inode_map);
        }
    }

    #[test]
    fn test_custom_round_trip() {
        let data = TakeoverData {
            lock_file: None,
            admin_socket: None,
            mount_points: sample_mounts(),
        };
        let caps = version_to_capabilities(VERSION_ONE).unwrap();
        let body = data.serialize_body(caps).unwrap();

        let (version, offset) = TakeoverData::probe_version(&body).unwrap();
        assert_eq!(version, VERSION_ONE);
        assert_eq!(offset, 0);

        let decoded = TakeoverData::deserialize_body(caps, &body).unwrap();
        assert_mounts_match(&decoded.mount_points, &data.mount_points);
    }

    #[test]
    fn test_compact_round_trip_all_versions() {
        for version in [VERSION_THREE, VERSION_FOUR] {
            let data = TakeoverData {
                lock_file: None,
                admin_socket: None,
                mount_points: sample_mounts(),
            };
            let caps = version_to_capabilities(version).unwrap();
            let body = data.serialize_body(caps).unwrap();

            let (wire_version, offset) = TakeoverData::probe_version(&body).unwrap();
            // Version 4 advertises 3 on the wire for rollback safety.
            assert_eq!(wire_version, VERSION_THREE);
            assert_eq!(offset, 4);

            let peer_caps = version_to_capabilities(wire_version).unwrap();
            let decoded =
                TakeoverData::deserialize_body(peer_caps, &body[offset..]).unwrap();
            assert_mounts_match(&decoded.mount_points, &data.mount_points);
        }
    }

    #[test]
    fn test_empty_mount_set_round_trips() {
        for version in SUPPORTED_VERSIONS {
            let caps = version_to_capabilities(version).unwrap();
            let body = TakeoverData::default().serialize_body(caps).unwrap();
            let (_, offset) = TakeoverData::probe_version(&body).unwrap();
            let decoded = TakeoverData::deserialize_body(caps, &body[offset..]).unwrap();
            assert!(decoded.mount_points.is_empty());
        }
    }

    #[test]
    fn test_custom_error_body() {
        let body =
            TakeoverData::serialize_error_body(0, "TakeoverError", "no common version")
                .unwrap();
        let (version, offset) = TakeoverData::probe_version(&body).unwrap();
        assert_eq!(version, VERSION_ONE);
        let err = TakeoverData::deserialize_body(
            version_to_capabilities(VERSION_ONE).unwrap(),
            &body[offset..],
        )
        .unwrap_err();
        match err {
            TakeoverError::Peer { class, message } => {
                assert_eq!(class, "TakeoverError");
                assert_eq!(message, "no common version");
            }
            other => panic!("expected peer error, got {other:?}"),
        }
    }

    #[test]
    fn test_compact_error_body() {
        let caps = version_to_capabilities(VERSION_THREE).unwrap();
        let body =
            TakeoverData::serialize_error_body(caps, "TakeoverError", "mid-shutdown").unwrap();
        let (version, offset) = TakeoverData::probe_version(&body).unwrap();
        assert_eq!(version, VERSION_THREE);
        let err = TakeoverData::deserialize_body(caps, &body[offset..]).unwrap_err();
        assert!(matches!(err, TakeoverError::Peer { .. }));
    }

    #[test]
    fn test_ping_detection() {
        let ping = TakeoverData::serialize_ping();
        assert_eq!(ping.len(), 4);
        assert!(TakeoverData::is_ping(&ping));

        // Same leading word, longer body: not a ping.
        let mut longer = ping.clone();
        longer.push(0);
        assert!(!TakeoverData::is_ping(&longer));
        assert!(!TakeoverData::is_ping(&MESSAGE_TYPE_MOUNTS.to_be_bytes()));
    }

    #[test]
    fn test_unrecognized_header_is_malformed() {
        let body = 0xdead_beefu32.to_be_bytes();
        assert!(matches!(
            TakeoverData::probe_version(&body),
            Err(TakeoverError::Malformed(_))
        ));
        assert!(matches!(
            TakeoverData::probe_version(&[1, 2]),
            Err(TakeoverError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_custom_body_is_malformed() {
        let data = TakeoverData {
            lock_file: None,
            admin_socket: None,
            mount_points: sample_mounts(),
        };
        let caps = version_to_capabilities(VERSION_ONE).unwrap();
        let body = data.serialize_body(caps).unwrap();
        let err = TakeoverData::deserialize_body(caps, &body[..body.len() - 3]).unwrap_err();
        assert!(matches!(err, TakeoverError::Malformed(_)));
    }

    #[test]
    fn test_conn_info_blob_round_trip() {
        let info = KernelConnInfo {
            major: 7,
            minor: 36,
            max_readahead: 4096,
            flags: 0xffff_ffff,
            max_background: u16::MAX,
            congestion_threshold: 1,
            max_write: 0,
            time_gran: 1_000,
        };
        let bytes = info.to_ne_bytes();
        assert_eq!(KernelConnInfo::from_ne_bytes(&bytes).unwrap(), info);
        assert!(KernelConnInfo::from_ne_bytes(&bytes[..10]).is_err());
    }
}
