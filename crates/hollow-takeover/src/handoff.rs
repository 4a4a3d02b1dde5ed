//! The handoff conversation on top of the codec.
//!
//! The incoming daemon connects and offers the versions it speaks; the
//! outgoing daemon picks the best common one, optionally proves the peer is
//! alive with a ping, then ships its serving state. On a failed
//! negotiation an error body goes out instead — the outgoing side never
//! crashes over a version mismatch.

use tracing::{info, warn};

use crate::capabilities::{compute_compatible_version, version_to_capabilities, PING};
use crate::data::TakeoverData;
use crate::socket::{SocketMessage, UnixSocket};
use crate::{Result, TakeoverError};

/// Outgoing side: answer one takeover request on `socket`.
pub fn serve_takeover(
    socket: &mut UnixSocket,
    data: TakeoverData,
    supported: &[u32],
) -> Result<()> {
    let query = socket.recv()?;
    let offered: Vec<u32> = bincode::deserialize(&query.data)?;

    let version = match compute_compatible_version(&offered, supported) {
        Some(version) => version,
        None => {
            warn!(?offered, "no common takeover version; reporting failure");
            let body = TakeoverData::serialize_error_body(
                0,
                "TakeoverError",
                &format!("no common takeover version (offered {offered:?})"),
            )?;
            socket.send(SocketMessage::data_only(body))?;
            return Err(TakeoverError::NoCompatibleVersion);
        }
    };
    let capabilities = version_to_capabilities(version)?;
    info!(version, mounts = data.mount_points.len(), "starting takeover handoff");

    if capabilities & PING != 0 {
        // Make sure the peer is still there before the descriptors leave
        // this process for good.
        socket.send(SocketMessage::data_only(TakeoverData::serialize_ping()))?;
        let reply = socket.recv()?;
        if !TakeoverData::is_ping(&reply.data) {
            return Err(TakeoverError::Malformed(
                "expected ping acknowledgement".to_string(),
            ));
        }
    }

    socket.send(data.serialize_message(capabilities)?)?;
    Ok(())
}

/// Incoming side: request the outgoing daemon's state.
pub fn request_takeover(socket: &mut UnixSocket, supported: &[u32]) -> Result<TakeoverData> {
    socket.send(SocketMessage::data_only(bincode::serialize(&supported)?))?;

    loop {
        let msg = socket.recv()?;
        if TakeoverData::is_ping(&msg.data) {
            // Liveness probe; acknowledge and keep waiting for the data.
            socket.send(SocketMessage::data_only(TakeoverData::serialize_ping()))?;
            continue;
        }
        let data = TakeoverData::deserialize_message(msg)?;
        info!(mounts = data.mount_points.len(), "takeover data received");
        return Ok(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{SUPPORTED_VERSIONS, VERSION_ONE, VERSION_THREE};
    use crate::data::{KernelConnInfo, MountHandoff};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::OwnedFd;
    use std::path::PathBuf;
    use tempfile::tempfile;

    fn fd_from_temp(contents: &[u8]) -> OwnedFd {
        let mut file = tempfile().unwrap();
        file.write_all(contents).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        OwnedFd::from(file)
    }

    fn read_fd(fd: OwnedFd) -> String {
        let mut text = String::new();
        File::from(fd).read_to_string(&mut text).unwrap();
        text
    }

    fn sample_data() -> TakeoverData {
        TakeoverData {
            lock_file: Some(fd_from_temp(b"lock")),
            admin_socket: Some(fd_from_temp(b"admin")),
            mount_points: vec![
                MountHandoff {
                    mount_path: PathBuf::from("/mnt/repo-a"),
                    state_directory: PathBuf::from("/state/a"),
                    bind_mounts: vec![PathBuf::from("/mnt/repo-a/out")],
                    conn_info: KernelConnInfo {
                        major: 7,
                        minor: 31,
                        ..Default::default()
                    },
                    inode_map: b"snapshot-a".to_vec(),
                    channel_fd: Some(fd_from_temp(b"channel-a")),
                },
                MountHandoff {
                    mount_path: PathBuf::from("/mnt/repo-b"),
                    state_directory: PathBuf::from("/state/b"),
                    bind_mounts: vec![],
                    conn_info: KernelConnInfo::default(),
                    inode_map: b"snapshot-b".to_vec(),
                    channel_fd: Some(fd_from_temp(b"channel-b")),
                },
            ],
        }
    }

    fn run_handoff(client_versions: Vec<u32>) -> (Result<()>, Result<TakeoverData>) {
        let (mut server_sock, mut client_sock) = UnixSocket::pair().unwrap();
        let server = std::thread::spawn(move || {
            serve_takeover(&mut server_sock, sample_data(), &SUPPORTED_VERSIONS)
        });
        let received = request_takeover(&mut client_sock, &client_versions);
        (server.join().unwrap(), received)
    }

    #[test]
    fn test_full_handoff_with_ping() {
        let (served, received) = run_handoff(SUPPORTED_VERSIONS.to_vec());
        served.unwrap();
        let data = received.unwrap();

        assert_eq!(data.mount_points.len(), 2);
        assert_eq!(data.mount_points[0].mount_path, PathBuf::from("/mnt/repo-a"));
        assert_eq!(data.mount_points[0].inode_map, b"snapshot-a");
        assert_eq!(data.mount_points[1].bind_mounts.len(), 0);

        // The descriptors came through, in order.
        assert_eq!(read_fd(data.lock_file.unwrap()), "lock");
        assert_eq!(read_fd(data.admin_socket.unwrap()), "admin");
        let channels: Vec<String> = data
            .mount_points
            .into_iter()
            .map(|m| read_fd(m.channel_fd.unwrap()))
            .collect();
        assert_eq!(channels, vec!["channel-a", "channel-b"]);
    }

    #[test]
    fn test_handoff_at_version_one() {
        let (served, received) = run_handoff(vec![VERSION_ONE]);
        served.unwrap();
        let data = received.unwrap();
        assert_eq!(data.mount_points.len(), 2);
        assert_eq!(
            data.mount_points[0].conn_info,
            KernelConnInfo {
                major: 7,
                minor: 31,
                ..Default::default()
            }
        );
        assert!(data.mount_points[0].channel_fd.is_some());
    }

    #[test]
    fn test_handoff_at_version_three_skips_ping() {
        let (served, received) = run_handoff(vec![VERSION_THREE]);
        served.unwrap();
        assert_eq!(received.unwrap().mount_points.len(), 2);
    }

    #[test]
    fn test_no_common_version_reports_error() {
        let (served, received) = run_handoff(vec![99]);
        assert!(matches!(served, Err(TakeoverError::NoCompatibleVersion)));
        match received {
            Err(TakeoverError::Peer { class, message }) => {
                assert_eq!(class, "TakeoverError");
                assert!(message.contains("no common takeover version"));
            }
            other => panic!("expected peer error, got {other:?}"),
        }
    }

    #[test]
    fn test_fd_count_mismatch_is_fatal() {
        let data = sample_data();
        let caps = version_to_capabilities(VERSION_THREE).unwrap();
        let mut msg = data.serialize_message(caps).unwrap();
        msg.files.pop();

        let err = TakeoverData::deserialize_message(msg).unwrap_err();
        assert!(matches!(
            err,
            TakeoverError::FdCountMismatch { mounts: 2, fds: 3 }
        ));
    }
}
