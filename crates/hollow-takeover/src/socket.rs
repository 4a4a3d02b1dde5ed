//! Unix-socket transport carrying message bytes plus file descriptors.
//!
//! Each message is one length-prefixed frame. The descriptors ride as
//! SCM_RIGHTS ancillary data on the sendmsg that opens the frame, so they
//! arrive together with the first bytes of the message they belong to.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tracing::trace;

use crate::{Result, TakeoverError};

/// Upper bound on descriptors per message: lock file, admin socket, and a
/// generous number of mounts.
const MAX_FDS: usize = 128;

const FRAME_PREFIX: usize = 4;

/// One takeover message: body bytes plus the descriptors attached to it.
#[derive(Debug, Default)]
pub struct SocketMessage {
    pub data: Vec<u8>,
    pub files: Vec<OwnedFd>,
}

impl SocketMessage {
    pub fn data_only(data: Vec<u8>) -> Self {
        SocketMessage {
            data,
            files: Vec::new(),
        }
    }
}

/// A connected local socket speaking length-prefixed, fd-bearing frames.
pub struct UnixSocket {
    stream: UnixStream,
}

impl UnixSocket {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(UnixSocket {
            stream: UnixStream::connect(path)?,
        })
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        UnixSocket { stream }
    }

    /// A connected pair, for in-process handoff and tests.
    pub fn pair() -> Result<(UnixSocket, UnixSocket)> {
        let (a, b) = UnixStream::pair()?;
        Ok((UnixSocket::from_stream(a), UnixSocket::from_stream(b)))
    }

    pub fn send(&mut self, msg: SocketMessage) -> Result<()> {
        let len = u32::try_from(msg.data.len())
            .map_err(|_| TakeoverError::Malformed("message over 4 GiB".to_string()))?;
        let prefix = len.to_be_bytes();
        let raw_fds: Vec<RawFd> = msg.files.iter().map(|fd| fd.as_raw_fd()).collect();
        trace!(bytes = msg.data.len(), fds = raw_fds.len(), "sending takeover frame");

        let iov = [IoSlice::new(&prefix), IoSlice::new(&msg.data)];
        let cmsgs = if raw_fds.is_empty() {
            vec![]
        } else {
            vec![ControlMessage::ScmRights(&raw_fds)]
        };
        let sent = sendmsg::<()>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )?;

        // A short sendmsg can happen on large frames; the descriptors went
        // with the first chunk, the rest is plain stream data.
        if sent < FRAME_PREFIX {
            self.stream.write_all(&prefix[sent..])?;
            self.stream.write_all(&msg.data)?;
        } else if sent < FRAME_PREFIX + msg.data.len() {
            self.stream.write_all(&msg.data[sent - FRAME_PREFIX..])?;
        }
        Ok(())
    }

    pub fn recv(&mut self) -> Result<SocketMessage> {
        // Read only the frame prefix here: the descriptors are delivered
        // with the first byte of the sendmsg segment, and stopping at the
        // prefix keeps back-to-back frames cleanly separated.
        let mut prefix = [0u8; FRAME_PREFIX];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);

        let (received, files) = {
            let mut iov = [IoSliceMut::new(&mut prefix)];
            let msg = recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            )?;

            let mut files = Vec::new();
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                    for raw in raw_fds {
                        // The kernel just handed us ownership of this fd.
                        files.push(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
            }
            (msg.bytes, files)
        };

        if received == 0 {
            return Err(TakeoverError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the takeover socket",
            )));
        }
        if received < FRAME_PREFIX {
            self.stream.read_exact(&mut prefix[received..])?;
        }

        let frame_len = u32::from_be_bytes(prefix) as usize;
        let mut data = vec![0u8; frame_len];
        self.stream.read_exact(&mut data)?;

        trace!(bytes = data.len(), fds = files.len(), "received takeover frame");
        Ok(SocketMessage { data, files })
    }
}
