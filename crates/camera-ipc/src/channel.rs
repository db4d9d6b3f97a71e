use crate::errors::IpcError;
use crate::message::{WIRE_SIZE, WireMessage};
use crate::paths::MAX_PACKETS;
use crate::queue::BoundedQueue;
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr, bind, connect,
    recvmsg, send, setsockopt, socket, sockopt,
};
use std::io::{self, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/// Datagram control socket between this client and the camera server.
///
/// Bound to a well-known client path (unlinked again on drop) and connected
/// to the server path. Buffer announces carry their shared-memory descriptor
/// as SCM_RIGHTS ancillary data.
#[derive(Debug)]
pub struct ControlChannel {
    fd: OwnedFd,
    client_path: PathBuf,
    server_addr: UnixAddr,
    received: BoundedQueue<WireMessage>,
}

impl ControlChannel {
    pub fn connect(
        client_path: impl AsRef<Path>,
        server_path: impl AsRef<Path>,
    ) -> Result<Self, IpcError> {
        let client_path = client_path.as_ref();
        let server_path = server_path.as_ref();

        let fd = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|source| IpcError::Connection {
            stage: "socket",
            source,
        })?;

        setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|source| IpcError::Connection {
            stage: "setsockopt",
            source,
        })?;

        // A previous client may have left its socket file behind
        match std::fs::remove_file(client_path) {
            Ok(()) => tracing::debug!(path = %client_path.display(), "Removed stale client socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(IpcError::Io(e)),
        }

        let server_addr = UnixAddr::new(server_path).map_err(|source| IpcError::Connection {
            stage: "connect",
            source,
        })?;
        let client_addr = UnixAddr::new(client_path).map_err(|source| IpcError::Connection {
            stage: "bind",
            source,
        })?;
        bind(fd.as_raw_fd(), &client_addr).map_err(|source| IpcError::Connection {
            stage: "bind",
            source,
        })?;

        let channel = Self {
            fd,
            client_path: client_path.to_path_buf(),
            server_addr,
            received: BoundedQueue::new(MAX_PACKETS),
        };

        // From here on `channel` unlinks the client path if connecting fails
        connect(channel.fd.as_raw_fd(), &channel.server_addr).map_err(|source| {
            IpcError::Connection {
                stage: "connect",
                source,
            }
        })?;

        tracing::info!(
            client = %channel.client_path.display(),
            server = %server_path.display(),
            "Control channel connected"
        );

        Ok(channel)
    }

    /// Connect the existing socket to the server path again, e.g. after the
    /// server restarted and re-created its socket.
    pub fn reconnect(&self) -> Result<(), IpcError> {
        connect(self.fd.as_raw_fd(), &self.server_addr).map_err(|source| {
            if is_peer_gone(source) {
                IpcError::PeerUnavailable(source)
            } else {
                IpcError::Connection {
                    stage: "reconnect",
                    source,
                }
            }
        })
    }

    pub fn send(&self, msg: &WireMessage) -> Result<(), IpcError> {
        let buf = msg.encode();
        loop {
            match send(self.fd.as_raw_fd(), &buf, MsgFlags::MSG_NOSIGNAL) {
                Ok(written) if written == WIRE_SIZE => return Ok(()),
                Ok(written) => {
                    return Err(IpcError::ShortWrite {
                        written,
                        expected: WIRE_SIZE,
                    });
                }
                Err(Errno::EINTR) => continue,
                Err(e) if is_peer_gone(e) => return Err(IpcError::PeerUnavailable(e)),
                Err(e) => return Err(IpcError::Io(io::Error::from(e))),
            }
        }
    }

    /// Read every pending datagram into the receive queue without blocking.
    /// Returns how many messages were queued.
    pub fn receive_nonblocking(&mut self) -> Result<usize, IpcError> {
        let mut count = 0;

        loop {
            if self.received.is_full() {
                // The rest stays in the socket until the queue is drained
                tracing::warn!(capacity = MAX_PACKETS, "Receive queue full");
                break;
            }

            match self.recv_one() {
                Ok(Some(msg)) => {
                    tracing::trace!(message = ?msg.id, "Received message");
                    // Capacity checked above
                    let _ = self.received.push(msg);
                    count += 1;
                }
                Ok(None) => break,
                Err(IpcError::Protocol(reason)) => {
                    tracing::warn!(%reason, "Dropping malformed datagram");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(count)
    }

    /// Messages received so far, oldest first.
    pub fn drain_received(&mut self) -> Vec<WireMessage> {
        self.received.drain()
    }

    pub fn client_path(&self) -> &Path {
        &self.client_path
    }

    fn recv_one(&self) -> Result<Option<WireMessage>, IpcError> {
        let mut buf = [0u8; WIRE_SIZE];
        let mut cmsg_buf = nix::cmsg_space!(RawFd);

        let (bytes, truncated, fds) = loop {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(None),
                Err(e) => return Err(IpcError::Nix(e)),
            };

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    fds.extend(received);
                }
            }
            let truncated = msg.flags.contains(MsgFlags::MSG_TRUNC);
            break (msg.bytes, truncated, fds);
        };

        // Take ownership of everything so unused descriptors get closed
        let mut fds = fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
        let fd = fds.next();
        let extra = fds.count();
        if extra > 0 {
            tracing::warn!(extra, "Closing unexpected extra descriptors");
        }

        if truncated {
            return Err(IpcError::Protocol(format!(
                "datagram larger than {WIRE_SIZE} bytes"
            )));
        }

        WireMessage::decode(&buf[..bytes], fd).map(Some)
    }
}

impl AsFd for ControlChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.client_path) {
            tracing::debug!(path = %self.client_path.display(), error = %e, "Client socket not removed");
        }
    }
}

fn is_peer_gone(errno: Errno) -> bool {
    matches!(errno, Errno::ECONNREFUSED | Errno::ENOENT | Errno::ENOTCONN)
}
