//! Message framing over a `SOCK_SEQPACKET` Unix socket.
//!
//! One `sendmsg` carries exactly one protocol message, so the kernel keeps
//! message boundaries for us. A message may carry a single file descriptor
//! as `SCM_RIGHTS` ancillary data.
//!
//! The socket is non-blocking and registered with the tokio reactor through
//! [`AsyncFd`]; `EAGAIN` turns into waiting for readiness.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use tokio::io::unix::AsyncFd;
use tracing::trace;

use crate::error::{ProxyError, Result};
use crate::protocol::MAX_MSG_SIZE;

/// One received message.
#[derive(Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    pub fd: Option<OwnedFd>,
}

/// One endpoint of a connected seqpacket socket.
#[derive(Debug)]
pub struct Connection {
    inner: AsyncFd<OwnedFd>,
}

impl Connection {
    /// Create a connected pair of endpoints in this process.
    pub fn pair() -> Result<(Connection, Connection)> {
        let (a, b) = seqpacket_pair()?;
        Ok((Self::from_owned_fd(a)?, Self::from_owned_fd(b)?))
    }

    /// Create a pair where the second end stays a plain blocking descriptor,
    /// ready to be handed to a child process.
    pub fn pair_for_child() -> Result<(Connection, OwnedFd)> {
        let (ours, theirs) = seqpacket_pair()?;
        Ok((Self::from_owned_fd(ours)?, theirs))
    }

    /// Adopt an already connected socket, e.g. one inherited from a parent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(fd.as_fd())?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Send one message, optionally attaching a descriptor.
    pub async fn send(&self, payload: &[u8], fd: Option<BorrowedFd<'_>>) -> Result<()> {
        if payload.len() > MAX_MSG_SIZE {
            return Err(ProxyError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MSG_SIZE,
            });
        }
        let raw_fds: Vec<RawFd> = fd.iter().map(AsRawFd::as_raw_fd).collect();

        loop {
            let mut guard = self.inner.writable().await?;
            let attempt = guard.try_io(|inner| {
                let iov = [IoSlice::new(payload)];
                let rights = [ControlMessage::ScmRights(&raw_fds)];
                let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() { &[] } else { &rights };
                socket::sendmsg::<UnixAddr>(
                    inner.as_raw_fd(),
                    &iov,
                    cmsgs,
                    MsgFlags::MSG_NOSIGNAL,
                    None,
                )
                .map_err(io::Error::from)
            });
            let sent = match attempt {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            if sent != payload.len() {
                return Err(ProxyError::ShortWrite {
                    sent,
                    expected: payload.len(),
                });
            }
            trace!(bytes = sent, fds = raw_fds.len(), "sent message");
            return Ok(());
        }
    }

    /// Receive one message. `None` means the peer closed the connection.
    pub async fn recv(&self) -> Result<Option<Message>> {
        let mut buf = vec![0u8; MAX_MSG_SIZE];
        loop {
            let mut guard = self.inner.readable().await?;
            let attempt = guard.try_io(|inner| recv_one(inner.as_raw_fd(), &mut buf));
            let received = match attempt {
                Ok(Ok(received)) => received,
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(None),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            };

            let Received {
                len,
                flags,
                mut fds,
            } = received;
            if flags.contains(MsgFlags::MSG_TRUNC) {
                return Err(ProxyError::MessageTruncated { max: MAX_MSG_SIZE });
            }
            if flags.contains(MsgFlags::MSG_CTRUNC) || fds.len() > 1 {
                // Dropping `fds` closes everything we did get.
                return Err(ProxyError::TooManyFds(fds.len().max(2)));
            }
            if len == 0 && fds.is_empty() {
                trace!("peer closed connection");
                return Ok(None);
            }
            buf.truncate(len);
            trace!(bytes = len, fds = fds.len(), "received message");
            return Ok(Some(Message {
                payload: buf,
                fd: fds.pop(),
            }));
        }
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.get_ref().as_fd()
    }
}

struct Received {
    len: usize,
    flags: MsgFlags,
    fds: Vec<OwnedFd>,
}

fn recv_one(fd: RawFd, buf: &mut [u8]) -> io::Result<Received> {
    // Room for two descriptors so that a second one is detected rather than
    // silently discarded by the kernel.
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 2]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = socket::recvmsg::<UnixAddr>(
        fd,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: the kernel just installed this descriptor for us and
                // nothing else refers to it.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Ok(Received {
        len: msg.bytes,
        flags: msg.flags,
        fds,
    })
}

fn seqpacket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let pair = socket::socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    Ok(pair)
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
