use std::{
    fmt,
    io::{self, Read, Write},
};

use mio::net::{TcpStream, UnixStream};
use tracing::trace;

use crate::buffer::ByteBuf;

/// Upper bound on bytes appended per `read_into_buffer` call. One call pulls
/// at most one chunk; the owner keeps calling until `WouldBlock` because the
/// poller is edge-triggered.
pub const READ_CHUNK: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    /// Outbound connect in flight; completion is signalled by writability.
    Init,
    Open,
    /// Close requested; stays registered until the outbound buffer drains.
    Draining,
    Closed,
}

/// Non-error read results. `Eof` covers orderly shutdown and peer resets:
/// both mean "peer is gone", which the owner handles identically.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Read(usize),
    WouldBlock,
    Eof,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
}

/// A connected stream socket, either address family.
pub enum StreamKind {
    Tcp(TcpStream),
    Local(UnixStream),
}

impl StreamKind {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Local(s) => s.read(buf),
        }
    }

    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Local(s) => s.write(buf),
        }
    }

    pub fn source(&mut self) -> &mut dyn mio::event::Source {
        match self {
            Self::Tcp(s) => s,
            Self::Local(s) => s,
        }
    }

    /// Pending async connect error, if the kernel reported one.
    pub fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Tcp(s) => s.take_error(),
            Self::Local(s) => s.take_error(),
        }
    }

    /// Set kernel SO_SNDBUF and SO_RCVBUF.
    pub fn set_buf_size(&self, size: usize) {
        use std::os::fd::AsRawFd;
        let fd = match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Local(s) => s.as_raw_fd(),
        };
        let size = size as libc::c_int;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

/// One kernel fd plus its two buffers. All operations are non-blocking;
/// `WouldBlock` and `Eof` are ordinary outcomes, not failures. The fd is
/// released when the socket is dropped, which only happens after the owner
/// has deregistered it and fired its close callback.
pub struct Socket {
    stream: StreamKind,
    state: SocketState,
    peer: String,
    pub rbuf: ByteBuf,
    pub wbuf: ByteBuf,
}

impl Socket {
    /// Wrap an accepted or freshly-connected TCP stream. Nagle is disabled on
    /// every stream the framework owns.
    pub fn from_tcp(stream: TcpStream, state: SocketState) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().map_or_else(|_| "-".to_owned(), |a| a.to_string());
        Ok(Self::new(StreamKind::Tcp(stream), state, peer))
    }

    pub fn from_local(stream: UnixStream, state: SocketState) -> Self {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "local".to_owned());
        Self::new(StreamKind::Local(stream), state, peer)
    }

    fn new(stream: StreamKind, state: SocketState, peer: String) -> Self {
        Self {
            stream,
            state,
            peer,
            rbuf: ByteBuf::with_capacity(READ_CHUNK),
            wbuf: ByteBuf::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        self.state
    }

    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Override the peer label (outbound sockets have no peer address until
    /// the connect completes).
    pub fn set_peer(&mut self, peer: impl Into<String>) {
        self.peer = peer.into();
    }

    pub fn stream_mut(&mut self) -> &mut StreamKind {
        &mut self.stream
    }

    /// Outbound connect completed; readiness handlers may now read/write.
    pub fn mark_open(&mut self) {
        if self.state == SocketState::Init {
            self.state = SocketState::Open;
        }
    }

    /// Stop reading, flush what is queued, then let the owner drop the fd.
    pub fn start_draining(&mut self) {
        if self.state == SocketState::Open || self.state == SocketState::Init {
            self.state = SocketState::Draining;
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = SocketState::Closed;
    }

    /// Append at most one [`READ_CHUNK`] of kernel bytes to the read buffer.
    pub fn read_into_buffer(&mut self) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => {
                    self.rbuf.append(&chunk[..n]);
                    return Ok(ReadOutcome::Read(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_peer_gone(&e) => return Ok(ReadOutcome::Eof),
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain as much of the write buffer as the kernel accepts, leaving the
    /// remainder queued.
    pub fn write_from_buffer(&mut self) -> io::Result<WriteOutcome> {
        let mut total = 0;
        while !self.wbuf.is_empty() {
            match self.stream.write(self.wbuf.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.wbuf.consume(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(peer = %self.peer, queued = self.wbuf.pending(), "write backpressure");
                    return Ok(WriteOutcome::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(WriteOutcome::Wrote(total))
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("rbuf", &self.rbuf)
            .field("wbuf", &self.wbuf)
            .finish()
    }
}

#[inline]
fn is_peer_gone(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted)
}
