use std::{io, net::SocketAddr, path::Path};

use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};
use tracing::{debug, info};

use crate::{
    NetError,
    endpoint::{Endpoint, Kind, Target},
    socket::StreamKind,
};

pub const DEFAULT_BACKLOG: i32 = 1024;

/// The bound kernel socket behind one listener.
pub enum ListenerSocket {
    Tcp(mio::net::TcpListener),
    Local(mio::net::UnixListener),
    Udp(mio::net::UdpSocket),
}

/// One bound, not-yet-registered listener. An [`Endpoint`] spec may produce
/// several of these (wildcard v4 + v6); each registers with the event loop
/// independently and shares the spec's policy.
pub struct BoundListener {
    pub endpoint: Endpoint,
    pub target: Target,
    socket: ListenerSocket,
}

/// Bind every target an endpoint resolves to.
///
/// `socket_buf_size` sets kernel SO_SNDBUF/SO_RCVBUF on the bound sockets
/// (accepted streams inherit it). Startup-fatal by design: one failed bind
/// fails the whole spec, and the caller exits. Half-bound listener sets are
/// not a state the server runs in.
pub fn bind_all(
    endpoint: &Endpoint,
    backlog: i32,
    socket_buf_size: Option<usize>,
) -> Result<Vec<BoundListener>, NetError> {
    let mut bound = Vec::new();
    for target in endpoint.resolve()? {
        let socket = match (&target, endpoint.kind) {
            (Target::Inet(addr), Kind::Stream) => {
                bind_tcp(*addr, backlog, socket_buf_size).map(ListenerSocket::Tcp)
            }
            (Target::Inet(addr), Kind::Datagram) => {
                bind_udp(*addr, socket_buf_size).map(ListenerSocket::Udp)
            }
            (Target::Local(path), Kind::Stream) => bind_local(path, backlog).map(ListenerSocket::Local),
            (Target::Local(_), Kind::Datagram) => unreachable!("rejected at resolve"),
        }
        .map_err(|source| NetError::Bind { target: target.to_string(), source })?;

        info!(%target, %endpoint, "listener bound");
        bound.push(BoundListener { endpoint: endpoint.clone(), target, socket });
    }
    Ok(bound)
}

fn bind_tcp(
    addr: SocketAddr,
    backlog: i32,
    buf_size: Option<usize>,
) -> io::Result<mio::net::TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = RawSocket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Wildcard specs bind v4 and v6 explicitly; never let one grab both.
        sock.set_only_v6(true)?;
    }
    if let Some(size) = buf_size {
        sock.set_send_buffer_size(size)?;
        sock.set_recv_buffer_size(size)?;
    }
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    sock.listen(backlog)?;
    Ok(mio::net::TcpListener::from_std(sock.into()))
}

fn bind_udp(addr: SocketAddr, buf_size: Option<usize>) -> io::Result<mio::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = RawSocket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }
    if let Some(size) = buf_size {
        sock.set_send_buffer_size(size)?;
        sock.set_recv_buffer_size(size)?;
    }
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    Ok(mio::net::UdpSocket::from_std(sock.into()))
}

fn bind_local(path: &Path, backlog: i32) -> io::Result<mio::net::UnixListener> {
    // A previous run's socket file would fail the bind with AddrInUse.
    let _ = std::fs::remove_file(path);

    let sock = RawSocket::new(Domain::UNIX, Type::STREAM, None)?;
    sock.set_nonblocking(true)?;
    sock.bind(&SockAddr::unix(path)?)?;
    sock.listen(backlog)?;
    let fd: std::os::fd::OwnedFd = sock.into();
    let std_listener = std::os::unix::net::UnixListener::from(fd);
    Ok(mio::net::UnixListener::from_std(std_listener))
}

impl BoundListener {
    pub fn source(&mut self) -> &mut dyn mio::event::Source {
        match &mut self.socket {
            ListenerSocket::Tcp(s) => s,
            ListenerSocket::Local(s) => s,
            ListenerSocket::Udp(s) => s,
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self.socket, ListenerSocket::Udp(_))
    }

    /// Kernel-assigned address, for ephemeral-port binds.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            ListenerSocket::Tcp(s) => s.local_addr().ok(),
            ListenerSocket::Udp(s) => s.local_addr().ok(),
            ListenerSocket::Local(_) => None,
        }
    }

    /// Accept one pending stream connection. `None` when the accept queue is
    /// empty; the caller loops until then (edge-triggered readiness).
    pub fn accept(&mut self) -> io::Result<Option<StreamKind>> {
        loop {
            let result = match &mut self.socket {
                ListenerSocket::Tcp(listener) => {
                    listener.accept().map(|(stream, peer)| (StreamKind::Tcp(stream), peer.to_string()))
                }
                ListenerSocket::Local(listener) => {
                    listener.accept().map(|(stream, _)| (StreamKind::Local(stream), "local".to_owned()))
                }
                ListenerSocket::Udp(_) => return Ok(None),
            };
            match result {
                Ok((stream, peer)) => {
                    debug!(%peer, target = %self.target, "accepted");
                    return Ok(Some(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive one datagram. `None` when the queue is empty.
    pub fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let ListenerSocket::Udp(sock) = &mut self.socket else {
            return Ok(None);
        };
        loop {
            match sock.recv_from(buf) {
                Ok((n, peer)) => return Ok(Some((n, peer))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one reply datagram. Datagram sockets have no outbound buffer; a
    /// full kernel queue drops the reply, which is the protocol's nature.
    pub fn send_datagram(&mut self, peer: SocketAddr, data: &[u8]) -> io::Result<usize> {
        let ListenerSocket::Udp(sock) = &mut self.socket else {
            return Ok(0);
        };
        match sock.send_to(data, peer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Family;

    #[test]
    fn ephemeral_tcp_bind_and_accept_nothing() {
        let ep = Endpoint::new("127.0.0.1", 0, Family::Inet, Kind::Stream);
        let mut bound = bind_all(&ep, DEFAULT_BACKLOG, None).unwrap();
        assert_eq!(bound.len(), 1);
        assert!(!bound[0].is_datagram());
        assert!(bound[0].accept().unwrap().is_none());
    }

    #[test]
    fn local_bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let ep = Endpoint::local(path.to_str().unwrap());

        let first = bind_all(&ep, DEFAULT_BACKLOG, None).unwrap();
        drop(first);
        // Socket file is left behind; a rebind must still succeed.
        let second = bind_all(&ep, DEFAULT_BACKLOG, None).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn udp_bind_reports_datagram() {
        let ep = Endpoint::new("127.0.0.1", 0, Family::Inet, Kind::Datagram);
        let bound = bind_all(&ep, DEFAULT_BACKLOG, None).unwrap();
        assert!(bound[0].is_datagram());
    }

    #[test]
    fn explicit_socket_buf_size_binds() {
        // The kernel clamps the value; the bind itself must succeed.
        let ep = Endpoint::new("127.0.0.1", 0, Family::Inet, Kind::Stream);
        let bound = bind_all(&ep, DEFAULT_BACKLOG, Some(64 * 1024)).unwrap();
        assert_eq!(bound.len(), 1);
    }
}
