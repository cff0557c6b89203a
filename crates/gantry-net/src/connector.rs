use std::io;

use tracing::debug;

use crate::{
    NetError,
    endpoint::{Endpoint, Kind, Target},
    socket::{Socket, SocketState},
};

/// Open a non-blocking outbound connection.
///
/// The returned socket is in `Init` state: completion is the first writable
/// readiness, confirmed with [`finish_connect`]. Multi-target endpoints (DNS,
/// wildcard) are tried in resolve order; the first kernel-accepted attempt
/// wins. `socket_buf_size` sets kernel SO_SNDBUF/SO_RCVBUF on the new socket.
pub fn connect(endpoint: &Endpoint, socket_buf_size: Option<usize>) -> Result<Socket, NetError> {
    let targets = endpoint.resolve()?;
    let mut last_err: Option<io::Error> = None;

    for target in &targets {
        let attempt = match (target, endpoint.kind) {
            (Target::Inet(addr), Kind::Stream) => mio::net::TcpStream::connect(*addr)
                .and_then(|s| Socket::from_tcp(s, SocketState::Init)),
            (Target::Local(path), Kind::Stream) => {
                mio::net::UnixStream::connect(path)
                    .map(|s| Socket::from_local(s, SocketState::Init))
            }
            // Datagram "connections" are owned by their listener; dialing out
            // over UDP is not a thing this framework does.
            (_, Kind::Datagram) => Err(io::ErrorKind::Unsupported.into()),
        };
        match attempt {
            Ok(mut socket) => {
                if let Some(size) = socket_buf_size {
                    socket.stream_mut().set_buf_size(size);
                }
                socket.set_peer(target.to_string());
                debug!(%target, "connect in flight");
                return Ok(socket);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(NetError::Connect {
        target: endpoint.to_string(),
        source: last_err.unwrap_or_else(|| io::ErrorKind::AddrNotAvailable.into()),
    })
}

/// Resolve a pending connect on writable readiness.
///
/// `Ok(true)` means the socket is open; `Err` carries the kernel's verdict
/// (refused, unreachable) and the owner should treat the connection as dead.
pub fn finish_connect(socket: &mut Socket) -> io::Result<bool> {
    if socket.state() != SocketState::Init {
        return Ok(true);
    }
    if let Some(err) = socket.stream_mut().take_error()? {
        return Err(err);
    }
    socket.mark_open();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Family;

    #[test]
    fn connect_to_bound_listener_starts_in_init() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let ep = Endpoint::new("127.0.0.1", port, Family::Inet, Kind::Stream);
        let socket = connect(&ep, Some(64 * 1024)).unwrap();
        assert_eq!(socket.state(), SocketState::Init);
    }

    #[test]
    fn datagram_endpoints_are_refused() {
        let ep = Endpoint::new("127.0.0.1", 1, Family::Inet, Kind::Datagram);
        assert!(matches!(connect(&ep, None), Err(NetError::Connect { .. })));
    }
}
