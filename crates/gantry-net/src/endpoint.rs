use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    path::PathBuf,
};

use serde::Deserialize;
use thiserror::Error;

/// Address family selector. `Any` asks for both IPv4 and IPv6 where the host
/// allows it; `Local` is a UNIX-domain path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Any,
    Inet,
    Inet6,
    Local,
}

/// Socket kind: connected byte stream or one-message datagrams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[default]
    Stream,
    Datagram,
}

/// One listener or connector address spec, before binding.
///
/// The host portion accepts an IPv4 literal, an IPv6 literal in brackets, a
/// DNS name, or an absolute filesystem path (with `Family::Local`). An empty
/// host means the wildcard address. Port is ignored for local endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub family: Family,
    pub kind: Kind,
}

/// A concrete bind/connect target produced from an [`Endpoint`]. One spec may
/// resolve to several targets (e.g. wildcard v4 + v6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Inet(SocketAddr),
    Local(PathBuf),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("local endpoint needs an absolute path, got {0:?}")]
    RelativePath(String),
    #[error("cannot resolve {host:?}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{host:?} has no address in the requested family")]
    FamilyMismatch { host: String },
    #[error("datagram sockets are not supported on local endpoints")]
    LocalDatagram,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, family: Family, kind: Kind) -> Self {
        Self { host: host.into(), port, family, kind }
    }

    /// Shorthand for the manager control channel: a local stream socket.
    pub fn local(path: impl Into<String>) -> Self {
        Self { host: path.into(), port: 0, family: Family::Local, kind: Kind::Stream }
    }

    /// Resolve to concrete bind targets, in bind order.
    ///
    /// Wildcards and DNS names may produce one target per family; literals
    /// produce exactly one. Local endpoints produce the path.
    pub fn resolve(&self) -> Result<Vec<Target>, EndpointError> {
        if self.family == Family::Local {
            if self.kind == Kind::Datagram {
                return Err(EndpointError::LocalDatagram);
            }
            if !self.host.starts_with('/') {
                return Err(EndpointError::RelativePath(self.host.clone()));
            }
            return Ok(vec![Target::Local(PathBuf::from(&self.host))]);
        }

        let addrs = self.inet_candidates()?;
        let mut targets: Vec<Target> = addrs
            .into_iter()
            .filter(|a| match self.family {
                Family::Inet => a.is_ipv4(),
                Family::Inet6 => a.is_ipv6(),
                Family::Any => true,
                Family::Local => unreachable!(),
            })
            .map(Target::Inet)
            .collect();
        targets.dedup();

        if targets.is_empty() {
            return Err(EndpointError::FamilyMismatch { host: self.host.clone() });
        }
        Ok(targets)
    }

    fn inet_candidates(&self) -> Result<Vec<SocketAddr>, EndpointError> {
        if self.host.is_empty() {
            // Wildcard: one bind per family so v6-only hosts still work and
            // v4 traffic is not left to IPV6_V6ONLY defaults.
            return Ok(vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port),
            ]);
        }

        let literal = self
            .host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .and_then(|h| h.parse::<Ipv6Addr>().ok().map(IpAddr::V6))
            .or_else(|| self.host.parse::<IpAddr>().ok());
        if let Some(ip) = literal {
            return Ok(vec![SocketAddr::new(ip, self.port)]);
        }

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map(Iterator::collect)
            .map_err(|source| EndpointError::Resolve { host: self.host.clone(), source })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match (self.family, self.kind) {
            (Family::Local, _) => return write!(f, "local://{}", self.host),
            (_, Kind::Datagram) => "udp",
            (_, Kind::Stream) => "tcp",
        };
        if self.host.is_empty() {
            write!(f, "{scheme}://*:{}", self.port)
        } else {
            write!(f, "{scheme}://{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_literal_resolves_to_one_target() {
        let ep = Endpoint::new("127.0.0.1", 40000, Family::Any, Kind::Stream);
        let targets = ep.resolve().unwrap();
        assert_eq!(targets, vec![Target::Inet("127.0.0.1:40000".parse().unwrap())]);
    }

    #[test]
    fn bracketed_v6_literal() {
        let ep = Endpoint::new("[::1]", 9000, Family::Any, Kind::Stream);
        let targets = ep.resolve().unwrap();
        assert_eq!(targets, vec![Target::Inet("[::1]:9000".parse().unwrap())]);
    }

    #[test]
    fn wildcard_any_gives_both_families() {
        let ep = Endpoint::new("", 7000, Family::Any, Kind::Stream);
        let targets = ep.resolve().unwrap();
        assert_eq!(targets.len(), 2);
        assert!(matches!(targets[0], Target::Inet(a) if a.is_ipv4()));
        assert!(matches!(targets[1], Target::Inet(a) if a.is_ipv6()));
    }

    #[test]
    fn family_filter_rejects_mismatched_literal() {
        let ep = Endpoint::new("127.0.0.1", 7000, Family::Inet6, Kind::Stream);
        assert!(matches!(ep.resolve(), Err(EndpointError::FamilyMismatch { .. })));
    }

    #[test]
    fn local_path_must_be_absolute() {
        let ep = Endpoint::local("run/mgr.sock");
        assert!(matches!(ep.resolve(), Err(EndpointError::RelativePath(_))));

        let ep = Endpoint::local("/run/mgr.sock");
        assert_eq!(ep.resolve().unwrap(), vec![Target::Local(PathBuf::from("/run/mgr.sock"))]);
    }

    #[test]
    fn display_is_scheme_prefixed() {
        assert_eq!(
            Endpoint::new("", 80, Family::Any, Kind::Stream).to_string(),
            "tcp://*:80"
        );
        assert_eq!(
            Endpoint::new("10.0.0.1", 53, Family::Inet, Kind::Datagram).to_string(),
            "udp://10.0.0.1:53"
        );
        assert_eq!(Endpoint::local("/tmp/x.sock").to_string(), "local:///tmp/x.sock");
    }
}
