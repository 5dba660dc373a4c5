//! Network endpoint of a cluster member.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("cannot resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },
    #[error("{0} resolves to no address")]
    NoAddress(String),
}

/// Address a member listens on for peer connections.
///
/// Every member must list the same endpoints, since partition ids follow the
/// member names and peers connect to exactly these addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Loopback endpoint, for single-host clusters.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Parses `ip:port` directly and resolves `host:port` through the system
/// resolver, preferring an IPv4 address.
impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }
        let resolved: Vec<SocketAddr> = s
            .to_socket_addrs()
            .map_err(|source| EndpointError::Resolve {
                addr: s.to_owned(),
                source,
            })?
            .collect();
        resolved
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| resolved.first())
            .map(|addr| Self(*addr))
            .ok_or_else(|| EndpointError::NoAddress(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_parse_without_lookup() {
        let ep: Endpoint = "10.1.2.3:4500".parse().unwrap();
        assert_eq!(ep.as_socket_addr(), "10.1.2.3:4500".parse::<SocketAddr>().unwrap());
        assert_eq!(ep.to_string(), "10.1.2.3:4500");
    }

    #[test]
    fn host_names_resolve() {
        let ep: Endpoint = "localhost:7000".parse().unwrap();
        assert!(ep.as_socket_addr().ip().is_loopback());
        assert_eq!(ep.as_socket_addr().port(), 7000);
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(matches!(
            "10.1.2.3".parse::<Endpoint>(),
            Err(EndpointError::Resolve { .. })
        ));
    }

    #[test]
    fn localhost_is_loopback_v4() {
        assert_eq!(Endpoint::localhost(3000).to_string(), "127.0.0.1:3000");
    }
}
