//! Local proxy front end
//!
//! Provides:
//! - SOCKS5 message parsing and reply encoding (RFC 1928 subset)
//! - Target address representation shared by both hops

pub mod socks5;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Malformed message: {0}")]
    Malformed(&'static str),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Resolve to a socket address, using the system resolver for domains
    pub fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            Address::Ipv4(ip, port) => Ok(SocketAddr::new(IpAddr::from(*ip), *port)),
            Address::Ipv6(ip, port) => Ok(SocketAddr::new(IpAddr::from(*ip), *port)),
            Address::Domain(domain, port) => (domain.as_str(), *port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no address found for {}", domain),
                    )
                }),
        }
    }

    /// Replace a domain name by its first resolved IP address.
    ///
    /// Resolution failure is not an error: the domain is kept and left for
    /// the far end to resolve.
    pub fn resolve_domain(self) -> Self {
        match self {
            Address::Domain(ref domain, _) => match self.resolve() {
                Ok(addr) => {
                    tracing::debug!("Resolved {} locally to {}", domain, addr.ip());
                    Address::from(addr)
                }
                Err(e) => {
                    tracing::warn!("Local resolution of {} failed: {}", domain, e);
                    self
                }
            },
            other => other,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => Address::Ipv4(v4.octets(), addr.port()),
                None => Address::Ipv6(ip.octets(), addr.port()),
            },
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
