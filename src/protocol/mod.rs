//! Tunnel handshake protocol
//!
//! The client opens every tunnel connection with a single auth frame and
//! waits for a single reply before relaying:
//!
//! ```text
//! request: version(1) | token(N) | conn type(1) | addr type(1) | [domain len(1)] | addr | port(2)
//! reply:   version(1) | code(1) | [addr type(1) | [domain len(1)] | addr | port(2)]
//! ```
//!
//! The reply carries a bound address only when the code is `Success`.

use crate::proxy::socks5::Reply;
use crate::proxy::Address;
use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Truncated message: {0}")]
    Truncated(&'static str),

    #[error("Invalid address type: {0}")]
    InvalidAddressType(u8),

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("Domain name is empty or longer than 255 bytes")]
    InvalidDomain,
}

/// Tunnel protocol version
pub const TUNNEL_VERSION: u8 = 1;

/// Requested connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Tcp,
    Udp,
    Unknown(u8),
}

impl From<u8> for ConnectionType {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionType::Tcp,
            1 => ConnectionType::Udp,
            other => ConnectionType::Unknown(other),
        }
    }
}

impl From<ConnectionType> for u8 {
    fn from(value: ConnectionType) -> Self {
        match value {
            ConnectionType::Tcp => 0,
            ConnectionType::Udp => 1,
            ConnectionType::Unknown(other) => other,
        }
    }
}

/// Address type codes on the tunnel wire
pub mod address_type {
    pub const IPV4: u8 = 0;
    pub const DOMAIN: u8 = 1;
    pub const IPV6: u8 = 2;
}

/// Tunnel reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Success,
    AuthFail,
    ConnectionTypeNotSupported,
    NetworkUnreachable,
    HostUnreachable,
    GeneralFail,
    Unknown(u8),
}

impl From<u8> for ReplyCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ReplyCode::Success,
            1 => ReplyCode::AuthFail,
            2 => ReplyCode::ConnectionTypeNotSupported,
            3 => ReplyCode::NetworkUnreachable,
            4 => ReplyCode::HostUnreachable,
            9 => ReplyCode::GeneralFail,
            other => ReplyCode::Unknown(other),
        }
    }
}

impl From<ReplyCode> for u8 {
    fn from(value: ReplyCode) -> Self {
        match value {
            ReplyCode::Success => 0,
            ReplyCode::AuthFail => 1,
            ReplyCode::ConnectionTypeNotSupported => 2,
            ReplyCode::NetworkUnreachable => 3,
            ReplyCode::HostUnreachable => 4,
            ReplyCode::GeneralFail => 9,
            ReplyCode::Unknown(other) => other,
        }
    }
}

impl ReplyCode {
    /// SOCKS5 reply code reported to the local peer for this tunnel reply
    pub fn to_socks(self) -> Reply {
        match self {
            ReplyCode::Success => Reply::Succeeded,
            ReplyCode::AuthFail => Reply::ConnectionNotAllowed,
            ReplyCode::ConnectionTypeNotSupported => Reply::CommandNotSupported,
            ReplyCode::NetworkUnreachable => Reply::NetworkUnreachable,
            ReplyCode::HostUnreachable => Reply::HostUnreachable,
            ReplyCode::GeneralFail | ReplyCode::Unknown(_) => Reply::GeneralFailure,
        }
    }
}

/// Client to server auth frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub token: Vec<u8>,
    pub connection_type: ConnectionType,
    pub address: Address,
}

impl AuthRequest {
    pub fn new(token: Vec<u8>, address: Address) -> Self {
        Self {
            token,
            connection_type: ConnectionType::Tcp,
            address,
        }
    }

    /// Append the encoded frame to `out`
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_u8(TUNNEL_VERSION);
        out.put_slice(&self.token);
        out.put_u8(self.connection_type.into());
        write_address(out, &self.address)
    }

    /// Parse a complete auth frame whose token is `token_len` bytes
    pub fn parse(data: &[u8], token_len: usize) -> Result<Self, ProtocolError> {
        let (&version, rest) = data
            .split_first()
            .ok_or(ProtocolError::Truncated("missing version"))?;
        check_version(version)?;

        if rest.len() < token_len + 1 {
            return Err(ProtocolError::Truncated("token"));
        }
        let (token, rest) = rest.split_at(token_len);
        let connection_type = ConnectionType::from(rest[0]);

        let (address, consumed) = read_address(&rest[1..])?;
        let trailing = rest.len() - 1 - consumed;
        if trailing != 0 {
            return Err(ProtocolError::TrailingBytes(trailing));
        }

        Ok(Self {
            token: token.to_vec(),
            connection_type,
            address,
        })
    }
}

/// Server to client auth reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    pub code: ReplyCode,
    pub bound: Option<Address>,
}

impl AuthReply {
    pub fn success(bound: Address) -> Self {
        Self {
            code: ReplyCode::Success,
            bound: Some(bound),
        }
    }

    pub fn failure(code: ReplyCode) -> Self {
        Self { code, bound: None }
    }

    /// Append the encoded reply to `out`
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_u8(TUNNEL_VERSION);
        out.put_u8(self.code.into());
        match (&self.code, &self.bound) {
            (ReplyCode::Success, Some(bound)) => write_address(out, bound),
            _ => Ok(()),
        }
    }

    /// Parse a reply from the head of `data`.
    ///
    /// Returns the reply and the number of bytes it occupied; anything after
    /// that belongs to the relay stream.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let [version, code, rest @ ..] = data else {
            return Err(ProtocolError::Truncated("reply header"));
        };
        check_version(*version)?;

        let code = ReplyCode::from(*code);
        if code != ReplyCode::Success {
            return Ok((Self::failure(code), 2));
        }

        let (bound, consumed) = read_address(rest)?;
        Ok((Self::success(bound), 2 + consumed))
    }
}

fn check_version(version: u8) -> Result<(), ProtocolError> {
    if version != TUNNEL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: TUNNEL_VERSION,
            actual: version,
        });
    }
    Ok(())
}

/// Append `addr type | [len] | addr | port`
fn write_address(out: &mut BytesMut, address: &Address) -> Result<(), ProtocolError> {
    match address {
        Address::Ipv4(ip, port) => {
            out.put_u8(address_type::IPV4);
            out.put_slice(ip);
            out.put_u16(*port);
        }
        Address::Ipv6(ip, port) => {
            out.put_u8(address_type::IPV6);
            out.put_slice(ip);
            out.put_u16(*port);
        }
        Address::Domain(domain, port) => {
            if domain.is_empty() || domain.len() > 255 {
                return Err(ProtocolError::InvalidDomain);
            }
            out.put_u8(address_type::DOMAIN);
            out.put_u8(domain.len() as u8);
            out.put_slice(domain.as_bytes());
            out.put_u16(*port);
        }
    }
    Ok(())
}

/// Read `addr type | [len] | addr | port`, returning the bytes consumed
fn read_address(data: &[u8]) -> Result<(Address, usize), ProtocolError> {
    let (&atyp, rest) = data
        .split_first()
        .ok_or(ProtocolError::Truncated("missing address type"))?;

    let (start, addr_len) = match atyp {
        address_type::IPV4 => (0, 4),
        address_type::IPV6 => (0, 16),
        address_type::DOMAIN => {
            let len = *rest
                .first()
                .ok_or(ProtocolError::Truncated("missing domain length"))?
                as usize;
            if len == 0 {
                return Err(ProtocolError::InvalidDomain);
            }
            (1, len)
        }
        other => return Err(ProtocolError::InvalidAddressType(other)),
    };

    let end = start + addr_len;
    if rest.len() < end + 2 {
        return Err(ProtocolError::Truncated("address"));
    }
    let raw = &rest[start..end];
    let port = u16::from_be_bytes([rest[end], rest[end + 1]]);

    let address = match atyp {
        address_type::IPV4 => {
            let mut ip = [0u8; 4];
            ip.copy_from_slice(raw);
            Address::Ipv4(ip, port)
        }
        address_type::IPV6 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(raw);
            Address::Ipv6(ip, port)
        }
        _ => {
            if !raw.is_ascii() {
                return Err(ProtocolError::InvalidDomain);
            }
            Address::Domain(raw.iter().map(|&b| char::from(b)).collect(), port)
        }
    };

    Ok((address, 1 + end + 2))
}
