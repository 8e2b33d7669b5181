//! SOCKS5 message codec (RFC 1928)
//!
//! Only the "no authentication required" method and the CONNECT command are
//! served. Parsing is strict: a message whose byte count disagrees with its
//! own length fields is rejected.

use super::{Address, ProxyError};
use bytes::{BufMut, BytesMut};

/// SOCKS5 version
pub const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// A parsed request message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Address,
}

/// Parse a method-selection message and pick the method to answer with.
///
/// Returns `AuthMethod::NoAcceptable` when the client does not offer
/// "no authentication required"; the caller replies and closes.
pub fn select_method(data: &[u8]) -> Result<AuthMethod, ProxyError> {
    let [version, nmethods, methods @ ..] = data else {
        return Err(ProxyError::Malformed("greeting shorter than 2 bytes"));
    };
    if *version != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(*version));
    }
    if methods.len() != *nmethods as usize {
        return Err(ProxyError::Malformed("method count mismatch"));
    }

    if methods.contains(&(AuthMethod::NoAuth as u8)) {
        Ok(AuthMethod::NoAuth)
    } else {
        Ok(AuthMethod::NoAcceptable)
    }
}

/// Encode the method-selection reply
pub fn method_reply(method: AuthMethod) -> [u8; 2] {
    [SOCKS_VERSION, method as u8]
}

/// Parse a request message
pub fn parse_request(data: &[u8]) -> Result<Request, ProxyError> {
    let [version, command, reserved, atyp, rest @ ..] = data else {
        return Err(ProxyError::Malformed("request shorter than 4 bytes"));
    };
    if *version != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(*version));
    }
    let command = Command::try_from(*command)?;
    if *reserved != 0 {
        return Err(ProxyError::Malformed("non-zero reserved byte"));
    }

    let address = match AddressType::try_from(*atyp)? {
        AddressType::Ipv4 => {
            let [a, b, c, d, p0, p1] = rest else {
                return Err(ProxyError::Malformed("IPv4 request length"));
            };
            Address::Ipv4([*a, *b, *c, *d], u16::from_be_bytes([*p0, *p1]))
        }
        AddressType::Ipv6 => {
            if rest.len() != 18 {
                return Err(ProxyError::Malformed("IPv6 request length"));
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&rest[..16]);
            Address::Ipv6(ip, u16::from_be_bytes([rest[16], rest[17]]))
        }
        AddressType::Domain => {
            let [len, body @ ..] = rest else {
                return Err(ProxyError::Malformed("missing domain length"));
            };
            let len = *len as usize;
            if len == 0 || body.len() != len + 2 {
                return Err(ProxyError::Malformed("domain request length"));
            }
            let raw = &body[..len];
            if !raw.is_ascii() {
                return Err(ProxyError::Malformed("domain is not ASCII"));
            }
            let domain = raw.iter().map(|&b| char::from(b)).collect();
            Address::Domain(domain, u16::from_be_bytes([body[len], body[len + 1]]))
        }
    };

    Ok(Request { command, address })
}

/// Append a reply message to `out`.
///
/// Failure replies without a bound address carry `0.0.0.0:0`.
pub fn write_reply(out: &mut BytesMut, reply: Reply, bound: Option<&Address>) {
    out.put_u8(SOCKS_VERSION);
    out.put_u8(reply as u8);
    out.put_u8(0x00);

    match bound {
        Some(Address::Ipv4(ip, port)) => {
            out.put_u8(AddressType::Ipv4 as u8);
            out.put_slice(ip);
            out.put_u16(*port);
        }
        Some(Address::Ipv6(ip, port)) => {
            out.put_u8(AddressType::Ipv6 as u8);
            out.put_slice(ip);
            out.put_u16(*port);
        }
        Some(Address::Domain(domain, port)) => {
            let domain = &domain.as_bytes()[..domain.len().min(255)];
            out.put_u8(AddressType::Domain as u8);
            out.put_u8(domain.len() as u8);
            out.put_slice(domain);
            out.put_u16(*port);
        }
        None => {
            out.put_u8(AddressType::Ipv4 as u8);
            out.put_slice(&[0, 0, 0, 0]);
            out.put_u16(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_no_auth() {
        let method = select_method(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(method, AuthMethod::NoAuth);
        assert_eq!(method_reply(method), [0x05, 0x00]);

        let method = select_method(&[0x05, 0x02, 0x02, 0x00]).unwrap();
        assert_eq!(method, AuthMethod::NoAuth);
    }

    #[test]
    fn test_select_no_acceptable() {
        let method = select_method(&[0x05, 0x01, 0x02]).unwrap();
        assert_eq!(method, AuthMethod::NoAcceptable);
        assert_eq!(method_reply(method), [0x05, 0xFF]);
    }

    #[test]
    fn test_select_malformed() {
        assert!(matches!(
            select_method(&[0x04, 0x01, 0x00]),
            Err(ProxyError::InvalidSocksVersion(4))
        ));
        assert!(select_method(&[0x05]).is_err());
        assert!(select_method(&[0x05, 0x02, 0x00]).is_err());
        assert!(select_method(&[0x05, 0x01, 0x00, 0x02]).is_err());
    }

    #[test]
    fn test_parse_ipv4_connect() {
        let req = parse_request(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90]).unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, Address::Ipv4([127, 0, 0, 1], 8080));
    }

    #[test]
    fn test_parse_domain_and_ipv6() {
        let mut data = vec![0x05, 0x01, 0x00, 0x03, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&443u16.to_be_bytes());
        let req = parse_request(&data).unwrap();
        assert_eq!(req.address, Address::Domain("example.com".to_string(), 443));

        let mut data = vec![0x05, 0x01, 0x00, 0x04];
        data.extend_from_slice(&[0u8; 15]);
        data.push(1);
        data.extend_from_slice(&22u16.to_be_bytes());
        let req = parse_request(&data).unwrap();
        let mut ip = [0u8; 16];
        ip[15] = 1;
        assert_eq!(req.address, Address::Ipv6(ip, 22));
    }

    #[test]
    fn test_parse_known_unsupported_commands() {
        let req = parse_request(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).unwrap();
        assert_eq!(req.command, Command::Bind);
        let req = parse_request(&[0x05, 0x03, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).unwrap();
        assert_eq!(req.command, Command::UdpAssociate);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        // unknown command
        assert!(parse_request(&[0x05, 0x09, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).is_err());
        // reserved byte
        assert!(parse_request(&[0x05, 0x01, 0x01, 0x01, 1, 2, 3, 4, 0, 80]).is_err());
        // unknown address type
        assert!(parse_request(&[0x05, 0x01, 0x00, 0x02, 1, 2, 3, 4, 0, 80]).is_err());
        // trailing byte
        assert!(parse_request(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80, 0]).is_err());
        // truncated
        assert!(parse_request(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3]).is_err());
        // domain length mismatch
        assert!(parse_request(&[0x05, 0x01, 0x00, 0x03, 5, b'a', b'b', 0, 80]).is_err());
    }

    #[test]
    fn test_parse_domain_keeps_bytes_or_rejects() {
        let request = parse_request(&[0x05, 0x01, 0x00, 0x03, 3, b'a', b'-', b'b', 0, 80]).unwrap();
        assert_eq!(request.address, Address::Domain("a-b".to_string(), 80));

        assert!(matches!(
            parse_request(&[0x05, 0x01, 0x00, 0x03, 3, b'a', 0xFF, b'b', 0, 80]),
            Err(ProxyError::Malformed(_))
        ));
    }

    #[test]
    fn test_write_reply() {
        let mut out = BytesMut::new();
        write_reply(&mut out, Reply::Succeeded, Some(&Address::Ipv4([10, 0, 0, 2], 4000)));
        assert_eq!(&out[..], &[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x0F, 0xA0]);

        let mut out = BytesMut::new();
        write_reply(&mut out, Reply::CommandNotSupported, None);
        assert_eq!(&out[..], &[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let mut out = BytesMut::new();
        write_reply(
            &mut out,
            Reply::Succeeded,
            Some(&Address::Domain("ab".to_string(), 1)),
        );
        assert_eq!(&out[..], &[0x05, 0x00, 0x00, 0x03, 2, b'a', b'b', 0, 1]);
    }
}
