//! Session header and protocol constants
//!
//! Every logical session opens with one data frame whose payload is the
//! encoded target [`Address`] and whose flags carry the session protocol.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    #[error("Truncated address: need {needed} bytes, got {actual}")]
    TruncatedAddress { needed: usize, actual: usize },

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported session protocol: {0:#04x}")]
    UnsupportedProtocol(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upper bound on one run of the FIN/ACK close handshake
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long the server waits for the next session on a reused connection
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Copy buffer size of each relay direction
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Address type tags, SOCKS5 numbering
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Session target address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
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

    /// Size of the encoded form
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ipv4(..) => 1 + 4 + 2,
            Address::Ipv6(..) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Append `ATYP | address | port` to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Address::Ipv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::Ipv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::Domain(domain, port) => {
                check_domain(domain)?;
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode an address from the front of `data`
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let atyp = *data.first().ok_or(ProtocolError::TruncatedAddress {
            needed: 1,
            actual: 0,
        })?;

        let need = |needed: usize| {
            if data.len() < needed {
                Err(ProtocolError::TruncatedAddress {
                    needed,
                    actual: data.len(),
                })
            } else {
                Ok(())
            }
        };

        match atyp {
            ATYP_IPV4 => {
                need(7)?;
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&data[1..5]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ipv4(ip, port), 7))
            }
            ATYP_IPV6 => {
                need(19)?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::Ipv6(ip, port), 19))
            }
            ATYP_DOMAIN => {
                need(2)?;
                let len = data[1] as usize;
                let total = 2 + len + 2;
                need(total)?;
                let domain = std::str::from_utf8(&data[2..2 + len])
                    .map_err(|_| ProtocolError::InvalidDomain("not valid UTF-8".into()))?
                    .to_string();
                check_domain(&domain)?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Address::Domain(domain, port), total))
            }
            other => Err(ProtocolError::InvalidAddressType(other)),
        }
    }

    /// Read `address | port` for an already consumed `atyp` tag
    pub async fn read_from<R>(reader: &mut R, atyp: u8) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await?;
                Ok(Address::Ipv4(ip, reader.read_u16().await?))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await?;
                Ok(Address::Ipv6(ip, reader.read_u16().await?))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut raw = vec![0u8; len];
                reader.read_exact(&mut raw).await?;
                let domain = String::from_utf8(raw)
                    .map_err(|_| ProtocolError::InvalidDomain("not valid UTF-8".into()))?;
                check_domain(&domain)?;
                Ok(Address::Domain(domain, reader.read_u16().await?))
            }
            other => Err(ProtocolError::InvalidAddressType(other)),
        }
    }
}

fn check_domain(domain: &str) -> Result<(), ProtocolError> {
    if domain.is_empty() {
        return Err(ProtocolError::InvalidDomain("empty".into()));
    }
    if domain.len() > 255 {
        return Err(ProtocolError::InvalidDomain(format!(
            "{} bytes exceeds 255",
            domain.len()
        )));
    }
    Ok(())
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => Address::Ipv6(v6.ip().octets(), v6.port()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    /// Parse `host:port`, with IPv6 hosts in brackets
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::InvalidAddress(format!("missing port in '{}'", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ProtocolError::InvalidAddress(format!("invalid port in '{}'", s)))?;

        if host.contains(':') || host.starts_with('[') {
            return Err(ProtocolError::InvalidAddress(format!("malformed host in '{}'", s)));
        }
        check_domain(host)?;
        Ok(Address::Domain(host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_wire_format() {
        let addr = Address::Ipv4([192, 168, 1, 10], 8080);
        let encoded = addr.encode().unwrap();
        assert_eq!(&encoded[..], &[0x01, 192, 168, 1, 10, 0x1f, 0x90]);

        let (decoded, used) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, 7);
    }

    #[test]
    fn test_domain_with_trailing_bytes() {
        let addr = Address::Domain("example.com".into(), 443);
        let mut buf = BytesMut::new();
        addr.write_to(&mut buf).unwrap();
        buf.put_slice(b"rest");

        let (decoded, used) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, addr.encoded_len());
        assert_eq!(&buf[used..], b"rest");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Address::decode(&[]),
            Err(ProtocolError::TruncatedAddress { .. })
        ));
        assert!(matches!(
            Address::decode(&[0x01, 1, 2, 3]),
            Err(ProtocolError::TruncatedAddress { needed: 7, actual: 4 })
        ));
        assert!(matches!(
            Address::decode(&[0x05, 0, 0]),
            Err(ProtocolError::InvalidAddressType(0x05))
        ));
        assert!(matches!(
            Address::decode(&[0x03, 0, 0, 80]),
            Err(ProtocolError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_oversized_domain_rejected() {
        let addr = Address::Domain("a".repeat(256), 80);
        assert!(matches!(addr.encode(), Err(ProtocolError::InvalidDomain(_))));
    }

    #[test]
    fn test_parse_and_display() {
        let cases = [
            ("127.0.0.1:80", Address::Ipv4([127, 0, 0, 1], 80)),
            ("example.com:443", Address::Domain("example.com".into(), 443)),
            (
                "[::1]:8080",
                Address::Ipv6(Ipv6Addr::LOCALHOST.octets(), 8080),
            ),
        ];
        for (text, expected) in cases {
            let parsed: Address = text.parse().unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(parsed.to_string(), text);
        }

        assert!("example.com".parse::<Address>().is_err());
        assert!("example.com:http".parse::<Address>().is_err());
        assert!("::1:80".parse::<Address>().is_err());
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let addr = Address::Domain("relay.test".into(), 9000);
        let encoded = addr.encode().unwrap();

        let mut reader = &encoded[1..];
        let read = Address::read_from(&mut reader, encoded[0]).await.unwrap();
        assert_eq!(read, addr);
    }
}
