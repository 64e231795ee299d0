use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Relay target address, in SOCKS5 wire encoding on the stream:
/// `0x01` + 4-byte IPv4, `0x03` + length-prefixed hostname, or
/// `0x04` + 16-byte IPv6, each followed by a big-endian port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Read a SOCKS5-encoded address from an async stream.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let atyp = r.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    anyhow::bail!("empty domain name");
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let domain = String::from_utf8(name)?;
                let port = r.read_u16().await?;
                Ok(Address::Domain(domain, port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            _ => anyhow::bail!("unsupported address type: 0x{:02x}", atyp),
        }
    }

    /// Parse a SOCKS5-encoded address from the front of a datagram payload.
    /// Returns the address and the number of bytes consumed.
    pub fn parse_from_slice(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.is_empty() {
            anyhow::bail!("empty address");
        }
        match buf[0] {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    anyhow::bail!("truncated IPv4 address");
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)),
                    7,
                ))
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    anyhow::bail!("truncated domain address");
                }
                let len = buf[1] as usize;
                if len == 0 {
                    anyhow::bail!("empty domain name");
                }
                if buf.len() < 2 + len + 2 {
                    anyhow::bail!("truncated domain address");
                }
                let domain = String::from_utf8(buf[2..2 + len].to_vec())?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Address::Domain(domain, port), 2 + len + 2))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    anyhow::bail!("truncated IPv6 address");
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            other => anyhow::bail!("unsupported address type: 0x{:02x}", other),
        }
    }

    /// Append the SOCKS5 encoding of this address to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// Resolve to a socket address using the OS resolver.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let addr_str = format!("{}:{}", domain, port);
                let (domain, port) = (domain.clone(), *port);
                let resolved = tokio::task::spawn_blocking(move || addr_str.to_socket_addrs())
                    .await??
                    .next()
                    .ok_or_else(|| {
                        anyhow::anyhow!("DNS resolution failed for {}:{}", domain, port)
                    })?;
                Ok(resolved)
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
