//! Uniform description of where an inbound connection wants to go.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{DispatchError, Result};
use crate::proxy::socks5_common::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
}

/// Destination of one session.
///
/// Built once per connection by the inbound that accepted it. Resolution never
/// mutates a descriptor in place; [`TargetDescriptor::with_resolved_ip`]
/// returns a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    host: String,
    port: u16,
    is_ip: bool,
    resolved_ip: Option<IpAddr>,
    transport: Transport,
}

impl TargetDescriptor {
    /// Normalizes `host`: lower-case, no trailing dot, no IPv6 brackets.
    pub fn new(host: &str, port: u16) -> Self {
        let trimmed = host
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Self::from_ip(ip, port),
            Err(_) => Self {
                host: trimmed.to_ascii_lowercase(),
                port,
                is_ip: false,
                resolved_ip: None,
                transport: Transport::Tcp,
            },
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: ip.to_string(),
            port,
            is_ip: true,
            resolved_ip: Some(ip),
            transport: Transport::Tcp,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip(), addr.port())
    }

    /// Parses `host:port` / `[v6]:port`; `default_port` applies when the port is absent.
    pub fn parse_authority(authority: &str, default_port: Option<u16>) -> Result<Self> {
        let authority: http::uri::Authority = authority
            .parse()
            .map_err(|e| DispatchError::Protocol(format!("bad authority {authority:?}: {e}")))?;
        let port = authority
            .port_u16()
            .or(default_port)
            .ok_or_else(|| DispatchError::Protocol(format!("missing port in {authority}")))?;
        Ok(Self::new(authority.host(), port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ip(&self) -> bool {
        self.is_ip
    }

    pub fn resolved_ip(&self) -> Option<IpAddr> {
        self.resolved_ip
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn with_resolved_ip(&self, ip: IpAddr) -> Self {
        Self {
            resolved_ip: Some(ip),
            ..self.clone()
        }
    }

    /// Address handed to `TcpStream::connect` when dialing the target itself.
    pub fn connect_addr(&self) -> String {
        match self.resolved_ip {
            Some(ip) => SocketAddr::new(ip, self.port).to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// SOCKS5 address (ATYP, ADDR, PORT). Hostnames are always sent as domains
    /// so the far end resolves them itself.
    pub fn encode_socks_addr(&self, buf: &mut BytesMut) -> Result<()> {
        match (self.is_ip, self.resolved_ip) {
            (true, Some(IpAddr::V4(v4))) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&v4.octets());
            }
            (true, Some(IpAddr::V6(v6))) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&v6.octets());
            }
            _ => {
                let host = self.host.as_bytes();
                if host.len() > u8::MAX as usize {
                    return Err(DispatchError::Protocol(format!(
                        "domain too long: {} bytes",
                        host.len()
                    )));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(host.len() as u8);
                buf.put_slice(host);
            }
        }
        buf.put_u16(self.port);
        Ok(())
    }

    /// Reads ADDR and PORT for an already consumed `atyp` byte.
    pub async fn read_socks_addr<R>(reader: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let target = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Self::from_ip(IpAddr::V4(Ipv4Addr::from(octets)), port)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Self::from_ip(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let port = reader.read_u16().await?;
                let name = String::from_utf8(name)
                    .map_err(|_| DispatchError::Protocol("domain is not UTF-8".into()))?;
                Self::new(&name, port)
            }
            other => return Err(DispatchError::UnsupportedAddressType(other)),
        };
        Ok(target)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
