use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Proxy;
use crate::error::{DispatchError, Result};
use crate::proxy::cipher::CipherRegistry;
use crate::proxy::direct::DirectOutbound;
use crate::proxy::http_connect::HttpConnectOutbound;
use crate::proxy::socks5_client::Socks5Outbound;
use crate::proxy::target::TargetDescriptor;
use crate::proxy::tunnel::TunnelOutbound;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type AnyStream = Box<dyn AsyncStream>;

/// One outbound protocol: connect and complete the handshake so that the
/// returned stream carries the target's bytes.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn connect(&self, target: &TargetDescriptor) -> Result<AnyStream>;
}

#[derive(Debug, Clone)]
pub enum Protocol {
    Direct,
    Socks5(Socks5Outbound),
    HttpConnect(HttpConnectOutbound),
    EncryptedTunnel(TunnelOutbound),
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Socks5(_) => "socks5",
            Self::HttpConnect(_) => "http",
            Self::EncryptedTunnel(_) => "ss",
        }
    }

    fn handler(&self) -> &dyn OutboundHandler {
        match self {
            Self::Direct => &DirectOutbound,
            Self::Socks5(h) => h,
            Self::HttpConnect(h) => h,
            Self::EncryptedTunnel(h) => h,
        }
    }
}

/// A configured upstream endpoint, shared read-only by every group that
/// lists it.
#[derive(Debug, Clone)]
pub struct NodeRef {
    id: String,
    protocol: Protocol,
}

impl NodeRef {
    pub fn new(id: impl Into<String>, protocol: Protocol) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            protocol,
        })
    }

    /// Unknown ciphers are rejected here so a bad node never reaches a snapshot.
    pub fn from_config(proxy: &Proxy, ciphers: &CipherRegistry) -> Result<Arc<Self>> {
        let protocol = match proxy {
            Proxy::Direct { .. } => Protocol::Direct,
            Proxy::Socks5 {
                server,
                port,
                username,
                password,
                ..
            } => Protocol::Socks5(Socks5Outbound::new(
                server,
                *port,
                username.clone(),
                password.clone(),
            )?),
            Proxy::Http {
                server,
                port,
                username,
                password,
                ..
            } => Protocol::HttpConnect(HttpConnectOutbound::new(
                server,
                *port,
                username.clone(),
                password.clone(),
            )),
            Proxy::Shadowsocks {
                server,
                port,
                cipher,
                password,
                ..
            } => Protocol::EncryptedTunnel(TunnelOutbound::new(
                server, *port, cipher, password, ciphers,
            )?),
        };
        Ok(Self::new(proxy.name(), protocol))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// `host:port` of the upstream, or `None` for direct nodes.
    pub fn server_addr(&self) -> Option<String> {
        match &self.protocol {
            Protocol::Direct => None,
            Protocol::Socks5(h) => Some(h.server_addr()),
            Protocol::HttpConnect(h) => Some(h.server_addr()),
            Protocol::EncryptedTunnel(h) => Some(h.server_addr()),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.protocol.name())
    }
}

/// Dials `target` through `node`, or directly when no node was picked.
///
/// Connect and handshake share one deadline. On expiry the in-progress
/// connection is dropped and `HandshakeTimeout` is returned.
pub async fn dial(
    node: Option<&NodeRef>,
    target: &TargetDescriptor,
    deadline: Duration,
) -> Result<AnyStream> {
    let (handler, addr) = match node {
        Some(node) => (
            node.protocol.handler(),
            node.server_addr().unwrap_or_else(|| target.to_string()),
        ),
        None => (&DirectOutbound as &dyn OutboundHandler, target.to_string()),
    };
    debug!(
        "[Outbound] dialing {} via {}",
        target,
        node.map_or("DIRECT".to_string(), |n| n.to_string())
    );
    // Resets and EOFs before the stream is handed back belong to the node.
    match tokio::time::timeout(deadline, handler.connect(target)).await {
        Ok(Err(DispatchError::Io(e))) => Err(DispatchError::dial(&addr, e)),
        Ok(result) => result,
        Err(_) => Err(DispatchError::HandshakeTimeout { addr }),
    }
}
