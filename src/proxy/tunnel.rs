//! Encrypted tunnel outbound: a cipher stream to the server, opened with the
//! SOCKS-style address of the real target.

use std::fmt;

use async_trait::async_trait;
use bytes::BytesMut;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{DispatchError, Result};
use crate::proxy::cipher::{CipherConstructor, CipherRegistry, CipherStream};
use crate::proxy::outbound::{AnyStream, OutboundHandler};
use crate::proxy::target::TargetDescriptor;

#[derive(Clone)]
pub struct TunnelOutbound {
    server: String,
    port: u16,
    cipher: String,
    password: String,
    constructor: CipherConstructor,
}

impl fmt::Debug for TunnelOutbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelOutbound")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("cipher", &self.cipher)
            .finish()
    }
}

impl TunnelOutbound {
    pub fn new(
        server: &str,
        port: u16,
        cipher: &str,
        password: &str,
        registry: &CipherRegistry,
    ) -> Result<Self> {
        let constructor = registry.constructor(cipher)?;
        Ok(Self {
            server: server.to_string(),
            port,
            cipher: cipher.to_ascii_lowercase(),
            password: password.to_string(),
            constructor,
        })
    }

    pub fn server_addr(&self) -> String {
        TargetDescriptor::new(&self.server, self.port).to_string()
    }

    /// Wraps `inner` and sends the target header. The header is flushed
    /// together with the first encrypted frame.
    pub async fn wrap<S>(&self, inner: S, target: &TargetDescriptor) -> Result<CipherStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = CipherStream::new(inner, (self.constructor)(&self.password));
        let mut header = BytesMut::with_capacity(262);
        target.encode_socks_addr(&mut header)?;
        stream.write_all(&header).await?;
        stream.flush().await?;
        Ok(stream)
    }
}

#[async_trait]
impl OutboundHandler for TunnelOutbound {
    async fn connect(&self, target: &TargetDescriptor) -> Result<AnyStream> {
        let addr = self.server_addr();
        let stream = TcpStream::connect((self.server.as_str(), self.port))
            .await
            .map_err(|e| DispatchError::dial(&addr, e))?;
        stream.set_nodelay(true).ok();
        let stream = self.wrap(stream, target).await?;
        debug!("[Tunnel] {} connected via {} ({})", target, addr, self.cipher);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::socks5_common::ATYP_DOMAIN;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_wrap_sends_encrypted_target_header() {
        let registry = CipherRegistry::default();
        let outbound = TunnelOutbound::new("127.0.0.1", 8388, "aes-128-gcm", "pw", &registry)
            .unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);

        let target = TargetDescriptor::new("example.com", 443);
        let mut client = outbound.wrap(client, &target).await.unwrap();
        client.write_all(b"GET /").await.unwrap();
        client.flush().await.unwrap();

        let mut server = CipherStream::new(server, registry.build("aes-128-gcm", "pw").unwrap());
        let atyp = server.read_u8().await.unwrap();
        assert_eq!(atyp, ATYP_DOMAIN);
        let decoded = TargetDescriptor::read_socks_addr(&mut server, atyp)
            .await
            .unwrap();
        assert_eq!(decoded, target);

        let mut body = [0u8; 5];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"GET /");
    }

    #[test]
    fn test_unknown_cipher() {
        let err = TunnelOutbound::new("h", 1, "chacha99", "pw", &CipherRegistry::default())
            .unwrap_err();
        assert!(matches!(err, DispatchError::ConfigInvalid(_)));
    }
}
