//! HTTP CONNECT outbound with optional Basic proxy auth.

use std::fmt;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{DispatchError, Result};
use crate::proxy::outbound::{AnyStream, OutboundHandler};
use crate::proxy::target::TargetDescriptor;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Clone)]
pub struct HttpConnectOutbound {
    server: String,
    port: u16,
    authorization: Option<String>,
}

impl fmt::Debug for HttpConnectOutbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnectOutbound")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("auth", &self.authorization.is_some())
            .finish()
    }
}

impl HttpConnectOutbound {
    pub fn new(
        server: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        let authorization = username.map(|user| {
            let token = STANDARD.encode(format!("{}:{}", user, password.unwrap_or_default()));
            format!("Basic {token}")
        });
        Self {
            server: server.to_string(),
            port,
            authorization,
        }
    }

    pub fn server_addr(&self) -> String {
        TargetDescriptor::new(&self.server, self.port).to_string()
    }

    /// Sends CONNECT and consumes the response head. Nothing past the blank
    /// line is read, so the stream is positioned at the first tunnelled byte.
    pub async fn handshake<S>(&self, stream: &mut S, target: &TargetDescriptor) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = &self.authorization {
            req.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        req.push_str("\r\n");
        stream.write_all(req.as_bytes()).await?;

        let head = read_response_head(stream).await?;
        let status_line = head.lines().next().unwrap_or_default();
        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or_default();
        let code = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(DispatchError::Protocol(format!(
                "http upstream sent {status_line:?}"
            )));
        }
        if code != "200" {
            return Err(DispatchError::dial(
                target.to_string(),
                format!("http upstream answered {}", status_line.trim()),
            ));
        }
        Ok(())
    }
}

async fn read_response_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(DispatchError::Protocol("http upstream response head too large".into()));
        }
        head.push(stream.read_u8().await?);
    }
    String::from_utf8(head)
        .map_err(|_| DispatchError::Protocol("http upstream response is not UTF-8".into()))
}

#[async_trait]
impl OutboundHandler for HttpConnectOutbound {
    async fn connect(&self, target: &TargetDescriptor) -> Result<AnyStream> {
        let addr = self.server_addr();
        let mut stream = TcpStream::connect((self.server.as_str(), self.port))
            .await
            .map_err(|e| DispatchError::dial(&addr, e))?;
        stream.set_nodelay(true).ok();
        self.handshake(&mut stream, target).await?;
        debug!("[HTTP-Out] {} connected via {}", target, addr);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn read_request(server: &mut tokio::io::DuplexStream) -> String {
        read_response_head(server).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_with_basic_auth() {
        let (mut client, mut server) = duplex(4096);
        let outbound = HttpConnectOutbound::new(
            "127.0.0.1",
            8080,
            Some("user".into()),
            Some("pass".into()),
        );

        let upstream = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert!(req.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            assert!(req.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\nVia: x\r\n\r\npayload")
                .await
                .unwrap();
        });

        let target = TargetDescriptor::new("example.com", 443);
        outbound.handshake(&mut client, &target).await.unwrap();
        let mut rest = [0u8; 7];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_200_is_dial_error() {
        let (mut client, mut server) = duplex(4096);
        let outbound = HttpConnectOutbound::new("127.0.0.1", 8080, None, None);

        tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert!(!req.contains("Proxy-Authorization"));
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let target = TargetDescriptor::new("example.com", 443);
        let err = outbound.handshake(&mut client, &target).await.unwrap_err();
        assert!(matches!(err, DispatchError::Dial { .. }));
    }

    #[tokio::test]
    async fn test_garbage_is_protocol_error() {
        let (mut client, mut server) = duplex(4096);
        let outbound = HttpConnectOutbound::new("127.0.0.1", 8080, None, None);

        tokio::spawn(async move {
            read_request(&mut server).await;
            server.write_all(b"SSH-2.0-OpenSSH\r\n\r\n").await.unwrap();
        });

        let target = TargetDescriptor::new("example.com", 443);
        let err = outbound.handshake(&mut client, &target).await.unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
    }
}
