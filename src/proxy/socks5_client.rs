//! SOCKS5 outbound (RFC 1928) with optional username/password auth (RFC 1929).

use std::fmt;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{DispatchError, Result};
use crate::proxy::outbound::{AnyStream, OutboundHandler};
use crate::proxy::socks5_common::{
    AUTH_METHOD_NO_ACCEPTABLE, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD, AUTH_PASSWORD_VERSION,
    CMD_CONNECT, REPLY_SUCCEEDED, SOCKS5_VERSION, reply_message,
};
use crate::proxy::target::TargetDescriptor;

#[derive(Clone)]
pub struct Socks5Outbound {
    server: String,
    port: u16,
    credentials: Option<(String, String)>,
}

impl fmt::Debug for Socks5Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Outbound")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("auth", &self.credentials.is_some())
            .finish()
    }
}

impl Socks5Outbound {
    pub fn new(
        server: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self> {
        let credentials = match (username, password) {
            (Some(user), pass) => {
                let pass = pass.unwrap_or_default();
                if user.len() > 255 || pass.len() > 255 {
                    return Err(DispatchError::config(format!(
                        "socks5 {server}: username and password must be at most 255 bytes"
                    )));
                }
                Some((user, pass))
            }
            (None, _) => None,
        };
        Ok(Self {
            server: server.to_string(),
            port,
            credentials,
        })
    }

    pub fn server_addr(&self) -> String {
        TargetDescriptor::new(&self.server, self.port).to_string()
    }

    /// Runs greeting, optional auth and CONNECT over an established stream.
    pub async fn handshake<S>(&self, stream: &mut S, target: &TargetDescriptor) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let greeting: &[u8] = if self.credentials.is_some() {
            &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS5_VERSION {
            return Err(DispatchError::Protocol(format!(
                "socks5 upstream answered version {:#04x}",
                choice[0]
            )));
        }
        match (choice[1], &self.credentials) {
            (AUTH_METHOD_NONE, _) => {}
            (AUTH_METHOD_PASSWORD, Some((user, pass))) => {
                let mut req = BytesMut::with_capacity(3 + user.len() + pass.len());
                req.put_u8(AUTH_PASSWORD_VERSION);
                req.put_u8(user.len() as u8);
                req.put_slice(user.as_bytes());
                req.put_u8(pass.len() as u8);
                req.put_slice(pass.as_bytes());
                stream.write_all(&req).await?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(DispatchError::Protocol(
                        "socks5 upstream rejected credentials".into(),
                    ));
                }
            }
            (AUTH_METHOD_NO_ACCEPTABLE, _) | (AUTH_METHOD_PASSWORD, None) => {
                return Err(DispatchError::Protocol(
                    "socks5 upstream accepted no offered auth method".into(),
                ));
            }
            (other, _) => {
                return Err(DispatchError::Protocol(format!(
                    "socks5 upstream chose unknown auth method {other:#04x}"
                )));
            }
        }

        let mut req = BytesMut::with_capacity(262);
        req.put_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
        target.encode_socks_addr(&mut req)?;
        stream.write_all(&req).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != REPLY_SUCCEEDED {
            return Err(DispatchError::dial(
                target.to_string(),
                format!("socks5 upstream: {}", reply_message(head[1])),
            ));
        }
        // Bound address, unused.
        TargetDescriptor::read_socks_addr(stream, head[3]).await?;
        Ok(())
    }
}

#[async_trait]
impl OutboundHandler for Socks5Outbound {
    async fn connect(&self, target: &TargetDescriptor) -> Result<AnyStream> {
        let addr = self.server_addr();
        let mut stream = TcpStream::connect((self.server.as_str(), self.port))
            .await
            .map_err(|e| DispatchError::dial(&addr, e))?;
        stream.set_nodelay(true).ok();
        self.handshake(&mut stream, target).await?;
        debug!("[SOCKS5-Out] {} connected via {}", target, addr);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_with_password() {
        let (mut client, mut server) = duplex(1024);
        let outbound =
            Socks5Outbound::new("127.0.0.1", 1080, Some("user".into()), Some("pass".into()))
                .unwrap();

        let upstream = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 11];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x04pass");
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut req = [0u8; 4 + 1 + 11 + 2];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
            assert_eq!(&req[5..16], b"example.com");
            assert_eq!(&req[16..], &443u16.to_be_bytes());
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = TargetDescriptor::new("example.com", 443);
        outbound.handshake(&mut client, &target).await.unwrap();
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_reply() {
        let (mut client, mut server) = duplex(1024);
        let outbound = Socks5Outbound::new("127.0.0.1", 1080, None, None).unwrap();

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = [0u8; 10];
            server.read_exact(&mut req).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = TargetDescriptor::new("10.1.2.3", 80);
        let err = outbound.handshake(&mut client, &target).await.unwrap_err();
        assert!(matches!(err, DispatchError::Dial { .. }));
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, mut server) = duplex(1024);
        let outbound = Socks5Outbound::new("127.0.0.1", 1080, None, None).unwrap();

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let target = TargetDescriptor::new("example.com", 80);
        let err = outbound.handshake(&mut client, &target).await.unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
    }

    #[test]
    fn test_overlong_username_is_config_error() {
        let long = "u".repeat(256);
        assert!(Socks5Outbound::new("h", 1, Some(long), None).is_err());
    }
}
