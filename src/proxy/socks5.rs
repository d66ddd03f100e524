use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{DispatchError, Result};
use crate::proxy::dispatcher::{Dispatcher, InboundKind};
use crate::proxy::socks5_common::{
    AUTH_METHOD_NO_ACCEPTABLE, AUTH_METHOD_NONE, CMD_CONNECT, REPLY_SUCCEEDED, SOCKS5_VERSION,
    reply_message,
};
use crate::proxy::target::TargetDescriptor;

async fn reply(client: &mut TcpStream, code: u8) -> Result<()> {
    client
        .write_all(&[SOCKS5_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Serves one SOCKS5 client: no-auth greeting, CONNECT only.
pub async fn handle_client(
    mut client: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<()> {
    let mut buf = [0u8; 255];
    client.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS5_VERSION {
        return Err(DispatchError::Protocol(format!(
            "unsupported SOCKS version {:#04x}",
            buf[0]
        )));
    }
    let nmethods = buf[1] as usize;
    client.read_exact(&mut buf[..nmethods]).await?;
    if !buf[..nmethods].contains(&AUTH_METHOD_NONE) {
        client
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(DispatchError::Protocol("client offered no usable auth method".into()));
    }
    client.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await?;

    client.read_exact(&mut buf[..4]).await?;
    let (cmd, atyp) = (buf[1], buf[3]);
    if cmd != CMD_CONNECT {
        let err = DispatchError::UnsupportedCommand(cmd);
        reply(&mut client, err.socks_reply()).await?;
        return Err(err);
    }
    let target = match TargetDescriptor::read_socks_addr(&mut client, atyp).await {
        Ok(target) => target,
        Err(err) => {
            reply(&mut client, err.socks_reply()).await?;
            return Err(err);
        }
    };

    let route = match dispatcher.connect(InboundKind::Socks5, peer, target).await {
        Ok(route) => route,
        Err(err) => {
            let code = err.socks_reply();
            debug!("[SOCKS5] {} -> {}", peer, reply_message(code));
            reply(&mut client, code).await?;
            return Err(err);
        }
    };
    reply(&mut client, REPLY_SUCCEEDED).await?;

    let client = dispatcher
        .prepare_client(&route.snapshot, &route.session.target, Box::new(client))
        .await?;
    dispatcher.relay(route, client).await;
    Ok(())
}
