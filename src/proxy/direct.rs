use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;

use crate::error::{DispatchError, Result};
use crate::proxy::outbound::{AnyStream, OutboundHandler};
use crate::proxy::target::TargetDescriptor;

/// Connects straight to the target, preferring an address the rule engine
/// already resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectOutbound;

#[async_trait]
impl OutboundHandler for DirectOutbound {
    async fn connect(&self, target: &TargetDescriptor) -> Result<AnyStream> {
        let addr = target.connect_addr();
        debug!("[Direct] connecting to {}", addr);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| DispatchError::dial(addr, e))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}
