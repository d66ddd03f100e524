//! Error taxonomy of the dispatch engine.
//!
//! Configuration errors are fatal at startup and reject a reload; every other
//! variant is scoped to one session and is recovered by the task that owns it.

use std::io;

use hyper::StatusCode;
use thiserror::Error;

use crate::proxy::socks5_common::{
    REPLY_ADDRESS_TYPE_NOT_SUPPORTED, REPLY_COMMAND_NOT_SUPPORTED, REPLY_CONNECTION_REFUSED,
    REPLY_GENERAL_FAILURE, REPLY_HOST_UNREACHABLE, REPLY_NOT_ALLOWED,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No default rule, a policy without a group, a bad member list...
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Only reachable if the mandatory `FINAL` rule invariant was bypassed.
    #[error("no rule matched {0}")]
    NoMatch(String),

    #[error("session rejected by policy")]
    PolicyRejected,

    #[error("no available node in group {group}")]
    NoAvailableNode { group: String },

    #[error("handshake with {addr} timed out")]
    HandshakeTimeout { addr: String },

    #[error("dial {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    #[error("relay idle timeout")]
    IdleTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("command not supported: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("address type not supported: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    pub fn dial(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Dial {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Failures that count against the node that was dialed.
    #[must_use]
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. } | Self::Dial { .. } | Self::Protocol(_)
        )
    }

    /// SOCKS5 reply code sent to the client when a session fails before relay.
    #[must_use]
    pub fn socks_reply(&self) -> u8 {
        match self {
            Self::PolicyRejected => REPLY_NOT_ALLOWED,
            Self::HandshakeTimeout { .. } => REPLY_HOST_UNREACHABLE,
            Self::Dial { .. } => REPLY_CONNECTION_REFUSED,
            Self::UnsupportedCommand(_) => REPLY_COMMAND_NOT_SUPPORTED,
            Self::UnsupportedAddressType(_) => REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            _ => REPLY_GENERAL_FAILURE,
        }
    }

    /// HTTP status answered to a proxy client when a session fails before relay.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::PolicyRejected => StatusCode::FORBIDDEN,
            Self::NoAvailableNode { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::HandshakeTimeout { .. } | Self::IdleTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Dial { .. } | Self::Protocol(_) => StatusCode::BAD_GATEWAY,
            Self::UnsupportedCommand(_) | Self::UnsupportedAddressType(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
