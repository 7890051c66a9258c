use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::message::Message;

/// Failures starting the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read relay listener address")]
    LocalAddr(#[source] io::Error),
}

/// Why a `send` produced no reply. Each variant maps onto one wire status
/// code; see [`SendError::status`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("relay is not running")]
    NotRunning,
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("wait for a reply was interrupted")]
    Interrupted,
    #[error("send failed: {0}")]
    Failed(String),
    #[error("reply channel closed without a payload")]
    NoReply,
    #[error("relay was shut down")]
    Shutdown,
}

impl SendError {
    pub fn status(&self) -> &'static str {
        match self {
            SendError::InvalidMessage(_) => "invalid_message",
            SendError::NotRunning => "socket_not_running",
            SendError::Timeout => "socket_timeout",
            SendError::Interrupted => "socket_interrupted",
            SendError::Failed(_) => "socket_error",
            SendError::NoReply => "socket_no_reply",
            SendError::Shutdown => "socket_shutdown",
        }
    }

    /// Structured `{"status", "message"}` form returned to hosts.
    pub fn into_response(self) -> Message {
        Message::error(self.status(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_carry_the_wire_status() {
        let response = SendError::Timeout.into_response();
        assert_eq!(response.status(), Some("socket_timeout"));
        assert_eq!(
            response.get("message").and_then(|value| value.as_str()),
            Some("timed out waiting for a reply")
        );
        assert_eq!(
            SendError::InvalidMessage("message is null".into()).status(),
            "invalid_message"
        );
    }
}
