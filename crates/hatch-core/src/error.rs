//! Error taxonomy shared by both ends of a connection.

use crate::{ConnectionState, Identity, MessageKind};
use std::fmt;
use tokio_tungstenite::tungstenite;

/// Failure of a single connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket-level failure: refused, reset, closed.
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    /// A value arrived where the protocol expected something else.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The server refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
}

/// An envelope that must not be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("{0} payload is null")]
    NullPayload(MessageKind),
    #[error("{0} requires a payload")]
    MissingPayload(MessageKind),
    #[error("{0} must not carry a payload")]
    UnexpectedPayload(MessageKind),
    #[error("{kind} payload has the wrong shape: {reason}")]
    PayloadShape { kind: MessageKind, reason: String },
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side.
    Local,
    /// The peer closed the stream cleanly.
    Remote,
    Transport(String),
    Protocol(String),
}

impl CloseReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseReason::Transport(_) | CloseReason::Protocol(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::Remote => f.write_str("closed by peer"),
            CloseReason::Transport(e) => write!(f, "transport failure: {e}"),
            CloseReason::Protocol(e) => write!(f, "protocol violation: {e}"),
        }
    }
}

impl From<&Error> for CloseReason {
    fn from(err: &Error) -> Self {
        match err {
            Error::Transport(e) => CloseReason::Transport(e.to_string()),
            Error::Protocol(e) | Error::Rejected(e) => CloseReason::Protocol(e.clone()),
            Error::Codec(e) => CloseReason::Protocol(format!("malformed frame: {e}")),
        }
    }
}

/// Failed send.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is {0}, not active")]
    NotActive(ConnectionState),
    /// The connection has ended; carries why.
    #[error("connection {0}")]
    Closed(CloseReason),
    #[error("invalid message: {0}")]
    Invalid(#[from] InvalidMessage),
    #[error("no connection with identity {0}")]
    UnknownIdentity(Identity),
    /// The peer did not take the frame in time.
    #[error("send timed out")]
    TimedOut,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Failed blocking receive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("connection {0}")]
    Closed(CloseReason),
}
