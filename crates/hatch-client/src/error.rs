use hatch_core::{CloseReason, MessageKind, RecvError, SendError};
use tokio_tungstenite::tungstenite;

/// Failure to open a session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("failed to send hello: {0}")]
    Hello(#[source] SendError),
    #[error("server rejected the session: {0}")]
    Rejected(String),
    #[error("handshake failed: {0}")]
    Handshake(#[from] hatch_core::Error),
}

impl ClientError {
    /// How the half-open connection is recorded when the handshake fails.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ClientError::Handshake(e) => CloseReason::from(e),
            ClientError::Hello(SendError::Transport(e)) => CloseReason::Transport(e.to_string()),
            ClientError::Connect { .. } | ClientError::Timeout(_) => {
                CloseReason::Transport(self.to_string())
            }
            ClientError::Hello(_) | ClientError::Rejected(_) => CloseReason::Protocol(self.to_string()),
        }
    }
}

/// Failure of a request/response exchange.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0} has no response kind")]
    NoResponse(MessageKind),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Recv(#[from] RecvError),
}
