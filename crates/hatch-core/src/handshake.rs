//! Handshake exchange.
//!
//! The client's first frame is `Hello { identity }`. The server answers with
//! `Welcome` once the connection is registered, or `Reject`. Anything else in
//! either position fails the connection.

use crate::connection::FrameStream;
use crate::{Error, Frame, Identity};
use futures_util::StreamExt;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};

/// Default time either side waits for the other's handshake frame.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read the client's `Hello` and return its identity.
pub async fn read_hello(stream: &mut FrameStream) -> Result<Identity, Error> {
    match next_frame(stream).await? {
        Frame::Hello { identity } if identity.is_unset() => {
            Err(Error::Protocol("hello carried the unset identity".to_string()))
        }
        Frame::Hello { identity } => Ok(identity),
        other => Err(Error::Protocol(format!("expected hello, got {}", other.name()))),
    }
}

/// Read the server's answer to our `Hello`.
pub async fn read_welcome(stream: &mut FrameStream, identity: Identity) -> Result<(), Error> {
    match next_frame(stream).await? {
        Frame::Welcome { identity: echoed } if echoed == identity => Ok(()),
        Frame::Welcome { identity: echoed } => Err(Error::Protocol(format!(
            "welcome for {echoed}, expected {identity}"
        ))),
        Frame::Reject { reason } => Err(Error::Rejected(reason)),
        other => Err(Error::Protocol(format!("expected welcome, got {}", other.name()))),
    }
}

async fn next_frame(stream: &mut FrameStream) -> Result<Frame, Error> {
    loop {
        let msg = stream
            .next()
            .await
            .ok_or(Error::Transport(tungstenite::Error::ConnectionClosed))??;
        match msg {
            Message::Text(text) => {
                return Frame::from_text(&text)
                    .map_err(|e| Error::Protocol(format!("malformed handshake frame: {e}")));
            }
            Message::Close(_) => return Err(Error::Transport(tungstenite::Error::ConnectionClosed)),
            Message::Binary(_) => {
                return Err(Error::Protocol("binary frame during handshake".to_string()));
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Envelope, MessageKind};
    use futures_util::stream;

    fn frames(items: Vec<Message>) -> FrameStream {
        Box::pin(stream::iter(items.into_iter().map(Ok)))
    }

    fn encode(frame: Frame) -> Message {
        frame.to_message().unwrap()
    }

    #[tokio::test]
    async fn hello_yields_identity() {
        let mut s = frames(vec![
            Message::Ping(Vec::new().into()),
            encode(Frame::Hello { identity: Identity::new(12) }),
        ]);
        assert_eq!(read_hello(&mut s).await.unwrap(), Identity::new(12));
    }

    #[tokio::test]
    async fn envelope_before_hello_is_rejected() {
        let mut s = frames(vec![encode(Frame::Envelope(Envelope::new(MessageKind::Login)))]);
        assert!(matches!(read_hello(&mut s).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn unset_identity_is_rejected() {
        let mut s = frames(vec![encode(Frame::Hello { identity: Identity::UNSET })]);
        assert!(matches!(read_hello(&mut s).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn garbage_is_a_protocol_error() {
        let mut s = frames(vec![Message::Text("42".into())]);
        assert!(matches!(read_hello(&mut s).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn closed_stream_is_a_transport_error() {
        let mut s = frames(Vec::new());
        assert!(matches!(read_hello(&mut s).await, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn welcome_and_reject() {
        let id = Identity::new(4);
        let mut ok = frames(vec![encode(Frame::Welcome { identity: id })]);
        read_welcome(&mut ok, id).await.unwrap();

        let mut wrong = frames(vec![encode(Frame::Welcome { identity: Identity::new(5) })]);
        assert!(matches!(read_welcome(&mut wrong, id).await, Err(Error::Protocol(_))));

        let mut rejected = frames(vec![encode(Frame::Reject { reason: "taken".into() })]);
        assert!(matches!(
            read_welcome(&mut rejected, id).await,
            Err(Error::Rejected(reason)) if reason == "taken"
        ));
    }
}
