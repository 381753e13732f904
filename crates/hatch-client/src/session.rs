//! Client session: one connection to one server.

use crate::{ClientError, RequestError, SessionConfig};
use futures_util::StreamExt;
use hatch_core::handshake;
use hatch_core::{
    CloseReason, Connection, ConnectionState, Envelope, Error, Frame, FrameStream, Identity, Inbox,
    MessageKind, RecvError, RefreshSignal, SendError, spawn_reader,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::MaybeTlsStream;

/// An open, handshaken session with the server.
///
/// The session is an owned handle: pass it to whatever needs to talk to the
/// server. Dropping it stops the reader and closes the socket.
#[derive(Debug)]
pub struct Session {
    connection: Arc<Connection>,
    reader: JoinHandle<()>,
    receive_timeout: Option<Duration>,
}

impl Session {
    /// Connect to `host:port` with default settings.
    pub async fn open(host: &str, port: u16) -> Result<Self, ClientError> {
        Self::connect(SessionConfig::new(host, port)).await
    }

    /// Connect, send our identity and wait for the server's welcome.
    pub async fn connect(config: SessionConfig) -> Result<Self, ClientError> {
        let identity = config.identity.unwrap_or_else(Identity::generate);
        let url = config.url();
        let limit = config.handshake_timeout();

        let (ws, _) = tokio::time::timeout(limit, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| ClientError::Timeout("connect"))?
            .map_err(|source| ClientError::Connect {
                url: url.clone(),
                source,
            })?;
        let peer = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };

        let (sink, stream) = ws.split();
        let mut stream: FrameStream = Box::pin(stream);
        let connection = Arc::new(Connection::new(identity, peer, Box::pin(sink), Inbox::new()));

        tracing::debug!(%identity, %url, "sending hello");
        connection
            .send_frame(&Frame::Hello { identity })
            .await
            .map_err(ClientError::Hello)?;

        let welcome = tokio::time::timeout(limit, handshake::read_welcome(&mut stream, identity)).await;
        let outcome = match welcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::Rejected(reason))) => Err(ClientError::Rejected(reason)),
            Ok(Err(e)) => Err(ClientError::Handshake(e)),
            Err(_) => Err(ClientError::Timeout("handshake")),
        };
        if let Err(e) = outcome {
            connection.finish(e.close_reason()).await;
            return Err(e);
        }

        connection.activate();
        tracing::info!(%identity, %url, "session established");

        let reader = spawn_reader(connection.clone(), stream, false, |conn, reason| {
            if reason.is_failure() {
                tracing::error!(identity = %conn.identity(), "session lost: {}", reason);
            } else {
                tracing::info!(identity = %conn.identity(), "session ended: {}", reason);
            }
        });

        Ok(Self {
            connection,
            reader,
            receive_timeout: config.receive_timeout(),
        })
    }

    pub fn identity(&self) -> Identity {
        self.connection.identity()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Handle to the "server requested refresh" flag.
    pub fn refresh(&self) -> RefreshSignal {
        self.connection.refresh().clone()
    }

    /// Send an envelope to the server.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        self.connection.send(envelope).await
    }

    /// Take the oldest queued envelope without waiting.
    ///
    /// `Ok(None)` means nothing is queued yet; once the connection has ended
    /// and the queue is drained this reports why instead.
    pub fn receive(&self) -> Result<Option<Envelope>, RecvError> {
        let inbox = self.connection.inbox();
        match inbox.try_receive() {
            Some(envelope) => Ok(Some(envelope)),
            None => match inbox.close_reason() {
                Some(reason) => Err(RecvError::Closed(reason)),
                None => Ok(None),
            },
        }
    }

    /// Wait for the oldest envelope of `kind`, bounded by the configured
    /// receive timeout.
    pub async fn receive_kind(&self, kind: MessageKind) -> Result<Envelope, RecvError> {
        self.receive_kind_timeout(kind, self.receive_timeout).await
    }

    /// Wait for the oldest envelope of `kind`, bounded by `timeout`.
    pub async fn receive_kind_timeout(
        &self,
        kind: MessageKind,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RecvError> {
        self.connection.inbox().receive_kind(kind, timeout).await
    }

    /// Wait for the next envelope of any kind.
    pub async fn next(&self, timeout: Option<Duration>) -> Result<Envelope, RecvError> {
        self.connection.inbox().receive(timeout).await
    }

    /// Send `envelope` and wait for its paired response kind.
    ///
    /// Only one request per response kind may be outstanding at a time; the
    /// first queued envelope of that kind is taken as the answer.
    pub async fn request(&self, envelope: &Envelope) -> Result<Envelope, RequestError> {
        let expected = envelope
            .kind
            .response()
            .ok_or(RequestError::NoResponse(envelope.kind))?;
        self.send(envelope).await?;
        Ok(self.receive_kind(expected).await?)
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Resolve once the connection has ended, with the reason.
    ///
    /// A failure reason here is fatal for this session; reconnecting means
    /// opening a new one.
    pub async fn closed(&self) -> CloseReason {
        self.connection.closed().await
    }

    /// The failure that ended the session, if it ended badly.
    pub fn failure(&self) -> Option<CloseReason> {
        self.connection
            .inbox()
            .close_reason()
            .filter(CloseReason::is_failure)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
