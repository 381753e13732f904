//! One WebSocket-backed connection and its reader task.

use crate::{CloseReason, Envelope, Frame, Identity, Inbox, RefreshSignal, SendError};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

/// Write half of a WebSocket, type-erased over the underlying stream.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
/// Read half of a WebSocket, type-erased over the underlying stream.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Upper bound on flushing a close frame to a peer that stopped reading.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, identity not yet confirmed.
    Handshaking,
    /// Normal operation.
    Active,
    /// Local close in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        })
    }
}

/// A bidirectional channel to one peer.
///
/// Sends run on the caller's task; receives are served from the inbox that
/// the reader task fills.
pub struct Connection {
    identity: Identity,
    peer: Option<SocketAddr>,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<FrameSink>>,
    inbox: Inbox,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("queued", &self.inbox.len())
            .finish()
    }
}

impl Connection {
    /// A connection in the handshaking state.
    pub fn new(identity: Identity, peer: Option<SocketAddr>, sink: FrameSink, inbox: Inbox) -> Self {
        let (state, _) = watch::channel(ConnectionState::Handshaking);
        Self {
            identity,
            peer,
            state,
            writer: Mutex::new(Some(sink)),
            inbox,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn refresh(&self) -> &RefreshSignal {
        self.inbox.refresh()
    }

    /// Handshaking -> Active. Returns false from any other state.
    pub fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Send an envelope to the peer.
    ///
    /// Invalid envelopes are rejected before anything is written.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        match self.state() {
            ConnectionState::Active => {}
            ConnectionState::Closed => return Err(SendError::Closed(self.close_reason())),
            other => return Err(SendError::NotActive(other)),
        }
        envelope.validate()?;
        self.send_frame(&Frame::Envelope(envelope.clone())).await
    }

    /// Write a raw frame regardless of state. Used for handshake frames.
    ///
    /// A write still pending when the connection starts closing is abandoned,
    /// so a peer that stopped reading cannot hold the writer.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let message = frame.to_message()?;
        let mut state = self.subscribe_state();
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(self.unwritable());
        };
        tokio::select! {
            sent = sink.send(message) => Ok(sent?),
            _ = closing(&mut state) => Err(SendError::Closed(self.close_reason())),
        }
    }

    fn unwritable(&self) -> SendError {
        match self.state() {
            state @ (ConnectionState::Handshaking | ConnectionState::Active) => {
                SendError::NotActive(state)
            }
            _ => SendError::Closed(self.close_reason()),
        }
    }

    /// Close from this side. Idempotent; returns whether this call started
    /// the close.
    ///
    /// Waiters blocked on the inbox are released with
    /// [`CloseReason::Local`], and the reader task stops on its next poll.
    pub async fn close(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if state.is_closing() {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });
        if !started {
            return false;
        }

        tracing::debug!(identity = %self.identity, "closing connection");
        self.inbox.close(CloseReason::Local);
        self.shut_writer().await;
        true
    }

    /// Mark the connection closed for `reason` and release the write half.
    pub async fn finish(&self, reason: CloseReason) {
        self.inbox.close(reason);
        self.state.send_if_modified(|state| {
            if state.is_closing() {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });
        self.shut_writer().await;
        self.state.send_replace(ConnectionState::Closed);
    }

    /// Wait until the connection is closed and report why.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
        self.close_reason()
    }

    fn close_reason(&self) -> CloseReason {
        self.inbox.close_reason().unwrap_or(CloseReason::Local)
    }

    async fn shut_writer(&self) {
        let Ok(mut writer) = tokio::time::timeout(CLOSE_GRACE, self.writer.lock()).await else {
            tracing::warn!(identity = %self.identity, "writer still busy, leaving it to its holder");
            return;
        };
        let sink = writer.take();
        drop(writer);
        if let Some(mut sink) = sink
            && tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err()
        {
            tracing::debug!(identity = %self.identity, "peer did not take close frame in time");
        }
    }
}

/// Spawn the task that drains `stream` into the connection's inbox.
///
/// With `stamp_origin`, every envelope is stamped with the connection's
/// identity before it is queued. The task ends on remote close, transport
/// error, protocol violation or local close; it then marks the connection
/// closed and calls `on_close` exactly once.
pub fn spawn_reader<F>(
    connection: Arc<Connection>,
    stream: FrameStream,
    stamp_origin: bool,
    on_close: F,
) -> JoinHandle<()>
where
    F: FnOnce(&Arc<Connection>, &CloseReason) + Send + 'static,
{
    tokio::spawn(async move {
        let reason = read_loop(&connection, stream, stamp_origin).await;
        match &reason {
            CloseReason::Local | CloseReason::Remote => {
                tracing::debug!(identity = %connection.identity(), "reader stopped: {}", reason);
            }
            _ => {
                tracing::warn!(identity = %connection.identity(), "reader stopped: {}", reason);
            }
        }
        connection.finish(reason.clone()).await;
        on_close(&connection, &reason);
    })
}

async fn read_loop(connection: &Connection, mut stream: FrameStream, stamp_origin: bool) -> CloseReason {
    let mut state = connection.subscribe_state();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(tungstenite::Error::ConnectionClosed)) | None => return CloseReason::Remote,
                    Some(Err(e)) => return CloseReason::Transport(e.to_string()),
                };

                match msg {
                    Message::Text(text) => match Frame::from_text(&text) {
                        Ok(Frame::Envelope(envelope)) => {
                            let envelope = if stamp_origin {
                                envelope.stamped(connection.identity())
                            } else {
                                envelope
                            };
                            tracing::trace!(identity = %connection.identity(), kind = %envelope.kind, "envelope received");
                            connection.inbox().push(envelope);
                        }
                        Ok(other) => {
                            return CloseReason::Protocol(format!(
                                "unexpected {} frame after handshake",
                                other.name()
                            ));
                        }
                        Err(e) => return CloseReason::Protocol(format!("malformed frame: {e}")),
                    },
                    Message::Close(_) => return CloseReason::Remote,
                    Message::Binary(_) => {
                        return CloseReason::Protocol("unexpected binary frame".to_string());
                    }
                    // Ping, pong and raw frames carry no envelopes.
                    _ => {}
                }
            }

            _ = closing(&mut state) => return CloseReason::Local,
        }
    }
}

async fn closing(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| s.is_closing()).await;
}
