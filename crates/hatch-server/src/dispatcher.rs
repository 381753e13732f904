//! Server-side connection registry and routing.

use crate::ServerConfig;
use futures_util::{SinkExt, StreamExt};
use futures_util::future::join_all;
use hatch_core::handshake;
use hatch_core::{
    CloseReason, Connection, ConnectionState, Envelope, Error, Frame, FrameSink, FrameStream,
    Identity, Inbox, MessageKind, SendError, spawn_reader,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;

type Registry = HashMap<Identity, Arc<Connection>>;

struct Inner {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    registry: Mutex<Registry>,
    /// Held for writing while all connections are being dropped; handshakes
    /// take it for reading before they register.
    admission: RwLock<()>,
    /// Pinged by every connection's inbox on arrival.
    arrived: Arc<Notify>,
    /// Rotates the starting connection of each poll pass.
    cursor: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unregister(&self, connection: &Arc<Connection>) {
        let mut registry = self.registry();
        if let Some(current) = registry.get(&connection.identity())
            && Arc::ptr_eq(current, connection)
        {
            registry.remove(&connection.identity());
        }
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<Identity>,
    pub failed: Vec<(Identity, SendError)>,
}

impl BroadcastReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns every client connection of one listening socket.
///
/// Cloning is cheap and yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.identities())
            .finish()
    }
}

impl Dispatcher {
    /// Bind the listening socket. Connections are accepted once
    /// [`run`](Self::run) is polled.
    pub async fn bind(config: ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.addr()).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening on ws://{}", local_addr);

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                listener,
                local_addr,
                config,
                registry: Mutex::new(HashMap::new()),
                admission: RwLock::new(()),
                arrived: Arc::new(Notify::new()),
                cursor: AtomicUsize::new(0),
                shutdown,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Accept connections until [`shutdown`](Self::shutdown), then close
    /// every remaining connection.
    pub async fn run(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.inner.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.admit(stream, addr).await {
                            tracing::warn!("Connection from {} refused: {}", addr, e);
                        }
                    });
                }

                _ = stopped(&mut shutdown) => break,
            }
        }

        let remaining: Vec<_> = self.inner.registry().drain().map(|(_, c)| c).collect();
        join_all(remaining.iter().map(|c| c.close())).await;
        tracing::info!("Dispatcher on {} stopped", self.inner.local_addr);
    }

    /// Run the accept loop on its own task.
    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Stop accepting and close all connections.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.arrived.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    async fn admit(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), Error> {
        let limit = self.inner.config.handshake_timeout();
        let ws = tokio::time::timeout(limit, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| Error::Protocol("websocket upgrade timed out".to_string()))??;
        let (sink, stream) = ws.split();
        let mut sink: FrameSink = Box::pin(sink);
        let mut stream: FrameStream = Box::pin(stream);

        tracing::debug!("New connection from {}", addr);

        let hello = tokio::time::timeout(limit, handshake::read_hello(&mut stream))
            .await
            .unwrap_or_else(|_| Err(Error::Protocol("no hello before timeout".to_string())));
        let identity = match hello {
            Ok(identity) => identity,
            Err(e) => {
                refuse(&mut sink, e.to_string()).await;
                return Err(e);
            }
        };

        let connection = Arc::new(Connection::new(
            identity,
            Some(addr),
            sink,
            Inbox::with_wake(self.inner.arrived.clone()),
        ));

        if let Err(reason) = self.register(&connection).await {
            // Best effort: the client learns why before the socket closes.
            let _ = connection
                .send_frame(&Frame::Reject {
                    reason: reason.clone(),
                })
                .await;
            connection.finish(CloseReason::Protocol(reason.clone())).await;
            return Err(Error::Protocol(reason));
        }

        if let Err(e) = connection.send_frame(&Frame::Welcome { identity }).await {
            self.inner.unregister(&connection);
            connection
                .finish(CloseReason::Transport(e.to_string()))
                .await;
            return Err(Error::Protocol(format!("failed to welcome {identity}: {e}")));
        }

        // A drop-all may already have closed it; the reader then only cleans up.
        connection.activate();

        let inner = Arc::downgrade(&self.inner);
        spawn_reader(connection, stream, true, move |conn, reason| {
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.unregister(conn);
            }
            tracing::info!(identity = %conn.identity(), "Connection closed: {}", reason);
        });

        tracing::info!(%identity, "Client {} connected", addr);
        Ok(())
    }

    async fn register(&self, connection: &Arc<Connection>) -> Result<(), String> {
        let _admission = self.inner.admission.read().await;
        if self.is_shut_down() {
            return Err("server is shutting down".to_string());
        }

        let identity = connection.identity();
        let mut registry = self.inner.registry();
        if registry.contains_key(&identity) {
            return Err(format!("identity {identity} is already connected"));
        }
        registry.insert(identity, connection.clone());
        Ok(())
    }

    fn get(&self, identity: Identity) -> Option<Arc<Connection>> {
        self.inner.registry().get(&identity).cloned()
    }

    /// Registered connections, ordered by identity.
    fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self.inner.registry().values().cloned().collect();
        connections.sort_by_key(|c| c.identity());
        connections
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.connections().iter().map(|c| c.identity()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.inner.registry().contains_key(&identity)
    }

    pub fn state_of(&self, identity: Identity) -> Option<ConnectionState> {
        self.get(identity).map(|c| c.state())
    }

    /// Send to every connection that has finished its handshake.
    ///
    /// One failing connection does not stop delivery to the others.
    pub async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let targets: Vec<_> = self
            .connections()
            .into_iter()
            .filter(|c| c.state() != ConnectionState::Handshaking)
            .collect();
        let results = join_all(
            targets
                .iter()
                .map(|c| async move { (c.identity(), self.deliver(c, envelope).await) }),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (identity, result) in results {
            match result {
                Ok(()) => report.delivered.push(identity),
                Err(e) => {
                    tracing::debug!(%identity, kind = %envelope.kind, "broadcast failed: {}", e);
                    report.failed.push((identity, e));
                }
            }
        }
        report
    }

    /// Send to the connection with `identity` only.
    pub async fn unicast(&self, identity: Identity, envelope: &Envelope) -> Result<(), SendError> {
        let connection = self
            .get(identity)
            .ok_or(SendError::UnknownIdentity(identity))?;
        self.deliver(&connection, envelope).await
    }

    /// Send with the configured time limit. A peer that misses it is closed
    /// so it cannot hold up later sends.
    async fn deliver(&self, connection: &Connection, envelope: &Envelope) -> Result<(), SendError> {
        let limit = self.inner.config.send_timeout();
        match tokio::time::timeout(limit, connection.send(envelope)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(identity = %connection.identity(), "peer stalled, closing");
                connection.close().await;
                Err(SendError::TimedOut)
            }
        }
    }

    /// One non-blocking pass over every connection's queue.
    pub fn receive_any(&self) -> Option<Envelope> {
        self.poll(Inbox::try_receive)
    }

    /// One non-blocking pass, taking only envelopes of `kind`.
    pub fn receive_of_kind(&self, kind: MessageKind) -> Option<Envelope> {
        self.poll(|inbox| inbox.try_receive_kind(kind))
    }

    fn poll(&self, take: impl Fn(&Inbox) -> Option<Envelope>) -> Option<Envelope> {
        let connections = self.connections();
        if connections.is_empty() {
            return None;
        }
        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % connections.len();
        connections
            .iter()
            .cycle()
            .skip(start)
            .take(connections.len())
            .find_map(|c| take(c.inbox()))
    }

    /// Wait for the next envelope from any connection.
    ///
    /// Returns `None` when `timeout` elapses or the dispatcher shuts down.
    pub async fn next_envelope(&self, timeout: Option<Duration>) -> Option<Envelope> {
        let wait = async {
            loop {
                let notified = self.inner.arrived.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_shut_down() {
                    return None;
                }
                if let Some(envelope) = self.receive_any() {
                    return Some(envelope);
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
            None => wait.await,
        }
    }

    /// Close every connection and empty the registry, then pause before
    /// admitting new ones. The listener keeps running throughout.
    ///
    /// Returns how many connections were dropped.
    pub async fn drop_all_connections(&self) -> usize {
        let _admission = self.inner.admission.write().await;

        let dropped: Vec<_> = self.inner.registry().drain().map(|(_, c)| c).collect();
        join_all(dropped.iter().map(|c| c.close())).await;
        tokio::time::sleep(self.inner.config.drop_pause()).await;

        tracing::info!(count = dropped.len(), "Dropped all connections");
        dropped.len()
    }
}

/// Tell a client why its handshake failed, then close the socket.
async fn refuse(sink: &mut FrameSink, reason: String) {
    if let Ok(message) = (Frame::Reject { reason }).to_message() {
        let _ = sink.send(message).await;
    }
    let _ = sink.close().await;
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::Sink;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio_tungstenite::tungstenite::{self, Message};

    /// Accepts every frame and discards it.
    fn open_sink() -> FrameSink {
        Box::pin(
            futures_util::sink::drain::<Message>()
                .sink_map_err(|never| -> tungstenite::Error { match never {} }),
        )
    }

    /// A peer that never drains its socket.
    struct Stalled;

    impl Sink<Message> for Stalled {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    async fn unstarted() -> Dispatcher {
        let config = ServerConfig {
            port: 0,
            drop_pause_ms: 0,
            send_timeout_ms: 50,
            ..ServerConfig::default()
        };
        Dispatcher::bind(config).await.unwrap()
    }

    /// Register an active connection without a socket or reader behind it.
    async fn attach(dispatcher: &Dispatcher, identity: u64, sink: FrameSink) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(
            Identity::new(identity),
            None,
            sink,
            Inbox::with_wake(dispatcher.inner.arrived.clone()),
        ));
        dispatcher.register(&connection).await.unwrap();
        assert!(connection.activate());
        connection
    }

    fn status() -> Envelope {
        Envelope::with_payload(MessageKind::Status, &"ready").unwrap()
    }

    #[tokio::test]
    async fn broadcast_reports_closed_connection() {
        let dispatcher = unstarted().await;
        attach(&dispatcher, 1, open_sink()).await;
        let gone = attach(&dispatcher, 2, open_sink()).await;
        attach(&dispatcher, 3, open_sink()).await;

        // Peer hung up; its reader has not unregistered it yet.
        gone.finish(CloseReason::Remote).await;

        let report = dispatcher.broadcast(&status()).await;
        assert!(!report.all_succeeded());
        assert_eq!(report.delivered, [Identity::new(1), Identity::new(3)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Identity::new(2));
        assert!(matches!(
            report.failed[0].1,
            SendError::Closed(CloseReason::Remote)
        ));
    }

    #[tokio::test]
    async fn stalled_peer_does_not_hold_up_others() {
        let dispatcher = unstarted().await;
        attach(&dispatcher, 1, open_sink()).await;
        let stalled = attach(&dispatcher, 2, Box::pin(Stalled)).await;

        let report = tokio::time::timeout(Duration::from_secs(5), dispatcher.broadcast(&status()))
            .await
            .expect("broadcast finished");
        assert_eq!(report.delivered, [Identity::new(1)]);
        assert!(matches!(
            report.failed.as_slice(),
            [(id, SendError::TimedOut)] if *id == Identity::new(2)
        ));
        assert!(stalled.state().is_closing());

        let unicast = dispatcher.unicast(Identity::new(2), &status()).await;
        assert!(unicast.is_err());

        let dropped = tokio::time::timeout(Duration::from_secs(5), dispatcher.drop_all_connections())
            .await
            .expect("drop finished");
        assert_eq!(dropped, 2);
        assert_eq!(dispatcher.connection_count(), 0);
    }
}
