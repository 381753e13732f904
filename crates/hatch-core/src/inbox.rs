//! Per-connection inbound queue.
//!
//! The reader task is the only producer; any number of application tasks
//! consume. Envelopes keep arrival order. `UPDATE` envelopes never enter the
//! queue: they raise the connection's [`RefreshSignal`] instead.
//!
//! Blocking receives park on a [`Notify`] and are woken on every push and on
//! close, so a waiter never spins and never outlives its connection.

use crate::{CloseReason, Envelope, MessageKind, RecvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct RefreshInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Out-of-band "peer asked us to re-fetch state" flag.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct RefreshSignal {
    inner: Arc<RefreshInner>,
}

impl RefreshSignal {
    pub fn raise(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether a refresh is pending, without clearing it.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.inner.requested.swap(false, Ordering::SeqCst)
    }

    /// Wait until a refresh is requested, then clear it.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.take() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
struct InboxState {
    queue: VecDeque<Envelope>,
    closed: Option<CloseReason>,
}

impl InboxState {
    fn take_first(&mut self) -> Option<Envelope> {
        self.queue.pop_front()
    }

    fn take_kind(&mut self, kind: MessageKind) -> Option<Envelope> {
        let index = self.queue.iter().position(|env| env.kind == kind)?;
        self.queue.remove(index)
    }
}

/// Ordered, thread-safe buffer of envelopes for one connection.
#[derive(Debug, Default)]
pub struct Inbox {
    state: Mutex<InboxState>,
    arrived: Notify,
    refresh: RefreshSignal,
    /// Shared wakeup for owners watching many inboxes at once.
    wake: Option<Arc<Notify>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// An inbox that also pings `wake` on every arrival.
    pub fn with_wake(wake: Arc<Notify>) -> Self {
        Self {
            wake: Some(wake),
            ..Self::default()
        }
    }

    pub fn refresh(&self) -> &RefreshSignal {
        &self.refresh
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an arrived envelope. Returns false if the inbox is closed and
    /// the envelope was dropped.
    pub fn push(&self, envelope: Envelope) -> bool {
        {
            let mut state = self.lock();
            if state.closed.is_some() {
                return false;
            }
            if envelope.kind == MessageKind::Update {
                drop(state);
                self.refresh.raise();
                return true;
            }
            state.queue.push_back(envelope);
        }
        self.arrived.notify_waiters();
        if let Some(wake) = &self.wake {
            wake.notify_waiters();
        }
        true
    }

    /// Close the inbox and wake every waiter. Only the first reason sticks;
    /// returns whether this call closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.lock();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason);
        }
        self.arrived.notify_waiters();
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Pop the oldest envelope, if any.
    pub fn try_receive(&self) -> Option<Envelope> {
        self.lock().take_first()
    }

    /// Remove the oldest envelope of `kind`, leaving the others in order.
    pub fn try_receive_kind(&self, kind: MessageKind) -> Option<Envelope> {
        self.lock().take_kind(kind)
    }

    /// Wait for the oldest envelope of any kind.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Envelope, RecvError> {
        self.wait_for(timeout, InboxState::take_first).await
    }

    /// Wait for the oldest envelope of `kind`.
    ///
    /// Returns queued matches even after close; otherwise fails with
    /// [`RecvError::Closed`] once the connection is gone, or
    /// [`RecvError::Timeout`] when `timeout` elapses first.
    pub async fn receive_kind(
        &self,
        kind: MessageKind,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RecvError> {
        self.wait_for(timeout, |state| state.take_kind(kind)).await
    }

    async fn wait_for<F>(&self, timeout: Option<Duration>, mut take: F) -> Result<Envelope, RecvError>
    where
        F: FnMut(&mut InboxState) -> Option<Envelope>,
    {
        let wait = async {
            loop {
                let notified = self.arrived.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut state = self.lock();
                    if let Some(envelope) = take(&mut state) {
                        return Ok(envelope);
                    }
                    if let Some(reason) = &state.closed {
                        return Err(RecvError::Closed(reason.clone()));
                    }
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .unwrap_or(Err(RecvError::Timeout)),
            None => wait.await,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Kinds currently queued, oldest first.
    pub fn kinds(&self) -> Vec<MessageKind> {
        self.lock().queue.iter().map(|env| env.kind).collect()
    }
}
