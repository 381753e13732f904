//! The server's own request loop.

use crate::Dispatcher;
use hatch_core::{Envelope, Identity};

/// Something the handler wants sent in response to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Back to the connection the request came from.
    Reply(Envelope),
    /// To one specific connection.
    Unicast(Identity, Envelope),
    /// To every connection.
    Broadcast(Envelope),
}

/// Application logic behind the dispatcher.
pub trait Handler: Send {
    /// Handle one request. `request.origin` identifies the sender.
    fn handle(&mut self, request: &Envelope) -> Vec<Outbound>;
}

impl<F> Handler for F
where
    F: FnMut(&Envelope) -> Vec<Outbound> + Send,
{
    fn handle(&mut self, request: &Envelope) -> Vec<Outbound> {
        self(request)
    }
}

/// Feed every received envelope to `handler` and route what it returns,
/// until the dispatcher shuts down.
///
/// Failed sends are logged and otherwise ignored: the affected connection
/// is already on its way out of the registry.
pub async fn serve<H: Handler>(dispatcher: &Dispatcher, handler: &mut H) {
    while let Some(request) = dispatcher.next_envelope(None).await {
        tracing::debug!(origin = %request.origin, kind = %request.kind, "Handling request");

        for outbound in handler.handle(&request) {
            match outbound {
                Outbound::Reply(envelope) => {
                    if let Err(e) = dispatcher.unicast(request.origin, &envelope).await {
                        tracing::warn!(to = %request.origin, "Reply {} failed: {}", envelope.kind, e);
                    }
                }
                Outbound::Unicast(to, envelope) => {
                    if let Err(e) = dispatcher.unicast(to, &envelope).await {
                        tracing::warn!(%to, "Unicast {} failed: {}", envelope.kind, e);
                    }
                }
                Outbound::Broadcast(envelope) => {
                    let report = dispatcher.broadcast(&envelope).await;
                    if !report.all_succeeded() {
                        tracing::warn!(
                            "Broadcast {} reached {} of {} connections",
                            envelope.kind,
                            report.delivered.len(),
                            report.delivered.len() + report.failed.len()
                        );
                    }
                }
            }
        }
    }
}
