//! Client side of the hatch protocol.
//!
//! A [`Session`] owns exactly one connection to a server. It sends
//! envelopes, hands back responses by kind, and exposes the server's
//! refresh requests as a separate signal.

mod config;
mod error;
mod session;

pub use config::SessionConfig;
pub use error::{ClientError, RequestError};
pub use session::Session;

pub use hatch_core::{
    CloseReason, ConnectionState, Envelope, Identity, MessageKind, RecvError, RefreshSignal,
    SendError,
};
