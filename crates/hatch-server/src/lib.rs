//! Server side of the hatch protocol.
//!
//! A [`Dispatcher`] listens on one port, performs the handshake with each
//! client, and keeps a registry of live connections addressed by
//! [`Identity`](hatch_core::Identity). [`serve`] runs a request loop on top
//! of it.

mod config;
mod dispatcher;
mod serve;

pub use config::{ConfigError, ServerConfig};
pub use dispatcher::{BroadcastReport, Dispatcher};
pub use serve::{Handler, Outbound, serve};

pub use hatch_core::{
    CloseReason, ConnectionState, Envelope, Identity, MessageKind, SendError,
};
