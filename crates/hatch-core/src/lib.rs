//! Core types for the hatch messaging protocol.
//!
//! This crate provides the framing, the connection lifecycle and the inbound
//! queue. Clients and servers build on it; applications only ever see
//! [`Envelope`]s and their [`MessageKind`]s.

pub mod connection;
pub mod handshake;
mod error;
mod identity;
mod inbox;
mod kind;
mod message;

pub use connection::{Connection, ConnectionState, FrameSink, FrameStream, spawn_reader};
pub use error::{CloseReason, Error, InvalidMessage, RecvError, SendError};
pub use identity::{Identity, IdentityParseError};
pub use inbox::{Inbox, RefreshSignal};
pub use kind::{MessageKind, PayloadRule};
pub use message::{Envelope, Frame};
