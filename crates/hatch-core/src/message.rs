//! Protocol messages.
//!
//! Envelopes carry application payloads; frames are what actually travels
//! over the socket. The handshake has its own frame types so it can never be
//! confused with a steady-state envelope.

use crate::error::InvalidMessage;
use crate::{Identity, MessageKind, PayloadRule};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

/// The typed unit exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Opaque payload; its shape is determined by `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Identity of the connection that produced the envelope.
    #[serde(default)]
    pub origin: Identity,
}

impl Envelope {
    /// A payload-less envelope.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: None,
            origin: Identity::UNSET,
        }
    }

    /// An envelope carrying `payload` serialized to JSON.
    pub fn with_payload<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: Some(serde_json::to_value(payload)?),
            origin: Identity::UNSET,
        })
    }

    /// The refresh signal.
    pub fn update() -> Self {
        Self::new(MessageKind::Update)
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, InvalidMessage> {
        let value = self
            .payload
            .clone()
            .ok_or(InvalidMessage::MissingPayload(self.kind))?;
        serde_json::from_value(value).map_err(|e| InvalidMessage::PayloadShape {
            kind: self.kind,
            reason: e.to_string(),
        })
    }

    /// Check the payload against the kind's rule.
    pub fn validate(&self) -> Result<(), InvalidMessage> {
        if matches!(self.payload, Some(serde_json::Value::Null)) {
            return Err(InvalidMessage::NullPayload(self.kind));
        }
        match (self.kind.payload_rule(), self.payload.is_some()) {
            (PayloadRule::Required, false) => Err(InvalidMessage::MissingPayload(self.kind)),
            (PayloadRule::Forbidden, true) => Err(InvalidMessage::UnexpectedPayload(self.kind)),
            _ => Ok(()),
        }
    }

    pub(crate) fn stamped(mut self, origin: Identity) -> Self {
        self.origin = origin;
        self
    }
}

/// Everything that can travel over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // Client -> Server, first frame only
    Hello { identity: Identity },

    // Server -> Client, answer to Hello
    Welcome { identity: Identity },
    Reject { reason: String },

    // Either direction, after the handshake
    Envelope(Envelope),
}

impl Frame {
    /// Encode as a WebSocket text message.
    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }

    /// Decode a WebSocket text message.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Reject { .. } => "reject",
            Frame::Envelope(_) => "envelope",
        }
    }
}
