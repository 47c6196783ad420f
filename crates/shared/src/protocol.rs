//! Relay wire protocol.
//!
//! Every frame on the socket is a JSON text frame shaped as
//! `{"type": "message" | "typing", "payload": {...}}`. The relay only checks
//! that a frame has this shape; it never inspects ids, senders or text.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// `type` tag of a chat message envelope.
pub const TYPE_MESSAGE: &str = "message";
/// `type` tag of a typing signal envelope.
pub const TYPE_TYPING: &str = "typing";

// --- Events ---

/// A chat message as submitted by a client.
///
/// `id` is generated by the client and relayed as-is; the relay does not
/// check it for collisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender: String,
    pub timestamp: Timestamp,
}

/// "`sender` is typing" presence hint. Expiry is up to the receiving client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypingSignal {
    pub sender: String,
    /// Epoch milliseconds.
    pub timestamp: serde_json::Number,
}

/// Client-supplied instant, either a date string or epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(serde_json::Number),
    Text(String),
}

impl Timestamp {
    /// Best-effort conversion to a UTC instant.
    ///
    /// Returns `None` for strings that are not RFC 3339 and for numbers out of
    /// range. The relay never rejects a frame because of this.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::Millis(n) => millis_to_datetime(n),
            Timestamp::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

fn millis_to_datetime(n: &serde_json::Number) -> Option<DateTime<Utc>> {
    let millis = match n.as_i64() {
        Some(ms) => ms,
        None => {
            let ms = n.as_f64()?;
            if !ms.is_finite() || ms.abs() > i64::MAX as f64 {
                return None;
            }
            ms as i64
        }
    };
    Utc.timestamp_millis_opt(millis).single()
}

// --- Envelope ---

/// The tagged wrapper every frame travels in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Envelope {
    Message(ChatMessage),
    Typing(TypingSignal),
}

impl Envelope {
    /// Classify a raw inbound frame.
    ///
    /// The `type` tag is checked before the payload so an unknown event and a
    /// broken payload of a known event are reported differently.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(DecodeError::InvalidJson)?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(DecodeError::MissingType)?;

        match kind {
            TYPE_MESSAGE | TYPE_TYPING => {}
            other => return Err(DecodeError::UnknownType(other.to_string())),
        }
        let kind = kind.to_string();

        serde_json::from_value(value)
            .map_err(|source| DecodeError::InvalidPayload { kind, source })
    }

    /// Serialize back to a JSON text frame.
    ///
    /// The relay forwards the frame it received and never calls this; it is
    /// here for clients building frames from these types.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The wire `type` tag of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Message(_) => TYPE_MESSAGE,
            Envelope::Typing(_) => TYPE_TYPING,
        }
    }

    /// Who the client claims sent this event. Not verified.
    pub fn sender(&self) -> &str {
        match self {
            Envelope::Message(m) => &m.sender,
            Envelope::Typing(t) => &t.sender,
        }
    }

    /// The event's client-side instant, if it can be read.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Envelope::Message(m) => m.timestamp.to_datetime(),
            Envelope::Typing(t) => millis_to_datetime(&t.timestamp),
        }
    }
}
