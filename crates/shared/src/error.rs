//! Error types for decoding inbound frames.

use thiserror::Error;

/// Why an inbound frame could not be classified as an [`Envelope`].
///
/// None of these are reported back to the sending client: the relay discards
/// the frame and keeps the connection open.
///
/// [`Envelope`]: crate::Envelope
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not JSON at all.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    /// The frame is JSON but has no string `type` field.
    #[error("envelope has no string `type` field")]
    MissingType,
    /// The `type` field names an event the relay does not know.
    #[error("unrecognized envelope type `{0}`")]
    UnknownType(String),
    /// The `type` is known but its `payload` is absent or has the wrong shape.
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Short machine-friendly label, used as a structured log field.
    pub fn label(&self) -> &'static str {
        match self {
            DecodeError::InvalidJson(_) => "invalid_json",
            DecodeError::MissingType => "missing_type",
            DecodeError::UnknownType(_) => "unknown_type",
            DecodeError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}
