//! Serialization and deserialization for the Blindly chat wire protocol.
//!
//! Frames travel as JSON text over WebSocket, which preserves message
//! boundaries, so no extra framing layer is needed.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The transport delivered something that is not a text frame.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Encodes a frame into its JSON text representation.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame from its JSON text representation.
///
/// Unknown fields are tolerated so older clients keep working when the
/// server grows the protocol.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text cannot be deserialized.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}
