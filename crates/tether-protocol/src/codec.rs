//! Codec for encoding and decoding Tether frames.
//!
//! Frames travel as single JSON text messages; the transport provides the
//! message boundaries, so there is no length prefix.

use thiserror::Error;

use crate::frames::{InboundFrame, OutboundFrame};

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Malformed or non-object JSON.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode an inbound frame from a text message.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a JSON object with
/// a string `type` field.
pub fn decode(text: &str) -> Result<InboundFrame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(serde_json::from_str(text)?)
}

/// Encode an outbound frame to a text message.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &OutboundFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}
