//! Encoder and decoder for message envelopes.
//!
//! Message boundaries come from the WebSocket framing; one text frame holds
//! exactly one JSON-encoded envelope.

use crate::error::ProtocolError;
use crate::message::{Envelope, WireMessage};
use crate::MAX_MESSAGE_SIZE;

/// Encodes envelopes into message text.
pub struct Encoder;

impl Encoder {
    /// Encodes an envelope into a JSON string.
    pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(&WireMessage::from(envelope))?;
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(text)
    }
}

/// Decodes message text into envelopes.
pub struct Decoder;

impl Decoder {
    /// Decodes one envelope from a JSON string.
    pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let wire: WireMessage = serde_json::from_str(text)?;
        Envelope::try_from(wire)
    }

    /// Decodes one envelope from raw bytes (binary frames).
    pub fn decode_bytes(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::decode(text)
    }
}
