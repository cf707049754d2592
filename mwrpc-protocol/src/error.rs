//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding a single message.
///
/// None of these are fatal to a connection: a frame that fails to decode is
/// dropped and the stream continues.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in message")]
    InvalidUtf8,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field '{field}': expected {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unknown message kind: {0:?}")]
    UnknownKind(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::MissingField("msg");
        assert!(err.to_string().contains("msg"));

        let err = ProtocolError::UnknownKind("ping".to_string());
        assert!(err.to_string().contains("\"ping\""));

        let err = ProtocolError::InvalidField {
            field: "id",
            expected: "string",
        };
        let msg = err.to_string();
        assert!(msg.contains("id"));
        assert!(msg.contains("string"));

        let err = ProtocolError::MessageTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }
}
