//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize an outgoing message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// An inbound message could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// A resize message carried an unusable geometry.
    #[error("invalid geometry: {rows}x{cols}")]
    InvalidGeometry {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Decode(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::str::Utf8Error> for ProtocolError {
    fn from(err: std::str::Utf8Error) -> Self {
        ProtocolError::Decode(format!("frame is not valid UTF-8: {}", err))
    }
}
