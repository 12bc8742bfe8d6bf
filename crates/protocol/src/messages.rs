//! Wire message definitions for the terminal bridge.
//!
//! Every message is a JSON object carried in a single WebSocket text frame
//! and discriminated by its `type` field:
//!
//! ```text
//! client → server   {"type":"command","data":"ls\r"}
//!                   {"type":"resize","rows":40,"cols":120}
//! server → client   {"type":"data","data":"total 0\r\n"}
//!                   {"type":"exit","code":0}
//!                   {"type":"error","message":"failed to spawn shell"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Messages sent by the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Raw keystrokes to write to the shell's input.
    Command {
        /// Input text, written to the PTY as UTF-8 bytes.
        data: String,
    },
    /// Terminal viewport changed.
    Resize {
        /// New number of rows.
        rows: u16,
        /// New number of columns.
        cols: u16,
    },
}

impl ClientMessage {
    /// Decodes a client message from a text frame.
    ///
    /// Resize messages with a zero dimension are rejected here so that the
    /// session never sees an unusable geometry.
    pub fn decode(text: &str) -> Result<Self> {
        let msg: ClientMessage = serde_json::from_str(text)?;
        if let ClientMessage::Resize { rows, cols } = msg {
            if rows == 0 || cols == 0 {
                return Err(ProtocolError::InvalidGeometry { rows, cols });
            }
        }
        Ok(msg)
    }

    /// Decodes a client message from a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)?;
        Self::decode(text)
    }

    /// Encodes the message as JSON text.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Messages sent by the bridge to the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// A chunk of terminal output. Chunk boundaries carry no meaning.
    Data {
        /// Output text.
        data: String,
    },
    /// The shell process exited.
    Exit {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
    /// The session could not be served.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Creates a data message.
    pub fn data(data: impl Into<String>) -> Self {
        ServerMessage::Data { data: data.into() }
    }

    /// Creates an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Encodes the message as JSON text.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decodes a server message from a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
