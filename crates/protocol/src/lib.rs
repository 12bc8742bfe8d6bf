//! # termbridge protocol
//!
//! Wire definitions shared by the bridge server and its test clients.
//!
//! ## Overview
//!
//! A browser terminal talks to the bridge over a single WebSocket. Each frame
//! is a JSON object tagged by `type`:
//!
//! - **Client messages**: `command` (keystrokes) and `resize` (viewport)
//! - **Server messages**: `data` (terminal output), `exit` and `error`
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         ClientMessage / ServerMessage   │  JSON, `type`-tagged
//! ├─────────────────────────────────────────┤
//! │              Utf8Framer                 │  PTY bytes → UTF-8 text
//! ├─────────────────────────────────────────┤
//! │          Transport (WebSocket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ServerMessage, Utf8Framer};
//!
//! let msg = ClientMessage::decode(r#"{"type":"command","data":"ls\n"}"#).unwrap();
//! assert_eq!(msg, ClientMessage::Command { data: "ls\n".to_string() });
//!
//! let mut framer = Utf8Framer::new();
//! let out = framer.frame(b"total 0\r\n").unwrap();
//! assert_eq!(out, ServerMessage::data("total 0\r\n"));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Client and server message definitions
//! - [`framing`]: UTF-8 safe chunking of PTY output
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{Utf8Framer, MAX_PENDING_BYTES};
pub use messages::{ClientMessage, ServerMessage};
