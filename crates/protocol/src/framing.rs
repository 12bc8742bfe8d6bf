//! Text framing for PTY output.
//!
//! The wire protocol carries output as JSON strings, so every `data` message
//! must hold valid UTF-8. PTY reads, however, return arbitrary byte slices and
//! regularly cut a multi-byte character in half. [`Utf8Framer`] carries an
//! incomplete trailing sequence over to the next chunk so that no character is
//! split across messages and no byte is emitted twice.
//!
//! Bytes that can never form valid UTF-8 are replaced with U+FFFD, matching
//! what a browser terminal would render for them anyway.

use std::borrow::Cow;

use crate::messages::ServerMessage;

/// Longest possible incomplete UTF-8 prefix (a 4-byte sequence minus one).
pub const MAX_PENDING_BYTES: usize = 3;

/// Stateful converter from raw PTY byte chunks to UTF-8 text chunks.
#[derive(Debug, Default)]
pub struct Utf8Framer {
    /// Incomplete trailing sequence from the previous chunk.
    pending: Vec<u8>,
}

impl Utf8Framer {
    /// Creates a new framer with no pending bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bytes held back waiting for a continuation.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feeds a chunk of output and returns the text that is complete so far.
    ///
    /// Returns `None` when the chunk only extended a pending sequence.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        let joined: Cow<'_, [u8]> = if self.pending.is_empty() {
            Cow::Borrowed(chunk)
        } else {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(chunk);
            Cow::Owned(buf)
        };

        let mut out = String::with_capacity(joined.len());
        let mut rest: &[u8] = &joined;

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            // Truncated sequence at the end of the chunk.
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Flushes any pending bytes once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&pending).into_owned())
    }

    /// Feeds a chunk and wraps the complete text in a `data` message.
    pub fn frame(&mut self, chunk: &[u8]) -> Option<ServerMessage> {
        self.push(chunk).map(ServerMessage::data)
    }
}
