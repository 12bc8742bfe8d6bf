//! Session management module.
//!
//! This module provides PTY-backed shell sessions and the registry that
//! tracks them while their connections are alive.

pub mod pty;
pub mod registry;

pub use pty::{
    default_shell, Geometry, OutputStream, Session, SessionError, SessionId, SessionState,
    SessionStatus, SpawnOptions,
};
pub use registry::{SessionInfo, SessionRegistry};
