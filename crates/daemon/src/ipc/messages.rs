//! Control socket message types.
//!
//! Requests and responses exchanged between the `termbridge` CLI and a running
//! bridge over the local Unix socket.

use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;

/// Requests that can be sent from the CLI to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the bridge is alive.
    Ping,
    /// Get the current status of the bridge.
    Status,
    /// Request the bridge to stop gracefully.
    Stop,
    /// List all active sessions.
    ListSessions,
    /// Terminate a specific session by ID.
    KillSession {
        /// The unique identifier of the session to kill.
        session_id: String,
    },
}

/// Responses sent from the bridge to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current bridge status.
    Status {
        /// Whether the bridge is accepting connections.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of active sessions.
        session_count: usize,
        /// Address the WebSocket listener is bound to.
        bind: String,
    },
    /// Acknowledgment that the bridge is stopping.
    Stopping,
    /// List of active sessions.
    Sessions {
        /// Information about each active session.
        sessions: Vec<IpcSessionInfo>,
    },
    /// Confirmation that a session was killed.
    SessionKilled {
        /// The ID of the killed session.
        session_id: String,
        /// Exit code of the shell, if it was reaped.
        exit_code: Option<i32>,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Information about an active session for IPC communication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    /// Unique session identifier.
    pub id: String,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Remote address of the WebSocket client.
    pub peer: Option<String>,
    /// Unix timestamp when the session was connected.
    pub connected_at: u64,
    /// Terminal rows.
    pub rows: Option<u16>,
    /// Terminal columns.
    pub cols: Option<u16>,
    /// Lifecycle state.
    pub state: String,
}

impl From<SessionInfo> for IpcSessionInfo {
    fn from(info: SessionInfo) -> Self {
        Self {
            id: info.id,
            pid: info.pid,
            peer: info.peer.map(|addr| addr.to_string()),
            connected_at: info.connected_at,
            rows: info.rows,
            cols: info.cols,
            state: info.state.to_string(),
        }
    }
}
