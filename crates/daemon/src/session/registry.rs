//! Registry of live sessions.
//!
//! The registry is an accounting structure: it maps session IDs to weak
//! references plus metadata about the connection that owns each session.
//! Sessions are owned by their connection task, so a registry entry never
//! keeps a shell alive and the registry itself never performs PTY I/O.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use super::pty::{Session, SessionError, SessionId, SessionState, SessionStatus};

/// Registry bookkeeping for one session.
struct SessionEntry {
    /// Non-owning handle to the session.
    session: Weak<Session>,
    /// Process ID of the shell.
    pid: Option<u32>,
    /// Address of the connected client.
    peer: Option<SocketAddr>,
    /// Unix timestamp when the session was registered.
    connected_at: u64,
}

/// Snapshot of a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Address of the connected client.
    pub peer: Option<SocketAddr>,
    /// Unix timestamp when the session was registered.
    pub connected_at: u64,
    /// Current terminal rows, if the PTY is still open.
    pub rows: Option<u16>,
    /// Current terminal columns, if the PTY is still open.
    pub cols: Option<u16>,
    /// Lifecycle state; `Terminated` if the session has been dropped.
    pub state: SessionState,
}

/// Thread-safe registry of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    /// Map of session ID to entry.
    sessions: DashMap<SessionId, SessionEntry>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session.
    pub fn insert(&self, session: &Arc<Session>, peer: Option<SocketAddr>) {
        let entry = SessionEntry {
            session: Arc::downgrade(session),
            pid: session.pid(),
            peer,
            connected_at: unix_now(),
        };
        self.sessions.insert(session.id().clone(), entry);

        tracing::debug!(
            session_id = %session.id(),
            sessions = self.sessions.len(),
            "Registered session"
        );
    }

    /// Removes a session. Returns false if it was not registered.
    pub fn remove(&self, session_id: &SessionId) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            tracing::debug!(
                session_id = %session_id,
                sessions = self.sessions.len(),
                "Unregistered session"
            );
        }
        removed
    }

    /// Returns the session if it is registered and still alive.
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.session.upgrade())
    }

    /// Checks if a session is registered.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Lists all registered sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        // Copy out of the map first; no shard lock may be held across an await.
        let entries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| {
                let e = entry.value();
                (entry.key().clone(), e.session.clone(), e.pid, e.peer, e.connected_at)
            })
            .collect();

        let mut infos = Vec::with_capacity(entries.len());
        for (id, weak, pid, peer, connected_at) in entries {
            let (geometry, state) = match weak.upgrade() {
                Some(session) => (session.geometry().await, session.state()),
                None => (None, SessionState::Terminated),
            };
            infos.push(SessionInfo {
                id,
                pid,
                peer,
                connected_at,
                rows: geometry.map(|g| g.rows),
                cols: geometry.map(|g| g.cols),
                state,
            });
        }

        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    /// Terminates a registered session.
    ///
    /// The entry itself is removed by the owning connection once its teardown
    /// completes.
    pub async fn kill(&self, session_id: &SessionId) -> Result<Option<SessionStatus>, SessionError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        tracing::info!(session_id = %session_id, "Killing session on request");
        Ok(session.terminate().await)
    }
}

/// Returns the current Unix timestamp in seconds.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
