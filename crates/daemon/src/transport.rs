//! WebSocket transport adapter.
//!
//! One adapter drives one connection: it decodes client frames into session
//! input, forwards session output as `data` messages, and tears both sides
//! down together when either one ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage, Utf8Framer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::session::{Geometry, OutputStream, Session, SessionId, SessionStatus};

/// How long to wait for the exit code once the output stream has ended.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// Reading from or writing to the socket failed.
    TransportError(String),
    /// The shell exited and its output was drained.
    ProcessExited,
    /// No traffic in either direction for the idle timeout.
    IdleTimeout,
    /// The server is shutting down.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("client closed"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::ProcessExited => f.write_str("process exited"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// Completion notice for a connection.
#[derive(Debug, Clone)]
pub struct TransportOutcome {
    /// Session served by the connection.
    pub session_id: SessionId,
    /// What ended the connection.
    pub reason: CloseReason,
    /// Final status of the shell, if it could be reaped.
    pub status: Option<SessionStatus>,
}

/// Monotonic timestamp of the last frame in either direction.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Pairs one WebSocket connection with one session.
pub struct TransportAdapter {
    session: Arc<Session>,
    output: OutputStream,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl TransportAdapter {
    /// Creates an adapter for a freshly spawned session.
    pub fn new(session: Arc<Session>, output: OutputStream) -> Self {
        Self {
            session,
            output,
            idle_timeout: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Closes the connection after this long without traffic.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Closes the connection when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Pumps messages until either side ends, then tears down both.
    ///
    /// The session is always terminated and the socket always closed before
    /// this returns; closing an already closed socket is not an error.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>) -> TransportOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let session_id = self.session.id().clone();
        let (mut sink, mut stream) = ws.split();
        let activity = Activity::new();

        let reason = tokio::select! {
            _ = self.shutdown.cancelled() => CloseReason::Shutdown,
            reason = read_client(&mut stream, &self.session, &activity) => reason,
            reason = forward_output(&mut sink, &mut self.output, &self.session, &activity) => reason,
            _ = idle_cutoff(self.idle_timeout, &activity) => CloseReason::IdleTimeout,
        };

        tracing::info!(session_id = %session_id, reason = %reason, "Connection ending");

        let status = self.session.terminate().await;

        if !matches!(reason, CloseReason::ClientClosed | CloseReason::TransportError(_)) {
            if let Err(e) = sink.close().await {
                tracing::debug!(session_id = %session_id, error = %e, "Close after teardown failed");
            }
        }

        TransportOutcome {
            session_id,
            reason,
            status,
        }
    }
}

/// Reads client frames into the session until the client goes away.
async fn read_client<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    session: &Session,
    activity: &Activity,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return CloseReason::TransportError(e.to_string()),
            None => return CloseReason::ClientClosed,
        };
        activity.touch();

        match frame {
            WsMessage::Text(text) => handle_client_frame(session, text.as_bytes()).await,
            WsMessage::Binary(bytes) => handle_client_frame(session, &bytes).await,
            WsMessage::Close(_) => return CloseReason::ClientClosed,
            // Pings are answered by tungstenite itself.
            _ => {}
        }
    }
}

/// Applies one client frame to the session.
async fn handle_client_frame(session: &Session, bytes: &[u8]) {
    let message = match ClientMessage::decode_bytes(bytes) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "Dropping malformed message");
            return;
        }
    };

    match message {
        ClientMessage::Command { data } => {
            if let Err(e) = session.write(data.as_bytes()).await {
                tracing::debug!(session_id = %session.id(), error = %e, "Dropping input");
            }
        }
        ClientMessage::Resize { rows, cols } => {
            if let Err(e) = session.resize(Geometry::new(rows, cols)).await {
                tracing::warn!(session_id = %session.id(), error = %e, "Resize failed");
            }
        }
    }
}

/// Sends session output to the client until the output stream ends.
async fn forward_output<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    output: &mut OutputStream,
    session: &Session,
    activity: &Activity,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framer = Utf8Framer::new();

    while let Some(chunk) = output.next().await {
        activity.touch();
        if let Some(message) = framer.frame(&chunk) {
            if let Err(reason) = send(sink, &message).await {
                return reason;
            }
        }
    }

    if let Some(rest) = framer.finish() {
        if let Err(reason) = send(sink, &ServerMessage::data(rest)).await {
            return reason;
        }
    }

    let status = match session.exit_status() {
        Some(status) => Some(status),
        None => tokio::time::timeout(EXIT_STATUS_WAIT, session.exited())
            .await
            .ok(),
    };
    let code = status.and_then(|s| s.code());
    tracing::debug!(session_id = %session.id(), code = ?code, "Output ended");

    match send(sink, &ServerMessage::Exit { code }).await {
        Ok(()) => CloseReason::ProcessExited,
        Err(reason) => reason,
    }
}

/// Encodes and sends one server message.
async fn send<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    message: &ServerMessage,
) -> Result<(), CloseReason>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let json = match message.encode() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode server message");
            return Ok(());
        }
    };

    sink.send(WsMessage::Text(json))
        .await
        .map_err(|e| CloseReason::TransportError(e.to_string()))
}

/// Resolves once the connection has been idle for `timeout`.
///
/// Never resolves when no timeout is set.
async fn idle_cutoff(timeout: Option<Duration>, activity: &Activity) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };

    loop {
        let deadline = activity.last() + timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
