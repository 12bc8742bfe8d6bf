//! Bridge server: accepts WebSocket connections and gives each one a shell.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::SinkExt;
use protocol::ServerMessage;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Config, ConfigError};
use crate::session::{Session, SessionError, SessionRegistry, SpawnOptions};
use crate::transport::{TransportAdapter, TransportOutcome};

/// Pause after a failed accept, so a full fd table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors raised by the bridge server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration could not be used.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The WebSocket handshake failed.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    /// The shell for a connection could not be started.
    #[error(transparent)]
    Spawn(#[from] SessionError),
}

/// Everything a connection task needs, shared by all of them.
struct ConnectionContext {
    registry: Arc<SessionRegistry>,
    spawn_options: SpawnOptions,
    idle_timeout: Option<Duration>,
    ws_config: WebSocketConfig,
    shutdown: CancellationToken,
}

/// WebSocket server pairing every connection with its own PTY session.
pub struct BridgeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ConnectionContext>,
    tracker: TaskTracker,
    started_at: Instant,
}

impl BridgeServer {
    /// Binds the listener described by `config`.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.server.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.server.max_message_bytes);
        ws_config.max_frame_size = Some(config.server.max_message_bytes);

        let context = ConnectionContext {
            registry: Arc::new(SessionRegistry::new()),
            spawn_options: config.session.spawn_options(),
            idle_timeout: config.session.idle_timeout(),
            ws_config,
            shutdown: CancellationToken::new(),
        };

        tracing::info!(addr = %local_addr, shell = %context.spawn_options.program, "Bridge listening");

        Ok(Self {
            listener,
            local_addr,
            context: Arc::new(context),
            tracker: TaskTracker::new(),
            started_at: Instant::now(),
        })
    }

    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the registry of live sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.context.registry
    }

    /// Returns how long the server has been up.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns true once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.context.shutdown.is_cancelled()
    }

    /// Returns a token cancelled when shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    /// Stops accepting connections and tears down every open one.
    pub fn shutdown(&self) {
        if !self.context.shutdown.is_cancelled() {
            tracing::info!("Bridge shutting down");
        }
        self.context.shutdown.cancel();
    }

    /// Accepts connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// Returns once every connection task has finished its teardown.
    pub async fn run(&self) {
        loop {
            let accepted = tokio::select! {
                _ = self.context.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "Accepted TCP connection");
                    let context = self.context.clone();
                    self.tracker.spawn(async move {
                        match handle_connection(context, stream, peer).await {
                            Ok(outcome) => tracing::info!(
                                peer = %peer,
                                session_id = %outcome.session_id,
                                reason = %outcome.reason,
                                status = ?outcome.status,
                                "Connection closed"
                            ),
                            Err(e) => tracing::warn!(peer = %peer, error = %e, "Connection failed"),
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        self.tracker.close();
        tracing::debug!(connections = self.tracker.len(), "Waiting for connections to close");
        self.tracker.wait().await;
        tracing::info!("Bridge stopped");
    }
}

/// Serves one connection from handshake to teardown.
async fn handle_connection(
    context: Arc<ConnectionContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<TransportOutcome, ServerError> {
    let mut ws = accept_async_with_config(stream, Some(context.ws_config))
        .await
        .map_err(|e| ServerError::Handshake(e.to_string()))?;

    // Opening the PTY and forking the shell block.
    let options = context.spawn_options.clone();
    let spawned = tokio::task::spawn_blocking(move || Session::spawn(&options))
        .await
        .unwrap_or_else(|e| Err(SessionError::SpawnFailed(e.to_string())));

    let (session, output) = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(peer = %peer, error = %e, "Failed to spawn session");
            if let Ok(json) = ServerMessage::error(e.to_string()).encode() {
                let _ = ws.send(WsMessage::Text(json)).await;
            }
            let _ = ws.close(None).await;
            return Err(e.into());
        }
    };

    let session = Arc::new(session);
    context.registry.insert(&session, Some(peer));
    tracing::info!(peer = %peer, session_id = %session.id(), "Session started");

    let outcome = TransportAdapter::new(session.clone(), output)
        .with_idle_timeout(context.idle_timeout)
        .with_shutdown(context.shutdown.child_token())
        .run(ws)
        .await;

    context.registry.remove(session.id());
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_tungstenite::connect_async;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".to_string();
        config.session.shell = "/bin/sh".to_string();
        config.session.kill_grace_ms = 500;
        config
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = BridgeServer::bind(&test_config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.registry().is_empty());
        assert!(!server.is_shutting_down());
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let mut config = test_config();
        config.server.bind = "not an address".to_string();

        let result = BridgeServer::bind(&config).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = BridgeServer::bind(&test_config()).await.unwrap();
        let mut config = test_config();
        config.server.bind = first.local_addr().to_string();

        let result = BridgeServer::bind(&config).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let server = Arc::new(BridgeServer::bind(&test_config()).await.unwrap());
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(server.is_shutting_down());
    }

    #[tokio::test]
    async fn test_spawn_failure_sends_error() {
        let mut config = test_config();
        config.session.shell = "/nonexistent/shell".to_string();
        let server = Arc::new(BridgeServer::bind(&config).await.unwrap());
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let url = format!("ws://{}", server.local_addr());
        let (mut ws, _) = connect_async(&url).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let WsMessage::Text(text) = frame else {
            panic!("expected a text frame, got {:?}", frame);
        };
        assert!(matches!(
            ServerMessage::decode(&text).unwrap(),
            ServerMessage::Error { .. }
        ));
        assert!(server.registry().is_empty());

        server.shutdown();
        runner.await.unwrap();
    }
}
