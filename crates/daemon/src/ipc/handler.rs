//! Answers control socket requests against a running [`BridgeServer`].

use std::sync::Arc;

use crate::server::BridgeServer;
use crate::session::SessionError;

use super::messages::{IpcRequest, IpcResponse, IpcSessionInfo};
use super::server::{IpcConnection, IpcError, IpcServer};

/// Accepts control connections until the bridge shuts down.
pub async fn serve(listener: IpcServer, bridge: Arc<BridgeServer>) {
    tracing::info!(path = %listener.path().display(), "Control socket listening");

    loop {
        let conn = tokio::select! {
            _ = wait_for_shutdown(&bridge) => break,
            accepted = listener.accept() => accepted,
        };

        match conn {
            Ok(conn) => {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, &bridge).await {
                        tracing::debug!(error = %e, "Control connection ended with error");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "Failed to accept control connection"),
        }
    }
}

async fn wait_for_shutdown(bridge: &BridgeServer) {
    bridge.shutdown_token().cancelled().await
}

async fn handle_connection(mut conn: IpcConnection, bridge: &BridgeServer) -> Result<(), IpcError> {
    loop {
        let request = match conn.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(IpcError::Json(e)) => {
                let response = IpcResponse::Error {
                    message: format!("invalid request: {}", e),
                };
                conn.send_response(&response).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(request = ?request, "Control request");
        let response = handle_request(bridge, request).await;
        conn.send_response(&response).await?;
    }
}

/// Produces the response to one request.
pub async fn handle_request(bridge: &BridgeServer, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong,
        IpcRequest::Status => IpcResponse::Status {
            running: !bridge.is_shutting_down(),
            uptime_secs: bridge.uptime().as_secs(),
            session_count: bridge.registry().len(),
            bind: bridge.local_addr().to_string(),
        },
        IpcRequest::ListSessions => {
            let sessions = bridge
                .registry()
                .list()
                .await
                .into_iter()
                .map(IpcSessionInfo::from)
                .collect();
            IpcResponse::Sessions { sessions }
        }
        IpcRequest::KillSession { session_id } => match bridge.registry().kill(&session_id).await {
            Ok(status) => IpcResponse::SessionKilled {
                session_id,
                exit_code: status.and_then(|s| s.code()),
            },
            Err(e @ SessionError::NotFound(_)) => IpcResponse::Error {
                message: e.to_string(),
            },
            Err(e) => IpcResponse::Error {
                message: format!("failed to kill {}: {}", session_id, e),
            },
        },
        IpcRequest::Stop => {
            bridge.shutdown();
            IpcResponse::Stopping
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ipc::IpcClient;
    use crate::session::{Session, SpawnOptions};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn test_bridge() -> Arc<BridgeServer> {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".to_string();
        config.session.shell = "/bin/sh".to_string();
        Arc::new(BridgeServer::bind(&config).await.unwrap())
    }

    #[tokio::test]
    async fn test_ping_and_status() {
        let bridge = test_bridge().await;

        assert_eq!(handle_request(&bridge, IpcRequest::Ping).await, IpcResponse::Pong);

        match handle_request(&bridge, IpcRequest::Status).await {
            IpcResponse::Status {
                running,
                session_count,
                bind,
                ..
            } => {
                assert!(running);
                assert_eq!(session_count, 0);
                assert_eq!(bind, bridge.local_addr().to_string());
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_and_kill_sessions() {
        let bridge = test_bridge().await;
        let options = SpawnOptions {
            program: "/bin/sh".to_string(),
            kill_grace: Duration::from_millis(500),
            ..SpawnOptions::default()
        };
        let (session, _output) = Session::spawn(&options).unwrap();
        let session = Arc::new(session);
        bridge.registry().insert(&session, None);

        match handle_request(&bridge, IpcRequest::ListSessions).await {
            IpcResponse::Sessions { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(&sessions[0].id, session.id());
                assert_eq!(sessions[0].state, "running");
            }
            other => panic!("Expected Sessions, got {:?}", other),
        }

        let response = handle_request(
            &bridge,
            IpcRequest::KillSession {
                session_id: session.id().clone(),
            },
        )
        .await;
        assert!(matches!(response, IpcResponse::SessionKilled { .. }));
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_kill_unknown_session() {
        let bridge = test_bridge().await;
        let response = handle_request(
            &bridge,
            IpcRequest::KillSession {
                session_id: "missing".to_string(),
            },
        )
        .await;
        assert_eq!(
            response,
            IpcResponse::Error {
                message: "session not found: missing".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_stop_over_socket() {
        let bridge = test_bridge().await;
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("bridge.sock");
        let listener = IpcServer::bind(&socket_path).await.unwrap();
        let serving = tokio::spawn(serve(listener, bridge.clone()));

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());
        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);
        assert!(bridge.is_shutting_down());

        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
    }
}
