//! End-to-end integration tests for termbridge.
//!
//! These tests run a real bridge on an ephemeral port and drive it with a
//! WebSocket client:
//! - Command input and terminal output
//! - Connection and process teardown
//! - Spawn failures
//! - Session isolation and ordering

use std::sync::Arc;
use std::time::Duration;

use daemon::config::Config;
use daemon::server::BridgeServer;
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Create a test configuration with a pinned shell and an ephemeral port.
fn create_test_config() -> Config {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1:0".to_string();
    config.session.shell = "/bin/sh".to_string();
    config.session.kill_grace_ms = 500;
    config
}

async fn start_bridge(config: Config) -> (Arc<BridgeServer>, JoinHandle<()>) {
    let server = Arc::new(BridgeServer::bind(&config).await.unwrap());
    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    (server, runner)
}

async fn connect(server: &BridgeServer) -> Client {
    let url = format!("ws://{}", server.local_addr());
    let (ws, _) = connect_async(&url).await.unwrap();
    ws
}

async fn send(client: &mut Client, message: ClientMessage) {
    let json = message.encode().unwrap();
    client.send(WsMessage::Text(json)).await.unwrap();
}

async fn send_command(client: &mut Client, data: &str) {
    send(
        client,
        ClientMessage::Command {
            data: data.to_string(),
        },
    )
    .await;
}

/// Collects `data` output until `needle` appears.
async fn read_until(client: &mut Client, needle: &str) -> String {
    let mut seen = String::new();
    let found = tokio::time::timeout(TIMEOUT, async {
        while let Some(Ok(frame)) = client.next().await {
            if let WsMessage::Text(text) = frame {
                if let Ok(ServerMessage::Data { data }) = ServerMessage::decode(&text) {
                    seen.push_str(&data);
                    if seen.contains(needle) {
                        return true;
                    }
                }
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {:?}; output was {:?}", needle, seen);
    seen
}

/// Reads until the server closes, returning every decoded message.
async fn read_to_close(client: &mut Client) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    tokio::time::timeout(TIMEOUT, async {
        while let Some(frame) = client.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    if let Ok(message) = ServerMessage::decode(&text) {
                        messages.push(message);
                    }
                }
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await
    .expect("server did not close the connection");
    messages
}

async fn wait_for_empty_registry(server: &BridgeServer) {
    let emptied = tokio::time::timeout(TIMEOUT, async {
        while !server.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(emptied.is_ok(), "registry still has {} entries", server.registry().len());
}

async fn stop_bridge(server: Arc<BridgeServer>, runner: JoinHandle<()>) {
    server.shutdown();
    tokio::time::timeout(TIMEOUT, runner)
        .await
        .expect("bridge did not stop")
        .unwrap();
}

// =============================================================================
// Basic I/O
// =============================================================================

#[tokio::test]
async fn test_echo_produces_data() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "echo hi\n").await;
    let output = read_until(&mut client, "hi\r\n").await;
    assert!(output.contains("hi"));

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_default_geometry_without_resize() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "stty size\n").await;
    read_until(&mut client, "30 80").await;

    let sessions = server.registry().list().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!((sessions[0].rows, sessions[0].cols), (Some(30), Some(80)));

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_configured_geometry() {
    let mut config = create_test_config();
    config.session.rows = 24;
    config.session.cols = 100;
    let (server, runner) = start_bridge(config).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "stty size\n").await;
    read_until(&mut client, "24 100").await;

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_resize_changes_geometry() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send(&mut client, ClientMessage::Resize { rows: 50, cols: 132 }).await;
    send_command(&mut client, "stty size\n").await;
    read_until(&mut client, "50 132").await;

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_utf8_output_is_intact() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "printf 'h\\303\\251llo_\\342\\202\\254\\n'\n").await;
    let output = read_until(&mut client, "héllo_€").await;
    assert!(!output.contains('\u{FFFD}'));

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_startup_command_runs() {
    let mut config = create_test_config();
    config.session.startup_command = Some("echo boot''_ready".to_string());
    let (server, runner) = start_bridge(config).await;
    let mut client = connect(&server).await;

    read_until(&mut client, "boot_ready").await;

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_configured_env_reaches_shell() {
    let mut config = create_test_config();
    config
        .session
        .env
        .insert("BRIDGE_TEST_VALUE".to_string(), "env_marker_42".to_string());
    let (server, runner) = start_bridge(config).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "echo $BRIDGE_TEST_VALUE\n").await;
    read_until(&mut client, "env_marker_42").await;

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_working_dir_is_used() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config();
    config.session.working_dir = Some(temp_dir.path().to_path_buf());
    let (server, runner) = start_bridge(config).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "pwd\n").await;
    let dir_name = temp_dir.path().file_name().unwrap().to_str().unwrap();
    read_until(&mut client, &format!("{}\r\n", dir_name)).await;

    stop_bridge(server, runner).await;
}

// =============================================================================
// Malformed Input
// =============================================================================

#[tokio::test]
async fn test_malformed_messages_do_not_end_session() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    for junk in [
        "garbage",
        "{}",
        r#"{"type":"command"}"#,
        r#"{"type":"upload","data":"x"}"#,
        r#"{"type":"resize","rows":0,"cols":80}"#,
    ] {
        client.send(WsMessage::Text(junk.to_string())).await.unwrap();
    }
    client.send(WsMessage::Binary(vec![0xc3, 0x28])).await.unwrap();

    send_command(&mut client, "echo sur''vived\n").await;
    read_until(&mut client, "survived").await;
    assert_eq!(server.registry().len(), 1);

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_binary_frame_with_json_is_accepted() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    let json = ClientMessage::Command {
        data: "echo bin''ary_ok\n".to_string(),
    }
    .encode()
    .unwrap();
    client.send(WsMessage::Binary(json.into_bytes())).await.unwrap();
    read_until(&mut client, "binary_ok").await;

    stop_bridge(server, runner).await;
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_command_pieces_arrive_in_order() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    let mut pieces = vec!["echo seq".to_string(), "''".to_string(), "_".to_string()];
    pieces.extend((0..10).map(|i| i.to_string()));
    pieces.push("_end\n".to_string());
    for piece in pieces {
        send_command(&mut client, &piece).await;
    }

    read_until(&mut client, "seq_0123456789_end").await;

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_output_lines_arrive_in_order() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send_command(
        &mut client,
        "i=0; while [ $i -lt 300 ]; do echo n$i; i=$((i+1)); done; echo lo''op_done\n",
    )
    .await;
    let output = read_until(&mut client, "loop_done").await;

    let numbers: Vec<u32> = output
        .split(['\r', '\n'])
        .filter_map(|line| line.strip_prefix('n'))
        .filter_map(|rest| rest.parse().ok())
        .collect();
    assert_eq!(numbers, (0..300).collect::<Vec<_>>());

    stop_bridge(server, runner).await;
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_abrupt_disconnect_kills_shell() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "echo rea''dy\n").await;
    read_until(&mut client, "ready").await;

    let sessions = server.registry().list().await;
    let pid = sessions[0].pid.expect("shell pid");

    drop(client);
    wait_for_empty_registry(&server).await;

    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    assert!(
        kill(Pid::from_raw(pid as i32), None).is_err(),
        "shell {} still alive after disconnect",
        pid
    );

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_abrupt_disconnect_kills_hup_immune_shell() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "trap '' HUP; echo im''mune; exec sleep 1000\n").await;
    read_until(&mut client, "immune").await;

    let sessions = server.registry().list().await;
    let pid = sessions[0].pid.expect("shell pid");

    drop(client);
    wait_for_empty_registry(&server).await;

    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    let mut alive = true;
    for _ in 0..30 {
        if kill(Pid::from_raw(pid as i32), None).is_err() {
            alive = false;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!alive, "HUP-immune process {} survived disconnect", pid);

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_client_close_removes_session() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "echo x''y\n").await;
    read_until(&mut client, "xy").await;
    assert_eq!(server.registry().len(), 1);

    client.close(None).await.unwrap();
    wait_for_empty_registry(&server).await;

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_process_exit_closes_connection() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut client = connect(&server).await;

    send_command(&mut client, "echo bye; exit 3\n").await;
    let messages = read_to_close(&mut client).await;

    assert_eq!(messages.last(), Some(&ServerMessage::Exit { code: Some(3) }));
    let output: String = messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Data { data } => Some(data.as_str()),
            _ => None,
        })
        .collect();
    assert!(output.contains("bye"));

    wait_for_empty_registry(&server).await;
    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_idle_timeout_closes_connection() {
    let mut config = create_test_config();
    config.session.idle_timeout_secs = 1;
    let (server, runner) = start_bridge(config).await;
    let mut client = connect(&server).await;

    read_to_close(&mut client).await;
    wait_for_empty_registry(&server).await;

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_shutdown_closes_all_connections() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut first = connect(&server).await;
    let mut second = connect(&server).await;

    send_command(&mut first, "echo o''ne\n").await;
    read_until(&mut first, "one").await;
    send_command(&mut second, "echo t''wo\n").await;
    read_until(&mut second, "two").await;
    assert_eq!(server.registry().len(), 2);

    server.shutdown();
    read_to_close(&mut first).await;
    read_to_close(&mut second).await;

    tokio::time::timeout(TIMEOUT, runner).await.unwrap().unwrap();
    assert!(server.registry().is_empty());
}

// =============================================================================
// Spawn Failures
// =============================================================================

#[tokio::test]
async fn test_invalid_working_dir_sends_error() {
    let mut config = create_test_config();
    config.session.working_dir = Some("/nonexistent/termbridge/dir".into());
    let (server, runner) = start_bridge(config).await;
    let mut client = connect(&server).await;

    let messages = read_to_close(&mut client).await;
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ServerMessage::Error { message } => {
            assert!(message.contains("working directory"), "message: {}", message)
        }
        other => panic!("Expected error message, got {:?}", other),
    }
    assert!(server.registry().is_empty());

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_missing_shell_sends_error() {
    let mut config = create_test_config();
    config.session.shell = "/nonexistent/bin/shell".to_string();
    let (server, runner) = start_bridge(config).await;
    let mut client = connect(&server).await;

    let messages = read_to_close(&mut client).await;
    assert!(matches!(messages.as_slice(), [ServerMessage::Error { .. }]));
    assert!(server.registry().is_empty());

    // The listener keeps accepting after a failed spawn.
    let mut again = connect(&server).await;
    assert!(matches!(
        read_to_close(&mut again).await.as_slice(),
        [ServerMessage::Error { .. }]
    ));

    stop_bridge(server, runner).await;
}

// =============================================================================
// Isolation
// =============================================================================

#[tokio::test]
async fn test_concurrent_clients_are_isolated() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    send_command(&mut alice, "echo alice''_secret\n").await;
    send_command(&mut bob, "echo bob''_secret\n").await;

    let alice_output = read_until(&mut alice, "alice_secret").await;
    let bob_output = read_until(&mut bob, "bob_secret").await;

    send_command(&mut alice, "echo alice''_done\n").await;
    send_command(&mut bob, "echo bob''_done\n").await;
    let alice_output = alice_output + &read_until(&mut alice, "alice_done").await;
    let bob_output = bob_output + &read_until(&mut bob, "bob_done").await;

    assert!(!alice_output.contains("bob"));
    assert!(!bob_output.contains("alice"));

    let sessions = server.registry().list().await;
    assert_eq!(sessions.len(), 2);
    assert_ne!(sessions[0].id, sessions[1].id);
    assert_ne!(sessions[0].pid, sessions[1].pid);

    stop_bridge(server, runner).await;
}

#[tokio::test]
async fn test_kill_one_session_leaves_other_running() {
    let (server, runner) = start_bridge(create_test_config()).await;
    let mut first = connect(&server).await;
    let mut second = connect(&server).await;

    send_command(&mut first, "echo f''irst\n").await;
    read_until(&mut first, "first").await;
    send_command(&mut second, "echo s''econd\n").await;
    read_until(&mut second, "second").await;

    let sessions = server.registry().list().await;
    let victim = sessions[0].id.clone();
    server.registry().kill(&victim).await.unwrap();

    // Whichever client lost its shell is disconnected.
    let survivors = tokio::time::timeout(TIMEOUT, async {
        while server.registry().len() != 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(survivors.is_ok());
    assert!(!server.registry().contains(&victim));

    let remaining = server.registry().list().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].state, daemon::session::SessionState::Running);

    stop_bridge(server, runner).await;
}
