//! termbridge
//!
//! WebSocket bridge between browser terminals and PTY-backed shells.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::server::BridgeServer;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use daemon::ipc::{socket_path, IpcClient, IpcResponse, IpcServer, IpcSessionInfo};

/// termbridge - WebSocket bridge between browser terminals and shells.
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the bridge in the foreground
    Start {
        /// Address to listen on (overrides config and TERMBRIDGE_BIND)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Stop the running bridge
    Stop {
        /// Seconds to wait for the bridge to exit
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Show bridge status
    Status,

    /// Manage active sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all active sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Terminate an active session
    Kill {
        /// Session ID to kill
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(path) = &cli.config {
        tracing::info!("Using config file: {:?}", path);
    }

    match cli.command {
        Commands::Start { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;
            run_bridge(config).await?;
        }
        #[cfg(unix)]
        Commands::Stop { timeout } => {
            stop_bridge(timeout).await?;
            println!("Bridge stopped");
        }
        #[cfg(unix)]
        Commands::Status => match query_status().await {
            Ok(status) => print_status(&status),
            Err(e) => {
                eprintln!("Bridge is not running: {}", e);
                std::process::exit(1);
            }
        },
        #[cfg(unix)]
        Commands::Sessions(SessionsCommands::List { json }) => {
            let sessions = query_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        #[cfg(unix)]
        Commands::Sessions(SessionsCommands::Kill { session_id }) => {
            let exit_code = kill_session(&session_id).await?;
            match exit_code {
                Some(code) => println!("Session {} terminated (exit code {})", session_id, code),
                None => println!("Session {} terminated", session_id),
            }
        }
        #[cfg(not(unix))]
        _ => anyhow::bail!("this command needs the control socket, which requires a Unix host"),
    }

    Ok(())
}

/// Runs the bridge until a signal or a `stop` request arrives.
async fn run_bridge(config: Config) -> anyhow::Result<()> {
    #[cfg(unix)]
    let control = IpcServer::bind(&socket_path())
        .await
        .context("Failed to bind control socket (is another bridge running?)")?;

    let server = Arc::new(
        BridgeServer::bind(&config)
            .await
            .context("Failed to start bridge")?,
    );

    #[cfg(unix)]
    let control_task = tokio::spawn(daemon::ipc::serve(control, server.clone()));

    let signals = {
        let server = server.clone();
        let stopped = server.shutdown_token();
        tokio::spawn(async move {
            tokio::select! {
                result = wait_for_shutdown_signal() => {
                    if let Err(e) = result {
                        tracing::error!("Failed to listen for shutdown signals: {}", e);
                        return;
                    }
                    server.shutdown();
                }
                _ = stopped.cancelled() => {}
            }
        })
    };

    server.run().await;

    signals.abort();
    #[cfg(unix)]
    {
        if let Err(e) = control_task.await {
            tracing::warn!("Control socket task failed: {}", e);
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}

/// Status information returned by the bridge.
#[cfg(unix)]
struct BridgeStatus {
    running: bool,
    uptime_secs: u64,
    session_count: usize,
    bind: String,
}

#[cfg(unix)]
async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&socket_path(), Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("cannot connect to control socket"))
}

/// Query the bridge status via IPC.
#[cfg(unix)]
async fn query_status() -> anyhow::Result<BridgeStatus> {
    match connect().await?.status().await? {
        IpcResponse::Status {
            running,
            uptime_secs,
            session_count,
            bind,
        } => Ok(BridgeStatus {
            running,
            uptime_secs,
            session_count,
            bind,
        }),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from bridge"),
    }
}

#[cfg(unix)]
fn print_status(status: &BridgeStatus) {
    println!(
        "Bridge Status: {}",
        if status.running { "running" } else { "stopping" }
    );
    println!("  Listening: {}", status.bind);
    println!("  Uptime:    {}", format_duration(status.uptime_secs));
    println!("  Sessions:  {}", status.session_count);
}

/// Query the active sessions via IPC.
#[cfg(unix)]
async fn query_sessions() -> anyhow::Result<Vec<IpcSessionInfo>> {
    match connect().await?.list_sessions().await? {
        IpcResponse::Sessions { sessions } => Ok(sessions),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from bridge"),
    }
}

/// Terminate a session via IPC.
#[cfg(unix)]
async fn kill_session(session_id: &str) -> anyhow::Result<Option<i32>> {
    match connect().await?.kill_session(session_id.to_string()).await? {
        IpcResponse::SessionKilled { exit_code, .. } => Ok(exit_code),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from bridge"),
    }
}

/// Ask the bridge to stop and wait until its control socket goes away.
#[cfg(unix)]
async fn stop_bridge(timeout_secs: u64) -> anyhow::Result<()> {
    let path = socket_path();
    let mut client = connect().await.context("Bridge is not running")?;

    match client.stop().await? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for bridge to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Bridge returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from bridge"),
    }
    drop(client);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while tokio::time::Instant::now() < deadline {
        if !path.exists()
            || IpcClient::connect_with_timeout(&path, Duration::from_millis(100))
                .await
                .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    anyhow::bail!("Timeout waiting for bridge to exit ({}s)", timeout_secs)
}

/// Print sessions in a formatted table.
#[cfg(unix)]
fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let peer_width = sessions
        .iter()
        .map(|s| s.peer.as_deref().map(str::len).unwrap_or(1))
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<36}  {:>7}  {:<peer_width$}  {:>8}  {:<11}  {:>10}",
        "ID",
        "PID",
        "PEER",
        "SIZE",
        "STATE",
        "CONNECTED",
        peer_width = peer_width
    );
    println!("{}", "-".repeat(36 + 7 + peer_width + 8 + 11 + 10 + 10));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let size = match (session.cols, session.rows) {
            (Some(cols), Some(rows)) => format!("{}x{}", cols, rows),
            _ => "-".to_string(),
        };

        println!(
            "{:<36}  {:>7}  {:<peer_width$}  {:>8}  {:<11}  {:>10}",
            session.id,
            pid,
            session.peer.as_deref().unwrap_or("-"),
            size,
            session.state,
            format_relative_time(session.connected_at),
            peer_width = peer_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
#[cfg(unix)]
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
