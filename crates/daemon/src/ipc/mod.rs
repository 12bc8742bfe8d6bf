//! Local control socket for the `termbridge` CLI.
//!
//! ## Overview
//!
//! A running bridge listens on a Unix socket next to its WebSocket listener.
//! The CLI connects to it to query status, list or kill sessions, and stop
//! the bridge. Each message is a single JSON object followed by a newline.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/termbridge/bridge.sock`
//! - Fallback: `/tmp/termbridge-$UID/bridge.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&socket_path()).await?;
//!
//!     if client.ping().await? {
//!         println!("bridge is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod handler;
mod messages;
mod server;

pub use client::IpcClient;
pub use handler::{handle_request, serve};
pub use messages::{IpcRequest, IpcResponse, IpcSessionInfo};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Returns the control socket path for the current user.
pub fn socket_path() -> PathBuf {
    socket_path_in(std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from))
}

fn socket_path_in(runtime_dir: Option<PathBuf>) -> PathBuf {
    match runtime_dir.filter(|dir| !dir.as_os_str().is_empty()) {
        Some(dir) => dir.join("termbridge").join("bridge.sock"),
        None => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/termbridge-{}", uid)).join("bridge.sock")
        }
    }
}
