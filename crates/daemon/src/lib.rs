//! # termbridge
//!
//! Bridges browser terminals to real shells. Every WebSocket connection gets
//! its own pseudo-terminal with a freshly spawned shell; keystrokes flow in as
//! `command` messages and terminal output flows back as `data` messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        BridgeServer                          │
//! │   TcpListener ─ accept ─▶ task per connection                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────────┐        ┌──────────────────────────┐  │
//! │  │  TransportAdapter  │ ◀────▶ │         Session          │  │
//! │  │  (WebSocket JSON)  │        │  (PTY + shell process)   │  │
//! │  └────────────────────┘        └──────────────────────────┘  │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │      SessionRegistry (weak refs, used by the CLI)      │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{BridgeServer, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let server = BridgeServer::bind(&config).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions and the session registry
//! - [`transport`]: WebSocket adapter pairing a connection with a session
//! - [`server`]: Listener and per-connection supervision
//! - `ipc`: Local control socket used by the CLI (Unix only)

pub mod config;
#[cfg(unix)]
pub mod ipc;
pub mod server;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use server::{BridgeServer, ServerError};
pub use session::{
    Geometry, OutputStream, Session, SessionError, SessionId, SessionInfo, SessionRegistry,
    SessionState, SessionStatus, SpawnOptions,
};
pub use transport::{CloseReason, TransportAdapter, TransportOutcome};
