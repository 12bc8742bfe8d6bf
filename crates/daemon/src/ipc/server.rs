//! Control socket listener.
//!
//! Accepts CLI connections on a Unix socket and exchanges newline-delimited
//! JSON requests and responses with them.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// Largest request line accepted from a client.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Listener for control socket connections.
///
/// The socket file is removed again when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Binds the control socket at `path`.
    ///
    /// Missing parent directories are created with mode 0700 and a stale
    /// socket file left behind by a previous run is replaced.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another bridge is listening on {}", path.display()),
                ));
            }
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!(path = %path.display(), "Control socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next CLI connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove control socket");
            }
        }
    }
}

/// One CLI connection.
pub struct IpcConnection {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Reads the next request.
    ///
    /// Returns `None` once the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = (&mut self.reader)
            .take(MAX_REQUEST_BYTES as u64)
            .read_line(&mut line)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && bytes_read >= MAX_REQUEST_BYTES {
            return Err(IpcError::RequestTooLarge);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Sends one response.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The request line exceeded the size limit.
    #[error("request exceeds {MAX_REQUEST_BYTES} bytes")]
    RequestTooLarge,
}
