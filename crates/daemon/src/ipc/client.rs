//! Control socket client used by the CLI.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A client for talking to a running bridge.
pub struct IpcClient {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connects to the bridge at `path`.
    ///
    /// Fails if nothing is listening, which usually means the bridge is not
    /// running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    /// Connects with a custom timeout, which also applies to every request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Sets the timeout for subsequent requests.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends a request and waits for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.round_trip(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn round_trip(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bridge closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns true if the bridge answers a ping.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Gets the bridge status.
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    /// Asks the bridge to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    /// Lists active sessions.
    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    /// Terminates one session.
    pub async fn kill_session(&mut self, session_id: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::KillSession { session_id }).await
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}
