//! PTY-backed shell sessions.
//!
//! A [`Session`] owns exactly one shell process attached to the slave side of
//! a pseudo-terminal. The bridge keeps the master side and drives it from
//! three blocking worker threads:
//!
//! - the reader copies PTY output into a bounded channel consumed through
//!   [`OutputStream`],
//! - the writer drains a bounded input queue into the PTY in FIFO order,
//! - the exit monitor reaps the child and publishes its [`SessionStatus`].
//!
//! Lifecycle state and geometry are the only shared mutable state; the former
//! lives in a `watch` channel and the latter under the same mutex as the PTY
//! master. [`Session::terminate`] releases every resource exactly once no
//! matter how many times, or from how many tasks, it is called.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for a session.
pub type SessionId = String;

/// Default terminal width used until the client sends a resize.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used until the client sends a resize.
pub const DEFAULT_ROWS: u16 = 30;

/// Default `TERM` value exported to the shell.
pub const DEFAULT_TERM: &str = "xterm-color";

/// Default time a shell gets to exit after a hangup before it is killed.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the output and input channels, in chunks.
const CHANNEL_CAPACITY: usize = 256;

/// How long the output stream stays open after the child exits, so that
/// output written right before exit still reaches the client.
const EXIT_LINGER: Duration = Duration::from_millis(250);

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Failed to allocate the PTY or launch the shell.
    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    /// Input was sent to a session that no longer accepts writes.
    #[error("session closed: {0}")]
    Closed(SessionId),

    /// The operation requires a running session.
    #[error("session not running: {0}")]
    NotRunning(SessionId),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
}

/// Liveness of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// PTY allocated, workers not yet started.
    Starting,
    /// Shell is running and accepting input.
    Running,
    /// Teardown in progress.
    Terminating,
    /// All resources released.
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How the shell process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session has exited with a code.
    Exited(i32),
    /// The process could not be reaped; its exit code is unknown.
    Terminated,
}

impl SessionStatus {
    /// Returns the exit code, if known.
    pub fn code(&self) -> Option<i32> {
        match self {
            SessionStatus::Exited(code) => Some(*code),
            SessionStatus::Terminated => None,
        }
    }
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl Geometry {
    /// Creates a geometry from rows and columns.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}

impl From<Geometry> for PtySize {
    fn from(geometry: Geometry) -> Self {
        PtySize {
            rows: geometry.rows,
            cols: geometry.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Parameters used to spawn a session.
///
/// The server builds one of these from configuration and reuses it for every
/// connection; tests construct their own to pin the shell.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell program.
    pub program: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Working directory. `None` means the user's home directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// `TERM` value exported to the shell.
    pub term: String,
    /// Initial terminal geometry.
    pub geometry: Geometry,
    /// Command written to the shell right after spawn.
    pub startup_command: Option<String>,
    /// How long to wait after a hangup before force-killing.
    pub kill_grace: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            program: default_shell(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            term: DEFAULT_TERM.to_string(),
            geometry: Geometry::default(),
            startup_command: None,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// The PTY master together with the geometry it was last sized to.
struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    geometry: Geometry,
}

/// A PTY session with a shell process.
pub struct Session {
    /// Unique session identifier.
    id: SessionId,

    /// Process ID of the shell.
    pid: Option<u32>,

    /// Working directory the shell was started in.
    cwd: PathBuf,

    /// When the session was spawned.
    created_at: SystemTime,

    /// The PTY master; `None` once released.
    pty: Mutex<Option<PtyHandle>>,

    /// Input queue feeding the writer thread; `None` once closed.
    input_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,

    /// Kills the child from outside the exit monitor; `None` once released.
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,

    /// Lifecycle state.
    state: watch::Sender<SessionState>,

    /// Exit status published by the exit monitor.
    exit_rx: watch::Receiver<Option<SessionStatus>>,

    /// Cancelled on teardown or shortly after the child exits.
    closed: CancellationToken,

    /// Grace period between hangup and kill.
    kill_grace: Duration,
}

impl Session {
    /// Spawns a new PTY session.
    ///
    /// # Returns
    /// A running session and the single consumer of its output.
    pub fn spawn(options: &SpawnOptions) -> Result<(Self, OutputStream), SessionError> {
        let id = Uuid::new_v4().to_string();
        let cwd = resolve_cwd(options.cwd.as_deref())?;
        let (state, _) = watch::channel(SessionState::Starting);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(options.geometry.into())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // Take both ends of the master before the child exists, so that a
        // failure here leaves nothing to clean up.
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.program);
        cmd.args(&options.args);
        cmd.cwd(&cwd);
        cmd.env("TERM", &options.term);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", options.program, e)))?;

        // Only the child may hold the slave, otherwise the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let closed = CancellationToken::new();
        let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        if let Err(e) = start_workers(&id, reader, writer, child, output_tx, input_rx, exit_tx, &closed)
        {
            #[cfg(unix)]
            if let Some(pgid) = pid.and_then(process_group) {
                let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
            }
            let _ = killer.kill();
            return Err(e);
        }

        if let Some(command) = &options.startup_command {
            let mut line = command.clone().into_bytes();
            if !line.ends_with(b"\n") {
                line.push(b'\n');
            }
            if input_tx.try_send(line).is_err() {
                tracing::warn!(session_id = %id, "Failed to queue startup command");
            }
        }

        state.send_replace(SessionState::Running);

        tracing::info!(
            session_id = %id,
            pid = ?pid,
            shell = %options.program,
            cwd = %cwd.display(),
            rows = options.geometry.rows,
            cols = options.geometry.cols,
            "Spawned session"
        );

        let output = OutputStream {
            session_id: id.clone(),
            rx: output_rx,
            closed: closed.clone(),
        };

        let session = Session {
            id,
            pid,
            cwd,
            created_at: SystemTime::now(),
            pty: Mutex::new(Some(PtyHandle {
                master: pair.master,
                geometry: options.geometry,
            })),
            input_tx: Mutex::new(Some(input_tx)),
            killer: Mutex::new(Some(killer)),
            state,
            exit_rx,
            closed,
            kill_grace: options.kill_grace,
        };

        Ok((session, output))
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the working directory the shell was started in.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Returns when the session was spawned.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns whether the session is still running.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Returns the exit status if the shell has been reaped.
    pub fn exit_status(&self) -> Option<SessionStatus> {
        *self.exit_rx.borrow()
    }

    /// Returns the current terminal geometry, or `None` once released.
    pub async fn geometry(&self) -> Option<Geometry> {
        self.pty.lock().await.as_ref().map(|pty| pty.geometry)
    }

    /// Waits for the shell to exit.
    pub async fn exited(&self) -> SessionStatus {
        let mut rx = self.exit_rx.clone();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(SessionStatus::Terminated),
            Err(_) => SessionStatus::Terminated,
        };
        status
    }

    /// Queues bytes for the shell's input.
    ///
    /// Bytes from successive calls reach the PTY in call order.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        if data.is_empty() {
            return Ok(());
        }

        let tx = self.input_tx.lock().await.clone();
        let Some(tx) = tx else {
            return Err(SessionError::Closed(self.id.clone()));
        };

        tx.send(data.to_vec())
            .await
            .map_err(|_| SessionError::Closed(self.id.clone()))
    }

    /// Resizes the PTY. Does nothing if the geometry is unchanged.
    pub async fn resize(&self, geometry: Geometry) -> Result<(), SessionError> {
        if !geometry.is_valid() {
            return Err(SessionError::ResizeFailed(format!(
                "invalid geometry {}x{}",
                geometry.rows, geometry.cols
            )));
        }
        if !self.is_running() {
            return Err(SessionError::NotRunning(self.id.clone()));
        }

        let mut guard = self.pty.lock().await;
        let Some(pty) = guard.as_mut() else {
            return Err(SessionError::NotRunning(self.id.clone()));
        };

        if pty.geometry == geometry {
            return Ok(());
        }

        pty.master
            .resize(geometry.into())
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        pty.geometry = geometry;

        tracing::debug!(
            session_id = %self.id,
            rows = geometry.rows,
            cols = geometry.cols,
            "Resized PTY"
        );

        Ok(())
    }

    /// Tears the session down and releases all of its resources.
    ///
    /// The shell's process group receives a hangup; if it is still alive after
    /// the grace period it is killed. Safe to call repeatedly and from several
    /// tasks at once: the first caller does the work, concurrent callers wait
    /// for it to finish, later callers return immediately.
    pub async fn terminate(&self) -> Option<SessionStatus> {
        let first = self.state.send_if_modified(|state| match state {
            SessionState::Starting | SessionState::Running => {
                *state = SessionState::Terminating;
                true
            }
            SessionState::Terminating | SessionState::Terminated => false,
        });

        if !first {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|s| *s == SessionState::Terminated).await;
            return self.exit_status();
        }

        // Stop accepting input; the writer thread exits once its queue drains.
        self.input_tx.lock().await.take();

        let mut killer = self.killer.lock().await.take();
        if self.exit_status().is_none() {
            let hung_up = self.hang_up();
            if !hung_up || tokio::time::timeout(self.kill_grace, self.exited()).await.is_err() {
                tracing::debug!(session_id = %self.id, "Killing shell");
                self.force_kill(killer.as_mut());
                if tokio::time::timeout(self.kill_grace, self.exited()).await.is_err() {
                    tracing::warn!(session_id = %self.id, pid = ?self.pid, "Shell still running after SIGKILL");
                }
            }
        }
        drop(killer);

        // Dropping the master closes the PTY.
        self.pty.lock().await.take();
        self.closed.cancel();
        self.state.send_replace(SessionState::Terminated);

        let status = self.exit_status();
        tracing::info!(session_id = %self.id, status = ?status, "Session terminated");
        status
    }

    /// Sends SIGHUP to the shell's process group, like a terminal hangup.
    ///
    /// Returns false if no signal could be delivered.
    fn hang_up(&self) -> bool {
        self.signal_group(GroupSignal::Hangup)
    }

    /// Kills the shell's process group, falling back to the child killer
    /// when the group cannot be signalled.
    fn force_kill(&self, killer: Option<&mut Box<dyn ChildKiller + Send + Sync>>) {
        if self.exit_status().is_some() || self.signal_group(GroupSignal::Kill) {
            return;
        }
        if let Some(killer) = killer {
            if let Err(e) = killer.kill() {
                tracing::debug!(session_id = %self.id, error = %e, "Kill failed");
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: GroupSignal) -> bool {
        use nix::sys::signal::killpg;

        let Some(pgid) = self.pid.and_then(process_group) else {
            tracing::warn!(session_id = %self.id, pid = ?self.pid, "No usable pid, cannot signal shell");
            return false;
        };

        // The shell is a session leader, so its pid is also its process group.
        match killpg(pgid, nix::sys::signal::Signal::from(signal)) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session_id = %self.id, ?signal, error = %e, "Failed to signal process group");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: GroupSignal) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Hangup,
    Kill,
}

#[cfg(unix)]
impl From<GroupSignal> for nix::sys::signal::Signal {
    fn from(signal: GroupSignal) -> Self {
        match signal {
            GroupSignal::Hangup => nix::sys::signal::Signal::SIGHUP,
            GroupSignal::Kill => nix::sys::signal::Signal::SIGKILL,
        }
    }
}

/// Converts a child pid into a process group id.
///
/// Rejects 0 and values outside `i32`: `killpg(0, ..)` would signal the
/// bridge's own group.
#[cfg(unix)]
fn process_group(pid: u32) -> Option<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(nix::unistd::Pid::from_raw(raw)),
        _ => None,
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() != SessionState::Terminated {
            let mut killer = self.killer.get_mut().take();
            if killer.is_some() {
                tracing::warn!(session_id = %self.id, "Session dropped while running, killing shell");
                self.force_kill(killer.as_mut());
            }
            self.closed.cancel();
        }
    }
}

/// Output of a session, consumed by exactly one connection.
///
/// Yields chunks in production order and ends once the shell has exited and
/// its remaining output has been drained, or once the session is terminated.
pub struct OutputStream {
    session_id: SessionId,
    rx: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
}

impl OutputStream {
    /// Returns the ID of the session producing this output.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Waits for the next chunk of output.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        if !self.closed.is_cancelled() {
            tokio::select! {
                biased;
                chunk = self.rx.recv() => return chunk,
                _ = self.closed.cancelled() => {}
            }
        }
        // Hand out what is already buffered, then end.
        self.rx.close();
        self.rx.recv().await
    }
}

/// Returns the default shell for the current platform.
pub fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Resolves and checks the working directory.
///
/// portable-pty silently falls back to the home directory when the requested
/// one is missing, so this has to be checked up front.
fn resolve_cwd(cwd: Option<&Path>) -> Result<PathBuf, SessionError> {
    let dir = match cwd {
        Some(dir) => dir.to_path_buf(),
        None => dirs::home_dir()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/")),
    };

    if !dir.is_dir() {
        return Err(SessionError::SpawnFailed(format!(
            "working directory does not exist: {}",
            dir.display()
        )));
    }

    Ok(dir)
}

#[allow(clippy::too_many_arguments)]
fn start_workers(
    id: &SessionId,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output_tx: mpsc::Sender<Vec<u8>>,
    input_rx: mpsc::Receiver<Vec<u8>>,
    exit_tx: watch::Sender<Option<SessionStatus>>,
    closed: &CancellationToken,
) -> Result<(), SessionError> {
    let short = &id[..8];
    let spawn_err = |e: std::io::Error| SessionError::SpawnFailed(format!("worker thread: {}", e));

    let session_id = id.clone();
    let closed = closed.clone();
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", short))
        .spawn(move || wait_loop(session_id, child, exit_tx, closed))
        .map_err(spawn_err)?;

    let session_id = id.clone();
    std::thread::Builder::new()
        .name(format!("pty-read-{}", short))
        .spawn(move || read_loop(session_id, reader, output_tx))
        .map_err(spawn_err)?;

    let session_id = id.clone();
    std::thread::Builder::new()
        .name(format!("pty-write-{}", short))
        .spawn(move || write_loop(session_id, writer, input_rx))
        .map_err(spawn_err)?;

    Ok(())
}

/// Copies PTY output into the output channel until EOF or the consumer leaves.
fn read_loop(session_id: SessionId, mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %session_id, "PTY EOF");
                break;
            }
            Ok(n) => {
                if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    tracing::trace!(session_id = %session_id, "Output consumer gone");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the slave side is fully closed.
                tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Writes queued input into the PTY until the queue is closed.
fn write_loop(
    session_id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            tracing::debug!(session_id = %session_id, error = %e, "PTY write failed");
            break;
        }
    }
}

/// Reaps the child, publishes its status and then ends the output stream.
fn wait_loop(
    session_id: SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    exit_tx: watch::Sender<Option<SessionStatus>>,
    closed: CancellationToken,
) {
    let status = match child.wait() {
        Ok(status) => SessionStatus::Exited(status.exit_code() as i32),
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to wait for shell");
            SessionStatus::Terminated
        }
    };

    tracing::info!(session_id = %session_id, status = ?status, "Shell exited");
    exit_tx.send_replace(Some(status));

    // Background jobs may keep the slave open after the shell is gone, in
    // which case the reader never sees EOF.
    std::thread::sleep(EXIT_LINGER);
    closed.cancel();
}
