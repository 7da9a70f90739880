//! Engine process adapter
//!
//! Spawns a UCI engine as a subprocess and exposes its stdout as a stream of
//! events. Commands are written verbatim, one per line.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;

/// Error type for engine operations
#[derive(Debug)]
pub enum EngineError {
    /// Failed to start the engine process
    SpawnError(String),
    /// Failed to communicate with engine
    IoError(std::io::Error),
    /// The engine's output stream has ended
    Closed,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SpawnError(s) => write!(f, "Failed to start engine: {}", s),
            EngineError::IoError(e) => write!(f, "I/O error: {}", e),
            EngineError::Closed => write!(f, "Engine output closed"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::IoError(error)
    }
}

/// Something the engine did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// One trimmed line of output
    Line(String),
    /// Stdout reached EOF or failed; no more lines will follow
    Exited,
}

/// Creates engine processes for a supervisor
pub trait EngineLauncher: Send + Sync {
    fn launch(&self, config: &EngineConfig) -> Result<EngineProcess, EngineError>;
}

/// Launches the binary named in the config
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl EngineLauncher for ProcessLauncher {
    fn launch(&self, config: &EngineConfig) -> Result<EngineProcess, EngineError> {
        EngineProcess::spawn(config)
    }
}

/// A running engine and the duplex stream to it
pub struct EngineProcess {
    /// The child process, absent when wrapping an in-memory stream
    child: Option<Child>,
    /// Stdin for sending commands
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Lines read off stdout by the reader task
    events: mpsc::Receiver<EngineEvent>,
    reader: JoinHandle<()>,
    quit_grace: Duration,
}

impl EngineProcess {
    /// Spawns the configured engine binary.
    ///
    /// # Example
    /// ```ignore
    /// let engine = EngineProcess::spawn(&EngineConfig::default())?;
    /// ```
    pub fn spawn(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut child = Command::new(&config.path)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::SpawnError(format!("{}: {}", config.path.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::SpawnError("Failed to open stdin".into()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::SpawnError("Failed to open stdout".into()))?;

        debug!(path = %config.path.display(), pid = ?child.id(), "engine process spawned");

        let mut engine = Self::from_io(stdout, stdin, config.channel_capacity);
        engine.child = Some(child);
        engine.quit_grace = config.quit_grace();
        Ok(engine)
    }

    /// Wraps an already-connected duplex stream.
    ///
    /// Must be called inside a tokio runtime; the reader task starts
    /// immediately.
    pub fn from_io<R, W>(reader: R, writer: W, capacity: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, events) = mpsc::channel(capacity.max(1));
        let reader = tokio::spawn(read_lines(reader, tx));
        Self {
            child: None,
            stdin: Box::new(writer),
            events,
            reader,
            quit_grace: Duration::from_millis(100),
        }
    }

    /// Sends a command to the engine
    pub async fn send(&mut self, cmd: &str) -> Result<(), EngineError> {
        trace!(command = cmd, "-> engine");
        self.stdin.write_all(cmd.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Waits for the next line or the end of output
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Quit the engine cleanly, killing it if it lingers
    pub async fn quit(mut self) {
        if let Err(e) = self.send("quit").await {
            debug!(error = %e, "engine did not accept quit");
        }
        if let Some(child) = self.child.as_mut() {
            if tokio::time::timeout(self.quit_grace, child.wait()).await.is_err() {
                warn!("engine ignored quit; killing it");
                let _ = child.kill().await;
            }
        }
        self.reader.abort();
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

async fn read_lines<R>(reader: R, tx: mpsc::Sender<EngineEvent>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                trace!(line = %line, "<- engine");
                if tx.send(EngineEvent::Line(line)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed reading engine output");
                break;
            }
        }
    }
    let _ = tx.send(EngineEvent::Exited).await;
}
