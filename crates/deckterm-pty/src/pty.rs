use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Depth of the queue between the reader thread and the output consumer.
pub const OUTPUT_QUEUE_DEPTH: usize = 64;

/// Writes that may wait for the shell to read its input before new ones are dropped.
pub const INPUT_QUEUE_DEPTH: usize = 256;

/// How long `terminate` waits for the shell to leave on its own.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8192;
const EXIT_POLL: Duration = Duration::from_millis(25);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from PTY operations.
#[derive(Debug)]
pub enum PtyError {
    SpawnFailed(String),
    IoError(std::io::Error),
    ResizeFailed(String),
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::SpawnFailed(msg) => write!(f, "PTY spawn failed: {msg}"),
            PtyError::IoError(err) => write!(f, "PTY I/O error: {err}"),
            PtyError::ResizeFailed(msg) => write!(f, "PTY resize failed: {msg}"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::IoError(err)
    }
}

/// Lifecycle of the child process behind a [`ProcessHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Starting,
    Running,
    Terminated,
}

impl Liveness {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Liveness::Starting,
            1 => Liveness::Running,
            _ => Liveness::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Liveness::Starting => 0,
            Liveness::Running => 1,
            Liveness::Terminated => 2,
        }
    }
}

#[derive(Clone)]
struct SharedLiveness(Arc<AtomicU8>);

impl SharedLiveness {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Liveness::Starting.as_u8())))
    }

    fn get(&self) -> Liveness {
        Liveness::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: Liveness) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Everything needed to start one interactive shell.
#[derive(Clone, Debug)]
pub struct SpawnOptions {
    pub executable: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    /// Working directory. `None` uses the user's home directory.
    pub cwd: Option<PathBuf>,
    /// Overrides applied on top of the inherited environment.
    pub env: HashMap<String, String>,
}

impl SpawnOptions {
    pub fn new(executable: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            cols,
            rows,
            cwd: None,
            env: HashMap::new(),
        }
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.executable);
        cmd.args(&self.args);

        if let Some(dir) = self.cwd.clone().or_else(home_dir) {
            cmd.cwd(dir);
        }

        if !self.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// One item of a shell's output sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Data(Vec<u8>),
    /// The process exited with a non-success status. Always the last item.
    Failed { code: u32 },
}

/// The lazy, non-restartable output of one shell process.
///
/// Yields chunks until the PTY reaches EOF, then ends. Dropping it stops the
/// reader thread at its next chunk.
pub struct ProcessOutput {
    rx: mpsc::Receiver<OutputEvent>,
}

impl ProcessOutput {
    pub async fn next(&mut self) -> Option<OutputEvent> {
        self.rx.recv().await
    }
}

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// Owns a portable-pty child process, its master side, and the queue feeding
/// its input thread.
pub struct ProcessHandle {
    executable: String,
    pid: Option<u32>,
    cols: u16,
    rows: u16,
    master: Box<dyn MasterPty + Send>,
    /// `None` once `terminate` closed it.
    input: Option<mpsc::Sender<Vec<u8>>>,
    child: SharedChild,
    killer: Box<dyn ChildKiller + Send + Sync>,
    liveness: SharedLiveness,
}

impl ProcessHandle {
    /// Spawn a shell inside a fresh PTY and start its I/O threads.
    ///
    /// Reading and writing the PTY happen on plain OS threads, so spawning
    /// needs no runtime. Only awaiting [`ProcessOutput::next`] does.
    pub fn spawn(options: &SpawnOptions) -> Result<(Self, ProcessOutput), PtyError> {
        let liveness = SharedLiveness::new();
        let cols = options.cols.max(1);
        let rows = options.rows.max(1);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(options.command())
            .map_err(|e| {
                PtyError::SpawnFailed(format!("failed to spawn {}: {e}", options.executable))
            })?;
        // The slave end must not outlive the spawn, otherwise reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let child = Arc::new(Mutex::new(child));
        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let (input, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);

        let suffix = pid.map(|pid| format!("-{pid}")).unwrap_or_default();
        let reader_child = Arc::clone(&child);
        let reader_liveness = liveness.clone();
        std::thread::Builder::new()
            .name(format!("pty-io{suffix}"))
            .spawn(move || read_loop(reader, tx, reader_child, reader_liveness))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to start reader thread: {e}")))?;
        std::thread::Builder::new()
            .name(format!("pty-in{suffix}"))
            .spawn(move || write_loop(writer, input_rx))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to start writer thread: {e}")))?;

        liveness.set(Liveness::Running);
        info!("spawned {} (pid {:?}) at {cols}x{rows}", options.executable, pid);

        Ok((
            Self {
                executable: options.executable.clone(),
                pid,
                cols,
                rows,
                master: pair.master,
                input: Some(input),
                child,
                killer,
                liveness,
            },
            ProcessOutput { rx },
        ))
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn dimensions(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.get()
    }

    /// Queue raw bytes for the shell's input. Never blocks.
    ///
    /// Each call reaches the PTY as one contiguous block, in call order.
    /// Fire and forget: writing to a process that already exited does nothing,
    /// and a shell that stopped reading loses input once its queue is full.
    pub fn write(&self, data: &[u8]) {
        if self.liveness() == Liveness::Terminated {
            debug!("dropping {} bytes for terminated {}", data.len(), self.executable);
            return;
        }
        let Some(input) = &self.input else {
            return;
        };
        match input.try_send(data.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(
                "{} is not reading its input, dropping {} bytes",
                self.executable,
                data.len()
            ),
            Err(TrySendError::Closed(_)) => {
                debug!("input of {} is closed", self.executable)
            }
        }
    }

    /// Resize the PTY window. Zero dimensions are clamped to 1.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let cols = cols.max(1);
        let rows = rows.max(1);
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))?;
        self.cols = cols;
        self.rows = rows;
        Ok(())
    }

    /// Get the child process exit code if it has exited.
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Option<u32> {
        let status = match self.child.lock() {
            Ok(mut child) => child.try_wait().ok().flatten(),
            Err(_) => None,
        };
        if status.is_some() {
            self.liveness.set(Liveness::Terminated);
        }
        status.map(|s| s.exit_code())
    }

    /// Stop the shell: ask it to exit, then kill it once `grace` has passed.
    ///
    /// Input still queued behind a blocked write is discarded with the
    /// queue. A killed child is reaped before this returns. Always succeeds
    /// from the caller's point of view.
    pub async fn terminate(mut self, grace: Duration) {
        if self.try_wait().is_none() {
            self.write(b"exit\r");
            // The input thread finishes what it holds, then exits.
            self.input = None;

            let deadline = Instant::now() + grace;
            while self.try_wait().is_none() {
                if Instant::now() >= deadline {
                    warn!(
                        "{} (pid {:?}) ignored exit, killing it",
                        self.executable, self.pid
                    );
                    if let Err(e) = self.killer.kill() {
                        debug!("kill failed: {e}");
                    }
                    let child = Arc::clone(&self.child);
                    let reaped = tokio::task::spawn_blocking(move || reap(&child, REAP_TIMEOUT))
                        .await
                        .ok()
                        .flatten();
                    if reaped.is_none() {
                        warn!("{} (pid {:?}) was not reaped", self.executable, self.pid);
                    }
                    break;
                }
                tokio::time::sleep(EXIT_POLL).await;
            }
        }
        self.liveness.set(Liveness::Terminated);
        info!("terminated {} (pid {:?})", self.executable, self.pid);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.liveness() != Liveness::Terminated {
            let _ = self.killer.kill();
            self.liveness.set(Liveness::Terminated);

            // Drop may run on a runtime thread; reap somewhere else.
            let child = Arc::clone(&self.child);
            let _ = std::thread::Builder::new()
                .name("pty-reap".to_string())
                .spawn(move || reap(&child, REAP_TIMEOUT));
        }
    }
}

/// Poll until the child has been waited for, or `timeout` passes.
fn reap(child: &SharedChild, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = match child.lock() {
            Ok(mut child) => child.try_wait().ok().flatten(),
            Err(_) => return None, // Poisoned lock.
        };
        if status.is_some() || Instant::now() >= deadline {
            return status;
        }
        std::thread::sleep(EXIT_POLL);
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<OutputEvent>,
    child: SharedChild,
    liveness: SharedLiveness,
) {
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,  // EOF
            Ok(n) => n,
            Err(_) => break, // EIO once the child side is gone
        };
        if tx.blocking_send(OutputEvent::Data(buf[..n].to_vec())).is_err() {
            // Consumer detached. Whoever owns the handle reaps the child.
            return;
        }
    }

    liveness.set(Liveness::Terminated);

    // The child may not be reaped the instant the PTY closes.
    if let Some(status) = reap(&child, Duration::from_millis(500)) {
        if !status.success() {
            let _ = tx.blocking_send(OutputEvent::Failed {
                code: status.exit_code(),
            });
        }
    }
}

/// Drain queued input into the PTY. A write that blocks because the shell
/// is not reading only holds up this thread.
fn write_loop(mut writer: Box<dyn Write + Send>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            debug!("PTY write failed: {e}");
            return;
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Get the user's home directory.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
