use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::hub::{FanoutHub, HubEvent};
use crate::pty::{
    Liveness, OutputEvent, ProcessHandle, ProcessOutput, PtyError, SpawnOptions,
    DEFAULT_TERMINATE_GRACE,
};

/// Errors surfaced by session lifecycle operations.
#[derive(Debug)]
pub enum SessionError {
    /// The shell could not be started. The session is now terminated.
    Spawn(PtyError),
    /// `initialize` was called on a session that already runs a shell.
    AlreadyRunning,
    /// The session was shut down and accepts no new shells.
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn(err) => write!(f, "failed to start shell: {err}"),
            SessionError::AlreadyRunning => write!(f, "session is already running"),
            SessionError::Closed => write!(f, "session has been shut down"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Running,
    Terminated,
}

/// How every shell of the session is started.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub cols: u16,
    pub rows: u16,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub terminate_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cols: 120,
            rows: 40,
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

struct ActiveProcess {
    handle: ProcessHandle,
    forwarder: JoinHandle<()>,
}

impl ActiveProcess {
    /// Stop forwarding output, then stop the process.
    ///
    /// The forwarder is joined, not just aborted, so nothing it read can reach
    /// the hub afterwards.
    async fn retire(self, grace: Duration) {
        self.forwarder.abort();
        let _ = self.forwarder.await;
        self.handle.terminate(grace).await;
    }
}

struct SessionState {
    phase: SessionPhase,
    active: Option<ActiveProcess>,
    executable: Option<String>,
    cols: u16,
    rows: u16,
    generation: u64,
    closed: bool,
}

/// Owns the one live shell of the application and swaps it on demand.
///
/// Every operation takes the session lock, so `write` is the single point
/// where input from different sources is serialized, and `reload` holds the
/// lock from detach to re-attach: no caller ever sees a half-swapped shell.
pub struct SessionController {
    state: Mutex<SessionState>,
    output: FanoutHub,
    config: SessionConfig,
}

impl SessionController {
    pub fn new(config: SessionConfig, output: FanoutHub) -> Self {
        let cols = config.cols.max(1);
        let rows = config.rows.max(1);
        Self {
            state: Mutex::new(SessionState {
                phase: SessionPhase::Uninitialized,
                active: None,
                executable: None,
                cols,
                rows,
                generation: 0,
                closed: false,
            }),
            output,
            config,
        }
    }

    /// The hub that carries this session's output.
    pub fn output(&self) -> &FanoutHub {
        &self.output
    }

    /// Start the first shell.
    pub async fn initialize(&self, executable: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::Closed);
        }
        if state.phase == SessionPhase::Running {
            return Err(SessionError::AlreadyRunning);
        }
        self.start(&mut state, executable).await
    }

    /// Replace the running shell with `executable`.
    ///
    /// Concurrent reloads queue on the session lock and run one after another.
    /// If the new shell fails to start the session ends up terminated and the
    /// error is returned; nothing is retried.
    pub async fn reload(&self, executable: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::Closed);
        }

        info!(
            "reloading shell: {} -> {executable}",
            state.executable.as_deref().unwrap_or("<none>")
        );
        if let Some(active) = state.active.take() {
            active.retire(self.config.terminate_grace).await;
        }
        self.start(&mut state, executable).await
    }

    async fn start(&self, state: &mut SessionState, executable: &str) -> Result<(), SessionError> {
        let options = SpawnOptions {
            executable: executable.to_string(),
            args: self.config.args.clone(),
            cols: state.cols,
            rows: state.rows,
            cwd: self.config.cwd.clone(),
            env: self.config.env.clone(),
        };

        let (handle, output) = match ProcessHandle::spawn(&options) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("could not start {executable}: {e}");
                // Whatever an earlier shell left on screen is stale now.
                if state.generation > 0 {
                    self.output.reset().await;
                }
                self.output
                    .publish_event(HubEvent::StartFailed {
                        executable: executable.to_string(),
                    })
                    .await;
                state.phase = SessionPhase::Terminated;
                state.executable = None;
                return Err(SessionError::Spawn(e));
            }
        };

        state.generation += 1;
        // Subscribers must see the reset before the first chunk of the new shell.
        if state.generation > 1 {
            self.output.reset().await;
        }
        let forwarder = spawn_forwarder(state.generation, output, self.output.clone());

        state.active = Some(ActiveProcess { handle, forwarder });
        state.executable = Some(executable.to_string());
        state.phase = SessionPhase::Running;
        Ok(())
    }

    /// Send input to the running shell. A no-op when no shell is running.
    pub async fn write(&self, data: &[u8]) {
        let mut state = self.state.lock().await;
        if state.phase != SessionPhase::Running {
            return;
        }
        if let Some(active) = state.active.as_mut() {
            active.handle.write(data);
        }
    }

    /// Resize the running shell and remember the size for the next one.
    ///
    /// Zero dimensions are clamped to 1.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let mut state = self.state.lock().await;
        state.cols = cols.max(1);
        state.rows = rows.max(1);
        let (cols, rows) = (state.cols, state.rows);

        if state.phase != SessionPhase::Running {
            return;
        }
        if let Some(active) = state.active.as_mut() {
            if let Err(e) = active.handle.resize(cols, rows) {
                warn!("resize to {cols}x{rows} failed: {e}");
            }
        }
    }

    /// Stop the shell for good.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.phase = SessionPhase::Terminated;
        if let Some(active) = state.active.take() {
            active.retire(self.config.terminate_grace).await;
        }
        info!("session shut down");
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Whether a shell is running and has not exited on its own.
    pub async fn is_alive(&self) -> bool {
        let state = self.state.lock().await;
        state.phase == SessionPhase::Running
            && state
                .active
                .as_ref()
                .is_some_and(|a| a.handle.liveness() == Liveness::Running)
    }

    /// Last known (cols, rows).
    pub async fn dimensions(&self) -> (u16, u16) {
        let state = self.state.lock().await;
        (state.cols, state.rows)
    }

    /// Path of the running shell, if any.
    pub async fn executable(&self) -> Option<String> {
        self.state.lock().await.executable.clone()
    }

    /// How many shells this session has started.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }
}

/// Move one shell's output into the hub until the shell goes away.
fn spawn_forwarder(generation: u64, mut output: ProcessOutput, hub: FanoutHub) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = output.next().await {
            match event {
                OutputEvent::Data(bytes) => hub.publish(bytes).await,
                OutputEvent::Failed { code } => {
                    warn!("shell #{generation} exited with status {code}");
                    hub.publish_event(HubEvent::ProcessFailed { code }).await;
                }
            }
        }
        info!("shell #{generation} output ended");
        hub.publish_event(HubEvent::SessionEnded).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{SubscriberKind, Subscription, DEFAULT_QUEUE_DEPTH};
    use std::sync::Arc;
    use std::time::Instant;

    fn controller() -> SessionController {
        SessionController::new(
            SessionConfig {
                terminate_grace: Duration::from_millis(200),
                ..SessionConfig::default()
            },
            FanoutHub::new("output", 1024),
        )
    }

    /// Collect hub events until `stop` returns true or five seconds pass.
    async fn collect(sub: &mut Subscription, mut stop: impl FnMut(&[HubEvent]) -> bool) -> Vec<HubEvent> {
        let mut events = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = sub.recv().await {
                events.push(event);
                if stop(&events) {
                    break;
                }
            }
        })
        .await;
        events
    }

    fn text_of(events: &[HubEvent]) -> String {
        let mut bytes = Vec::new();
        for event in events {
            if let HubEvent::Chunk(chunk) = event {
                bytes.extend_from_slice(chunk);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_initialize_and_write() {
        let session = controller();
        assert_eq!(session.phase().await, SessionPhase::Uninitialized);

        let mut sub = session.output().subscribe(SubscriberKind::Display);
        session.initialize("/bin/sh").await.unwrap();
        assert_eq!(session.phase().await, SessionPhase::Running);
        assert_eq!(session.executable().await.as_deref(), Some("/bin/sh"));
        assert!(session.is_alive().await);

        session.write(b"echo SESSION_$((6*7))\n").await;
        let events = collect(&mut sub, |e| text_of(e).contains("SESSION_42")).await;
        assert!(text_of(&events).contains("SESSION_42"));
    }

    #[tokio::test]
    async fn test_initialize_twice_rejected() {
        let session = controller();
        session.initialize("/bin/sh").await.unwrap();
        assert!(matches!(
            session.initialize("/bin/sh").await,
            Err(SessionError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_write_before_initialize_is_noop() {
        let session = controller();
        session.write(b"echo nothing\n").await;
        session.resize(100, 30).await;
        assert_eq!(session.phase().await, SessionPhase::Uninitialized);
        assert_eq!(session.dimensions().await, (100, 30));
    }

    #[tokio::test]
    async fn test_resize_clamps_zero() {
        let session = controller();
        session.initialize("/bin/sh").await.unwrap();
        session.resize(0, 0).await;
        assert_eq!(session.dimensions().await, (1, 1));
        session.resize(132, 50).await;
        assert_eq!(session.dimensions().await, (132, 50));
        assert!(session.is_alive().await);
    }

    #[tokio::test]
    async fn test_reload_failure_terminates() {
        let session = controller();
        let mut sub = session.output().subscribe(SubscriberKind::Display);
        session.initialize("/bin/sh").await.unwrap();

        let result = session.reload("/nonexistent/deckterm-shell").await;
        assert!(matches!(result, Err(SessionError::Spawn(_))));
        assert_eq!(session.phase().await, SessionPhase::Terminated);
        assert_eq!(session.executable().await, None);

        let events = collect(&mut sub, |e| {
            matches!(e.last(), Some(HubEvent::StartFailed { .. }))
        })
        .await;
        let tail: Vec<HubEvent> = events
            .into_iter()
            .filter(|e| !matches!(e, HubEvent::Chunk(_)))
            .collect();
        assert_eq!(
            tail,
            vec![
                HubEvent::Reset,
                HubEvent::StartFailed {
                    executable: "/nonexistent/deckterm-shell".to_string()
                },
            ]
        );

        // Writes against a terminated session are swallowed.
        session.write(b"echo still here\n").await;
        session.resize(80, 24).await;

        // A later reload may bring it back.
        session.reload("/bin/sh").await.unwrap();
        assert_eq!(session.phase().await, SessionPhase::Running);
    }

    #[tokio::test]
    async fn test_no_old_output_after_reset() {
        let session = controller();
        let mut sub = session.output().subscribe(SubscriberKind::Display);
        session.initialize("/bin/sh").await.unwrap();

        session
            .write(b"while true; do echo OLD_$((1+1)); sleep 0.01; done\n")
            .await;
        let before = collect(&mut sub, |e| text_of(e).contains("OLD_2")).await;
        assert!(text_of(&before).contains("OLD_2"));

        session.reload("/bin/sh").await.unwrap();
        session.write(b"echo NEW_$((2+2))\n").await;

        // Skip whatever the old shell produced before the reset.
        let _ = collect(&mut sub, |e| e.last() == Some(&HubEvent::Reset)).await;
        let after = collect(&mut sub, |e| text_of(e).contains("NEW_4")).await;
        let text = text_of(&after);
        assert!(text.contains("NEW_4"), "got: {text}");
        assert!(!text.contains("OLD_2"), "old shell leaked after reset: {text}");
        assert!(!after.contains(&HubEvent::Reset));
    }

    #[tokio::test]
    async fn test_shell_exit_ends_session_stream() {
        let session = controller();
        let mut sub = session.output().subscribe(SubscriberKind::Display);
        session.initialize("/bin/sh").await.unwrap();

        session.write(b"exit 5\n").await;
        let events = collect(&mut sub, |e| e.last() == Some(&HubEvent::SessionEnded)).await;
        let tail: Vec<HubEvent> = events
            .into_iter()
            .filter(|e| !matches!(e, HubEvent::Chunk(_)))
            .collect();
        assert_eq!(
            tail,
            vec![HubEvent::ProcessFailed { code: 5 }, HubEvent::SessionEnded]
        );
        assert!(!session.is_alive().await);

        // Fire and forget against the dead shell.
        session.write(b"echo gone\n").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reloads_serialize() {
        let session = Arc::new(controller());
        let mut sub = session.output().subscribe(SubscriberKind::Display);
        session.initialize("/bin/sh").await.unwrap();

        let a = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.reload("/bin/sh").await }
        });
        let b = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.reload("/bin/sh").await }
        });
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());

        assert_eq!(session.generation().await, 3);
        assert_eq!(session.phase().await, SessionPhase::Running);

        let events = collect(&mut sub, |e| {
            e.iter().filter(|ev| **ev == HubEvent::Reset).count() == 2
        })
        .await;
        assert_eq!(events.iter().filter(|e| **e == HubEvent::Reset).count(), 2);
        // Retired shells never report an end of their own.
        assert!(!events.contains(&HubEvent::SessionEnded));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_stay_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("input.log");
        let session = Arc::new(SessionController::new(
            SessionConfig {
                args: vec![
                    "-c".to_string(),
                    format!("exec cat > '{}'", capture.display()),
                ],
                terminate_grace: Duration::from_millis(200),
                ..SessionConfig::default()
            },
            FanoutHub::new("output", DEFAULT_QUEUE_DEPTH),
        ));
        session.initialize("/bin/sh").await.unwrap();

        let line_a = format!("{}\n", "A".repeat(1000));
        let line_b = format!("{}\n", "B".repeat(1000));
        let mut writers = Vec::new();
        for line in [line_a, line_b] {
            let session = Arc::clone(&session);
            writers.push(tokio::spawn(async move {
                for _ in 0..5 {
                    session.write(line.as_bytes()).await;
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut contents = String::new();
        while Instant::now() < deadline {
            contents = std::fs::read_to_string(&capture).unwrap_or_default();
            if contents.lines().count() >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let lines: Vec<&str> = contents.lines().take(10).collect();
        assert_eq!(lines.len(), 10, "got: {contents:?}");
        for line in lines {
            assert_eq!(line.len(), 1000);
            assert!(
                line.chars().all(|c| c == 'A') || line.chars().all(|c| c == 'B'),
                "interleaved line: {line}"
            );
        }
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let session = controller();
        session.initialize("/bin/sh").await.unwrap();
        session.shutdown().await;

        assert_eq!(session.phase().await, SessionPhase::Terminated);
        assert!(!session.is_alive().await);
        assert!(matches!(session.reload("/bin/sh").await, Err(SessionError::Closed)));
        assert!(matches!(session.initialize("/bin/sh").await, Err(SessionError::Closed)));
        session.write(b"echo after shutdown\n").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stalled_shell_does_not_wedge_session() {
        let session = Arc::new(SessionController::new(
            SessionConfig {
                args: vec!["-c".to_string(), "exec sleep 60".to_string()],
                terminate_grace: Duration::from_millis(200),
                ..SessionConfig::default()
            },
            FanoutHub::new("output", DEFAULT_QUEUE_DEPTH),
        ));
        session.initialize("/bin/sh").await.unwrap();

        // `sleep` never reads, so the PTY input buffer fills up quickly.
        let writer = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let line = format!("{}\n", "x".repeat(1023));
                for _ in 0..1000 {
                    session.write(line.as_bytes()).await;
                }
            }
        });

        let finished = tokio::time::timeout(Duration::from_secs(5), writer).await;
        assert!(matches!(finished, Ok(Ok(()))), "writes blocked on the stalled shell");

        let reloaded = tokio::time::timeout(Duration::from_secs(5), session.reload("/bin/sh")).await;
        assert!(matches!(reloaded, Ok(Ok(()))), "reload blocked behind queued input");

        session.resize(90, 30).await;
        assert_eq!(session.dimensions().await, (90, 30));
        let closed = tokio::time::timeout(Duration::from_secs(5), session.shutdown()).await;
        assert!(closed.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writes_racing_reload_reach_one_shell() {
        let session = Arc::new(controller());
        let mut sub = session.output().subscribe(SubscriberKind::Display);
        session.initialize("/bin/sh").await.unwrap();

        let reload = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.reload("/bin/sh").await }
        });
        let racer = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                for i in 0..20u16 {
                    session.write(b"echo RACE_$((3+4))\n").await;
                    session.resize(80 + i, 24).await;
                    tokio::task::yield_now().await;
                }
            }
        });

        let reloaded = tokio::time::timeout(Duration::from_secs(5), reload).await;
        assert!(matches!(reloaded, Ok(Ok(Ok(())))));
        let raced = tokio::time::timeout(Duration::from_secs(5), racer).await;
        assert!(matches!(raced, Ok(Ok(()))));

        assert_eq!(session.generation().await, 2);
        assert_eq!(session.phase().await, SessionPhase::Running);
        assert_eq!(session.dimensions().await, (99, 24));

        // The new shell is live and only its output follows the reset.
        session.write(b"echo AFTER_$((4+4))\n").await;
        let _ = collect(&mut sub, |e| e.last() == Some(&HubEvent::Reset)).await;
        let after = collect(&mut sub, |e| text_of(e).contains("AFTER_8")).await;
        assert!(text_of(&after).contains("AFTER_8"), "got: {}", text_of(&after));
        assert!(!after.contains(&HubEvent::SessionEnded));
    }
}
