//! The host terminal as DeckTerm's local display.

use std::io::{self, Read, Write};

use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::terminal::{self, Clear, ClearType};
use deckterm_pty::RenderSurface;
use log::debug;
use tokio::sync::mpsc;

const INPUT_QUEUE_DEPTH: usize = 64;

/// Keeps the host terminal in raw mode while alive.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Current host terminal size as `(cols, rows)`, if it can be determined.
pub fn host_size() -> Option<(u16, u16)> {
    terminal::size().ok().filter(|&(cols, rows)| cols > 0 && rows > 0)
}

/// Writes shell output straight through; the host terminal interprets it.
pub struct TerminalSurface<W: Write> {
    out: W,
}

impl<W: Write> TerminalSurface<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Print a DeckTerm message on its own line.
    pub fn notice(&mut self, message: &str) {
        let text = format!("\r\n[deckterm] {message}\r\n");
        self.write_all(text.as_bytes());
    }

    fn write_all(&mut self, bytes: &[u8]) {
        if let Err(e) = self.out.write_all(bytes).and_then(|()| self.out.flush()) {
            debug!("terminal write failed: {e}");
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RenderSurface for TerminalSurface<W> {
    fn render(&mut self, chunk: &[u8]) {
        self.write_all(chunk);
    }

    fn clear(&mut self) {
        let result = queue!(self.out, Clear(ClearType::All), MoveTo(0, 0))
            .and_then(|()| self.out.flush());
        if let Err(e) = result {
            debug!("terminal clear failed: {e}");
        }
    }

    fn process_failed(&mut self, code: u32) {
        self.notice(&format!("shell exited with status {code}"));
    }

    fn session_ended(&mut self) {
        self.notice("session ended");
    }

    fn start_failed(&mut self, executable: &str) {
        self.notice(&format!("could not start {executable}; pick another shell with Ctrl-] l"));
    }
}

/// Read `input` on a dedicated OS thread.
///
/// Reads block, and a blocked tokio stdin task would hold up runtime
/// shutdown. The channel closes at EOF.
pub fn spawn_input_reader<R>(mut input: R) -> io::Result<mpsc::Receiver<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                let n = match input.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("stdin read failed: {e}");
                        break;
                    }
                };
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        })?;

    Ok(rx)
}

/// Host terminal size changes.
pub struct ResizeEvents {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl ResizeEvents {
    #[cfg(unix)]
    pub fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            signal: signal(SignalKind::window_change())?,
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next change and return the new size.
    pub async fn changed(&mut self) -> Option<(u16, u16)> {
        #[cfg(unix)]
        {
            loop {
                self.signal.recv().await?;
                if let Some(size) = host_size() {
                    return Some(size);
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending().await
        }
    }
}
