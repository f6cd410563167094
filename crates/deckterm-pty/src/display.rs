//! The local UI's side of the session.
//!
//! The bridge turns keystrokes and viewport changes into session calls and
//! feeds hub events to a [`RenderSurface`]. Escape sequences are left for the
//! surface to interpret.

use std::sync::Arc;

use crate::hub::{FanoutHub, HubEvent, SubscriberKind, Subscription};
use crate::session::{SessionController, SessionError};

/// Something that can show shell output.
pub trait RenderSurface {
    fn render(&mut self, chunk: &[u8]);

    /// Forget everything rendered so far.
    fn clear(&mut self);

    fn process_failed(&mut self, _code: u32) {}

    fn session_ended(&mut self) {}

    fn start_failed(&mut self, _executable: &str) {}
}

/// What happened to the surface after presenting one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Continue,
    /// The shell went away on its own; no more output will come.
    Ended,
}

pub struct DisplayBridge {
    session: Arc<SessionController>,
    keystrokes: FanoutHub,
}

impl DisplayBridge {
    /// `keystrokes` receives a copy of every byte the local user types.
    pub fn new(session: Arc<SessionController>, keystrokes: FanoutHub) -> Self {
        Self {
            session,
            keystrokes,
        }
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    /// Forward typed bytes to the shell and to keystroke observers.
    pub async fn keystroke(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.session.write(data).await;
        self.keystrokes.publish(data.to_vec()).await;
    }

    pub async fn viewport_changed(&self, cols: u16, rows: u16) {
        self.session.resize(cols, rows).await;
    }

    /// Swap the shell, e.g. after a menu selection.
    pub async fn reload(&self, executable: &str) -> Result<(), SessionError> {
        self.session.reload(executable).await
    }

    /// Register the display as an output subscriber.
    pub fn attach(&self) -> Subscription {
        self.session.output().subscribe(SubscriberKind::Display)
    }

    pub fn detach(&self, subscription: &Subscription) {
        self.session.output().unsubscribe(subscription.id());
    }

    pub fn present<S: RenderSurface + ?Sized>(&self, event: HubEvent, surface: &mut S) -> Presented {
        match event {
            HubEvent::Chunk(bytes) => surface.render(&bytes),
            HubEvent::Reset => surface.clear(),
            HubEvent::ProcessFailed { code } => surface.process_failed(code),
            HubEvent::StartFailed { executable } => surface.start_failed(&executable),
            HubEvent::SessionEnded => {
                surface.session_ended();
                return Presented::Ended;
            }
        }
        Presented::Continue
    }

    /// Render everything the subscription delivers.
    ///
    /// Returns `Presented::Ended` when the shell exits, `Presented::Continue`
    /// when the subscription itself closed.
    pub async fn pump<S: RenderSurface + ?Sized>(
        &self,
        subscription: &mut Subscription,
        surface: &mut S,
    ) -> Presented {
        while let Some(event) = subscription.recv().await {
            if self.present(event, surface) == Presented::Ended {
                return Presented::Ended;
            }
        }
        Presented::Continue
    }
}
