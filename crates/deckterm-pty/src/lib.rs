//! deckterm-pty: the shell session core of DeckTerm.
//!
//! Hosts one interactive shell in a PTY and shares its byte stream with a
//! local display and any number of remote observers.
//!
//! # Architecture
//!
//! - [`ProcessHandle`]: One spawned shell with write, resize and terminate, plus a
//!   lazy [`ProcessOutput`] sequence read on a dedicated thread.
//! - [`SessionController`]: Owns the single live `ProcessHandle` and swaps it
//!   in place on reload without mixing output from two shells.
//! - [`FanoutHub`]: Republishes a stream to every subscriber through bounded
//!   per-subscriber queues, dropping the ones that stall.
//! - [`DisplayBridge`]: The local UI's input path and its [`RenderSurface`]
//!   output path.

pub mod display;
pub mod hub;
pub mod pty;
pub mod session;

pub use display::{DisplayBridge, Presented, RenderSurface};
pub use hub::{FanoutHub, HubEvent, SubscriberKind, Subscription, SubscriptionId, DEFAULT_QUEUE_DEPTH};
pub use pty::{Liveness, OutputEvent, ProcessHandle, ProcessOutput, PtyError, SpawnOptions};
pub use session::{SessionConfig, SessionController, SessionError, SessionPhase};
