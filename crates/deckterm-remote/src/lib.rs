//! deckterm-remote: the WebSocket side of DeckTerm.
//!
//! Remote clients (a Stream Deck plugin, a phone page, a script) connect to
//! [`RemoteGateway`], receive every keystroke typed locally, and may send
//! [`RemoteCommand`]s that are typed into the shell on their behalf.

pub mod command;
pub mod gateway;

pub use command::{CommandError, RemoteCommand};
pub use gateway::{GatewayConfig, GatewayError, RemoteGateway, DEFAULT_PORT};
