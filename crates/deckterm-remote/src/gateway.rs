//! WebSocket listener for remote clients.
//!
//! Every connection gets a reader task and a sender task. A client receives
//! the bytes the local user types (and, with `mirror_output`, the shell's
//! output) and may send [`RemoteCommand`]s. Nothing a client does can close another client's
//! connection or stop the session.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use deckterm_pty::{FanoutHub, HubEvent, SessionController, SubscriberKind, Subscription};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::command::RemoteCommand;

/// The port DeckTerm has always listened on.
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Also stream shell output to every client.
    pub mirror_output: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            mirror_output: false,
        }
    }
}

#[derive(Debug)]
pub enum GatewayError {
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Bind { addr, source } => {
                write!(f, "could not listen on {addr}: {source}")
            }
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Bind { source, .. } => Some(source),
        }
    }
}

/// Everything a connection task needs, shared between all of them.
#[derive(Clone)]
struct ClientContext {
    session: Arc<SessionController>,
    keystrokes: FanoutHub,
    mirror: Option<FanoutHub>,
}

pub struct RemoteGateway {
    listener: TcpListener,
    context: ClientContext,
}

impl RemoteGateway {
    /// Bind the listener. Connections are accepted once [`serve`](Self::serve) runs.
    pub async fn bind(
        config: GatewayConfig,
        session: Arc<SessionController>,
        keystrokes: FanoutHub,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: config.bind,
                source,
            })?;

        let mirror = config.mirror_output.then(|| session.output().clone());
        Ok(Self {
            listener,
            context: ClientContext {
                session,
                keystrokes,
                mirror,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("remote gateway listening on ws://{addr}"),
            Err(_) => info!("remote gateway listening"),
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            let context = self.context.clone();
            tokio::spawn(async move {
                handle_connection(stream, peer, context).await;
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: ClientContext) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };
    info!("remote client {peer} connected");

    let kind = SubscriberKind::Remote {
        peer: peer.to_string(),
    };
    let keys = context.keystrokes.subscribe(kind.clone());
    let mirror = context.mirror.as_ref().map(|hub| hub.subscribe(kind));
    let key_id = keys.id();
    let mirror_id = mirror.as_ref().map(Subscription::id);

    let (sink, mut source) = ws.split();
    // Sending runs on its own task so a client that stops reading can still
    // send commands.
    let broadcaster = tokio::spawn(broadcast(sink, peer, Some(keys), mirror));

    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => dispatch(&context.session, peer, &text).await,
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch(&context.session, peer, text).await,
                Err(_) => warn!("ignoring non-UTF-8 message from {peer}"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("connection to {peer} lost: {e}");
                break;
            }
        }
    }

    broadcaster.abort();
    context.keystrokes.unsubscribe(key_id);
    if let (Some(hub), Some(id)) = (context.mirror.as_ref(), mirror_id) {
        hub.unsubscribe(id);
    }
    info!("remote client {peer} disconnected");
}

/// Push keystrokes (and mirrored output) to one client until its socket
/// stops accepting frames.
async fn broadcast<S>(
    mut sink: S,
    peer: SocketAddr,
    mut keys: Option<Subscription>,
    mut mirror: Option<Subscription>,
) where
    S: futures_util::Sink<Message> + Unpin,
{
    loop {
        let open = tokio::select! {
            event = next_event(&mut keys) => forward(&mut sink, peer, "keystroke", event, &mut keys).await,
            event = next_event(&mut mirror) => forward(&mut sink, peer, "output", event, &mut mirror).await,
        };
        if !open {
            break;
        }
    }
}

/// Wait on a subscription that may already be gone.
async fn next_event(subscription: &mut Option<Subscription>) -> Option<HubEvent> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Send one broadcast event to the client.
///
/// Returns `false` when the socket is no longer writable.
async fn forward<S>(
    sink: &mut S,
    peer: SocketAddr,
    stream: &str,
    event: Option<HubEvent>,
    subscription: &mut Option<Subscription>,
) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
{
    match event {
        Some(HubEvent::Chunk(bytes)) => {
            if sink.send(frame(&bytes)).await.is_err() {
                debug!("send to {peer} failed");
                return false;
            }
        }
        Some(_) => {}
        None => {
            warn!("remote client {peer} stopped receiving {stream} broadcasts");
            *subscription = None;
        }
    }
    true
}

/// Raw bytes go out as text when they are valid UTF-8, binary otherwise.
fn frame(bytes: &[u8]) -> Message {
    match std::str::from_utf8(bytes) {
        Ok(text) => Message::Text(text.to_string()),
        Err(_) => Message::Binary(bytes.to_vec()),
    }
}

async fn dispatch(session: &SessionController, peer: SocketAddr, message: &str) {
    match RemoteCommand::decode(message) {
        Ok(command) => {
            info!("remote client {peer}: {command:?}");
            session.write(command.to_input().as_bytes()).await;
        }
        Err(e) => warn!("ignoring message from {peer}: {e}"),
    }
}
