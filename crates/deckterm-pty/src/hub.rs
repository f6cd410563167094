use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Unique identifier for a hub subscription.
pub type SubscriptionId = u64;

/// Events a subscriber may hold before it is considered stalled.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

const INBOX_DEPTH: usize = 256;

/// Who is on the other end of a subscription. Used for diagnostics only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberKind {
    Display,
    Remote { peer: String },
}

impl std::fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberKind::Display => write!(f, "display"),
            SubscriberKind::Remote { peer } => write!(f, "remote client {peer}"),
        }
    }
}

/// What the hub delivers to its subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubEvent {
    /// One chunk of the stream, shared between all subscribers.
    Chunk(Arc<[u8]>),
    /// The producer was replaced; anything rendered so far is stale.
    Reset,
    /// The shell died with a non-success status.
    ProcessFailed { code: u32 },
    /// The current producer ended on its own.
    SessionEnded,
    /// A replacement shell could not be started; nothing is producing now.
    StartFailed { executable: String },
}

/// The receiving end of one hub subscription.
///
/// `recv` returns `None` once the subscriber was dropped for falling behind
/// or the hub shut down.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<HubEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    kind: SubscriberKind,
    tx: mpsc::Sender<HubEvent>,
}

struct HubShared {
    name: &'static str,
    queue_depth: usize,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl HubShared {
    /// Hand one event to every subscriber without ever waiting on one.
    fn deliver(&self, event: &HubEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(s) => s,
            Err(_) => return, // Poisoned lock.
        };

        subscribers.retain(|id, sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} hub: dropping subscriber {id} ({}) after {} undelivered events",
                    self.name, sub.kind, self.queue_depth
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("{} hub: subscriber {id} ({}) went away", self.name, sub.kind);
                false
            }
        });
    }
}

/// Republishes one stream to any number of subscribers.
///
/// A single dispatch task drains the inbox in order, so every subscriber sees
/// events in publish order. Each subscriber owns a bounded queue; one that
/// fills up is unsubscribed instead of stalling the others or the producer.
#[derive(Clone)]
pub struct FanoutHub {
    shared: Arc<HubShared>,
    inbox: mpsc::Sender<HubEvent>,
}

impl FanoutHub {
    /// Create a hub and start its dispatch task on the current tokio runtime.
    pub fn new(name: &'static str, queue_depth: usize) -> Self {
        let shared = Arc::new(HubShared {
            name,
            queue_depth: queue_depth.max(1),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        });
        let (inbox, mut rx) = mpsc::channel::<HubEvent>(INBOX_DEPTH);

        let dispatch = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch.deliver(&event);
            }
            debug!("{} hub: dispatch task finished", dispatch.name);
        });

        Self { shared, inbox }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn subscribe(&self, kind: SubscriberKind) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.queue_depth);

        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            debug!("{} hub: subscriber {id} ({kind}) joined", self.shared.name);
            subscribers.insert(id, Subscriber { kind, tx });
        }

        Subscription { id, rx }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            if let Some(sub) = subscribers.remove(&id) {
                debug!("{} hub: subscriber {id} ({}) left", self.shared.name, sub.kind);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// How many subscribers were dropped for falling behind.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Publish a chunk of the stream.
    pub async fn publish(&self, chunk: impl Into<Arc<[u8]>>) {
        self.publish_event(HubEvent::Chunk(chunk.into())).await;
    }

    /// Tell every subscriber the stream restarted.
    pub async fn reset(&self) {
        self.publish_event(HubEvent::Reset).await;
    }

    pub async fn publish_event(&self, event: HubEvent) {
        // Only fails once the dispatch task is gone, i.e. at runtime shutdown.
        let _ = self.inbox.send(event).await;
    }
}
