//! RelayTransport - the seam between the protocol core and relay connectivity

use async_trait::async_trait;
use nostr::Event;
use tokio::sync::{broadcast, mpsc};

use super::EventFilter;

/// Relay connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Disconnected => "disconnected",
            RelayState::Connecting => "connecting",
            RelayState::Connected => "connected",
        }
    }
}

/// Per-relay connectivity change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatusEvent {
    Connected(String),
    Disconnected(String),
}

/// What a subscription delivers
#[derive(Debug, Clone)]
pub enum RelayNotification {
    Event(Box<Event>),
    EndOfStoredEvents { relay: String },
    Closed { relay: String, message: Option<String> },
}

/// Open listener. Dropping the receiver does not close it on the relays;
/// call [`RelayTransport::unsubscribe`] with `id`.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub notifications: mpsc::Receiver<RelayNotification>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Connect every configured relay that is not connected yet.
    async fn connect(&self) -> anyhow::Result<()>;

    async fn add_relay(&self, url: &str) -> anyhow::Result<()>;

    /// Publish a signed event. Returns how many relays took it.
    async fn publish(&self, event: &Event) -> anyhow::Result<usize>;

    /// Open a non-closing subscription (stored events, EOSE, then live events).
    async fn subscribe(&self, filter: EventFilter) -> anyhow::Result<Subscription>;

    /// Stop a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: &str);

    async fn relay_states(&self) -> Vec<(String, RelayState)>;

    fn status_events(&self) -> broadcast::Receiver<RelayStatusEvent>;
}
