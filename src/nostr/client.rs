//! Nostr relay client - tokio-tungstenite WebSocket
//!
//! `RelayClient` owns one socket. `RelayPool` fans subscriptions out to every
//! relay, routes inbound events back to the owning subscription and drops
//! the copies other relays deliver.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nostr::{Event, EventId};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::transport::{RelayNotification, RelayState, RelayStatusEvent, RelayTransport, Subscription};
use super::EventFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SEEN_CAPACITY: usize = 4096;
const SUBSCRIPTION_BUFFER: usize = 256;

/// Nostr relay client
pub struct RelayClient {
    url: String,
    state: Arc<RwLock<RelayState>>,
    tx: Option<mpsc::Sender<String>>,
}

impl RelayClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Arc::new(RwLock::new(RelayState::Disconnected)),
            tx: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn state(&self) -> RelayState {
        *self.state.read().await
    }

    /// Connect to relay. Returns the stream of raw inbound frames.
    pub async fn connect(&mut self) -> anyhow::Result<mpsc::Receiver<String>> {
        *self.state.write().await = RelayState::Connecting;

        let (ws, _) = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                *self.state.write().await = RelayState::Disconnected;
                return Err(e.into());
            }
            Err(_) => {
                *self.state.write().await = RelayState::Disconnected;
                anyhow::bail!("connect to {} timed out", self.url)
            }
        };
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(32);
        self.tx = Some(out_tx);

        let (in_tx, in_rx) = mpsc::channel::<String>(64);

        let state = self.state.clone();
        *state.write().await = RelayState::Connected;

        let state_w = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            *state_w.write().await = RelayState::Disconnected;
        });

        let state_r = state.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                match msg {
                    Message::Text(txt) => {
                        if in_tx.send(txt).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            *state_r.write().await = RelayState::Disconnected;
        });

        Ok(in_rx)
    }

    /// Send raw message
    pub async fn send(&self, msg: &str) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => {
                tx.send(msg.to_string()).await?;
                Ok(())
            }
            None => anyhow::bail!("Not connected"),
        }
    }

    /// Publish event (NIP-01)
    pub async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        self.send(&json!(["EVENT", event]).to_string()).await
    }

    /// Subscribe (NIP-01)
    pub async fn subscribe(&self, id: &str, filter: &EventFilter) -> anyhow::Result<()> {
        self.send(&json!(["REQ", id, filter]).to_string()).await
    }

    /// Unsubscribe (NIP-01)
    pub async fn unsubscribe(&self, id: &str) -> anyhow::Result<()> {
        self.send(&json!(["CLOSE", id]).to_string()).await
    }
}

/// Parse relay message
pub fn parse_relay_message(msg: &str) -> Option<RelayMessage> {
    let arr: Vec<Value> = serde_json::from_str(msg).ok()?;
    let cmd = arr.first()?.as_str()?;
    match cmd {
        "EVENT" => {
            let sub_id = arr.get(1)?.as_str()?.to_string();
            let event: Event = serde_json::from_value(arr.get(2)?.clone()).ok()?;
            Some(RelayMessage::Event { sub_id, event: Box::new(event) })
        }
        "OK" => {
            let event_id = arr.get(1)?.as_str()?.to_string();
            let accepted = arr.get(2)?.as_bool()?;
            let message = arr.get(3).and_then(|v| v.as_str()).map(String::from);
            Some(RelayMessage::Ok { event_id, accepted, message })
        }
        "EOSE" => {
            let sub_id = arr.get(1)?.as_str()?.to_string();
            Some(RelayMessage::Eose { sub_id })
        }
        "CLOSED" => {
            let sub_id = arr.get(1)?.as_str()?.to_string();
            let message = arr.get(2).and_then(|v| v.as_str()).map(String::from);
            Some(RelayMessage::Closed { sub_id, message })
        }
        "NOTICE" => {
            let message = arr.get(1)?.as_str()?.to_string();
            Some(RelayMessage::Notice { message })
        }
        _ => None,
    }
}

/// Relay message types
#[derive(Debug)]
pub enum RelayMessage {
    Event { sub_id: String, event: Box<Event> },
    Ok { event_id: String, accepted: bool, message: Option<String> },
    Eose { sub_id: String },
    Closed { sub_id: String, message: Option<String> },
    Notice { message: String },
}

/// Bounded set of event ids already delivered to one subscription.
#[derive(Default)]
struct SeenEvents {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl SeenEvents {
    fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

struct PoolSubscription {
    filter: EventFilter,
    sender: mpsc::Sender<RelayNotification>,
    seen: SeenEvents,
}

type Subscriptions = Arc<RwLock<HashMap<String, PoolSubscription>>>;

/// Auto-reconnecting relay pool
pub struct RelayPool {
    relays: Arc<RwLock<Vec<RelayClient>>>,
    subscriptions: Subscriptions,
    status_tx: broadcast::Sender<RelayStatusEvent>,
    next_sub: AtomicU64,
    shutdown: Arc<RwLock<bool>>,
}

impl RelayPool {
    pub fn new(urls: Vec<String>) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            relays: Arc::new(RwLock::new(urls.into_iter().map(RelayClient::new).collect())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            status_tx,
            next_sub: AtomicU64::new(0),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Start background reconnection
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if *pool.shutdown.read().await {
                    break;
                }
                if let Err(e) = pool.connect().await {
                    tracing::debug!("Reconnect pass failed: {}", e);
                }
            }
        });
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        self.subscriptions.write().await.clear();
    }

    /// Open `client`'s socket and replay open subscriptions on it.
    ///
    /// Touches no pool lock while the handshake runs. Returns the replayed ids.
    async fn connect_client(&self, client: &mut RelayClient) -> anyhow::Result<HashSet<String>> {
        tracing::info!("Connecting to {}", client.url());
        let rx = client.connect().await?;

        let subs: Vec<(String, EventFilter)> = self
            .subscriptions
            .read()
            .await
            .iter()
            .map(|(id, sub)| (id.clone(), sub.filter.clone()))
            .collect();
        let mut replayed = HashSet::with_capacity(subs.len());
        for (id, filter) in subs {
            client.subscribe(&id, &filter).await?;
            replayed.insert(id);
        }

        let _ = self.status_tx.send(RelayStatusEvent::Connected(client.url().to_string()));
        tokio::spawn(route_messages(
            client.url().to_string(),
            rx,
            self.subscriptions.clone(),
            self.status_tx.clone(),
        ));
        Ok(replayed)
    }

    /// Swap a freshly connected client into the pool, then send it the
    /// subscriptions opened while it was connecting.
    async fn install(&self, client: RelayClient, replayed: HashSet<String>) {
        let url = client.url().to_string();
        {
            let mut clients = self.relays.write().await;
            match clients.iter_mut().find(|c| c.url() == url) {
                Some(slot) => *slot = client,
                None => clients.push(client),
            }
        }

        let missed: Vec<(String, EventFilter)> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|(id, _)| !replayed.contains(*id))
            .map(|(id, sub)| (id.clone(), sub.filter.clone()))
            .collect();
        if missed.is_empty() {
            return;
        }
        let clients = self.relays.read().await;
        if let Some(client) = clients.iter().find(|c| c.url() == url) {
            for (id, filter) in missed {
                if let Err(e) = client.subscribe(&id, &filter).await {
                    tracing::warn!("REQ to {} failed: {}", url, e);
                }
            }
        }
    }

    /// Connect a new client for `url` outside every pool lock.
    async fn dial(&self, url: String) -> anyhow::Result<()> {
        let mut client = RelayClient::new(url);
        let replayed = self.connect_client(&mut client).await?;
        self.install(client, replayed).await;
        Ok(())
    }

    async fn mark_disconnected(&self, url: &str) {
        let clients = self.relays.read().await;
        if let Some(client) = clients.iter().find(|c| c.url() == url) {
            *client.state.write().await = RelayState::Disconnected;
        }
    }
}

async fn route_messages(
    url: String,
    mut rx: mpsc::Receiver<String>,
    subscriptions: Subscriptions,
    status_tx: broadcast::Sender<RelayStatusEvent>,
) {
    while let Some(txt) = rx.recv().await {
        let Some(msg) = parse_relay_message(&txt) else {
            tracing::debug!(relay = %url, "Unparsed relay frame");
            continue;
        };
        let (sub_id, notification) = match msg {
            RelayMessage::Event { sub_id, event } => {
                if event.verify().is_err() {
                    tracing::warn!(relay = %url, "Dropping event with bad signature");
                    continue;
                }
                (sub_id, RelayNotification::Event(event))
            }
            RelayMessage::Eose { sub_id } => {
                (sub_id, RelayNotification::EndOfStoredEvents { relay: url.clone() })
            }
            RelayMessage::Closed { sub_id, message } => {
                (sub_id, RelayNotification::Closed { relay: url.clone(), message })
            }
            RelayMessage::Ok { event_id, accepted, message } => {
                if !accepted {
                    tracing::warn!(relay = %url, %event_id, ?message, "Relay rejected event");
                }
                continue;
            }
            RelayMessage::Notice { message } => {
                tracing::info!(relay = %url, "NOTICE: {}", message);
                continue;
            }
        };

        let sender = {
            let mut subs = subscriptions.write().await;
            let Some(sub) = subs.get_mut(&sub_id) else { continue };
            if let RelayNotification::Event(event) = &notification {
                if !sub.filter.matches(event) || !sub.seen.insert(event.id) {
                    continue;
                }
            }
            sub.sender.clone()
        };
        let _ = sender.send(notification).await;
    }

    tracing::info!("Relay disconnected: {}", url);
    let _ = status_tx.send(RelayStatusEvent::Disconnected(url));
}

#[async_trait]
impl RelayTransport for RelayPool {
    async fn connect(&self) -> anyhow::Result<()> {
        // Claim disconnected relays under the read lock; dial without it
        let (targets, mut connected, total) = {
            let clients = self.relays.read().await;
            let mut targets = Vec::new();
            let mut connected = 0;
            for client in clients.iter() {
                let mut state = client.state.write().await;
                match *state {
                    RelayState::Connected => connected += 1,
                    RelayState::Connecting => {}
                    RelayState::Disconnected => {
                        *state = RelayState::Connecting;
                        targets.push(client.url().to_string());
                    }
                }
            }
            (targets, connected, clients.len())
        };

        let attempts = targets.into_iter().map(|url| async move {
            let result = self.dial(url.clone()).await;
            (url, result)
        });
        for (url, result) in futures_util::future::join_all(attempts).await {
            match result {
                Ok(()) => connected += 1,
                Err(e) => {
                    tracing::warn!("Relay {} connect failed: {}", url, e);
                    self.mark_disconnected(&url).await;
                }
            }
        }

        if connected == 0 && total > 0 {
            anyhow::bail!("no relay reachable");
        }
        Ok(())
    }

    async fn add_relay(&self, url: &str) -> anyhow::Result<()> {
        {
            let mut clients = self.relays.write().await;
            if clients.iter().any(|c| c.url() == url) {
                return Ok(());
            }
            // Placeholder keeps concurrent callers and the reconnect loop off this url
            let placeholder = RelayClient::new(url);
            *placeholder.state.write().await = RelayState::Connecting;
            clients.push(placeholder);
        }
        let result = self.dial(url.to_string()).await;
        if result.is_err() {
            self.mark_disconnected(url).await;
        }
        result
    }

    async fn publish(&self, event: &Event) -> anyhow::Result<usize> {
        let clients = self.relays.read().await;
        let mut count = 0;
        for client in clients.iter() {
            if client.state().await == RelayState::Connected && client.publish(event).await.is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn subscribe(&self, filter: EventFilter) -> anyhow::Result<Subscription> {
        let id = format!("haze-{}", self.next_sub.fetch_add(1, Ordering::Relaxed));
        let (sender, notifications) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions.write().await.insert(
            id.clone(),
            PoolSubscription { filter: filter.clone(), sender, seen: SeenEvents::default() },
        );

        let clients = self.relays.read().await;
        for client in clients.iter() {
            if client.state().await == RelayState::Connected {
                if let Err(e) = client.subscribe(&id, &filter).await {
                    tracing::warn!("REQ to {} failed: {}", client.url(), e);
                }
            }
        }
        Ok(Subscription { id, notifications })
    }

    async fn unsubscribe(&self, id: &str) {
        if self.subscriptions.write().await.remove(id).is_none() {
            return;
        }
        let clients = self.relays.read().await;
        for client in clients.iter() {
            if client.state().await == RelayState::Connected {
                let _ = client.unsubscribe(id).await;
            }
        }
    }

    async fn relay_states(&self) -> Vec<(String, RelayState)> {
        let clients = self.relays.read().await;
        let mut states = Vec::with_capacity(clients.len());
        for client in clients.iter() {
            states.push((client.url().to_string(), client.state().await));
        }
        states
    }

    fn status_events(&self) -> broadcast::Receiver<RelayStatusEvent> {
        self.status_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_eose() {
        match parse_relay_message(r#"["EOSE","haze-1"]"#) {
            Some(RelayMessage::Eose { sub_id }) => assert_eq!(sub_id, "haze-1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_closed_with_reason() {
        match parse_relay_message(r#"["CLOSED","haze-2","auth-required: login"]"#) {
            Some(RelayMessage::Closed { sub_id, message }) => {
                assert_eq!(sub_id, "haze-2");
                assert_eq!(message.as_deref(), Some("auth-required: login"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_ok_rejected() {
        match parse_relay_message(r#"["OK","abcd",false,"blocked"]"#) {
            Some(RelayMessage::Ok { accepted, message, .. }) => {
                assert!(!accepted);
                assert_eq!(message.as_deref(), Some("blocked"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_relay_message("not json").is_none());
        assert!(parse_relay_message(r#"["UNKNOWN"]"#).is_none());
    }

    #[test]
    fn test_seen_events_dedup_and_bound() {
        let keys = nostr::Keys::generate();
        let mut seen = SeenEvents::default();
        let mut first = None;
        for i in 0..(SEEN_CAPACITY + 1) {
            let ev = nostr::UnsignedEvent::new(
                keys.public_key(),
                nostr::Timestamp::from(i as u64),
                nostr::Kind::from(1u16),
                Vec::<nostr::Tag>::new(),
                "",
            );
            let id = ev.sign_with_keys(&keys).unwrap().id;
            assert!(seen.insert(id));
            assert!(!seen.insert(id));
            first.get_or_insert(id);
        }
        // Oldest id was evicted once capacity was exceeded
        assert!(seen.insert(first.unwrap()));
    }

    #[tokio::test]
    async fn test_pool_without_connections_publishes_nowhere() {
        let pool = RelayPool::new(vec!["wss://relay.invalid".into()]);
        let keys = nostr::Keys::generate();
        let ev = nostr::UnsignedEvent::new(
            keys.public_key(),
            nostr::Timestamp::now(),
            nostr::Kind::from(1u16),
            Vec::<nostr::Tag>::new(),
            "hi",
        )
        .sign_with_keys(&keys)
        .unwrap();
        assert_eq!(pool.publish(&ev).await.unwrap(), 0);
        let states = pool.relay_states().await;
        assert_eq!(states, vec![("wss://relay.invalid".to_string(), RelayState::Disconnected)]);
    }

    /// Accepts TCP connections and never answers the WebSocket handshake.
    async fn stalled_relay() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_stalled_connect_does_not_block_pool() {
        let url = stalled_relay().await;
        let pool = Arc::new(RelayPool::new(vec![url.clone()]));
        let connecting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let keys = nostr::Keys::generate();
        let ev = nostr::UnsignedEvent::new(
            keys.public_key(),
            nostr::Timestamp::now(),
            nostr::Kind::from(1u16),
            Vec::<nostr::Tag>::new(),
            "hi",
        )
        .sign_with_keys(&keys)
        .unwrap();

        let quick = Duration::from_secs(1);
        let published = tokio::time::timeout(quick, pool.publish(&ev)).await.expect("publish not blocked");
        assert_eq!(published.unwrap(), 0);
        let states = tokio::time::timeout(quick, pool.relay_states()).await.expect("states not blocked");
        assert_eq!(states, vec![(url, RelayState::Connecting)]);
        let sub = tokio::time::timeout(quick, pool.subscribe(EventFilter::kind(1))).await.expect("subscribe not blocked");
        assert!(sub.is_ok());

        connecting.abort();
    }

    #[tokio::test]
    async fn test_add_relay_does_not_block_pool() {
        let url = stalled_relay().await;
        let pool = Arc::new(RelayPool::new(Vec::new()));
        let adding = {
            let pool = pool.clone();
            let url = url.clone();
            tokio::spawn(async move { pool.add_relay(&url).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let states = tokio::time::timeout(Duration::from_secs(1), pool.relay_states()).await.expect("states not blocked");
        assert_eq!(states, vec![(url.clone(), RelayState::Connecting)]);
        // A second add of the same url is a no-op while the first is dialing
        let again = tokio::time::timeout(Duration::from_secs(1), pool.add_relay(&url)).await.expect("add not blocked");
        assert!(again.is_ok());
        assert_eq!(pool.relay_states().await.len(), 1);

        adding.abort();
    }
}
