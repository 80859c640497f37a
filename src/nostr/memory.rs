//! MemoryRelay - a single in-process relay implementing RelayTransport
//!
//! Stores every published event, replays matching ones to new subscriptions
//! followed by EOSE, then streams live events.

use async_trait::async_trait;
use nostr::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::transport::{RelayNotification, RelayState, RelayStatusEvent, RelayTransport, Subscription};
use super::EventFilter;

const SUBSCRIPTION_BUFFER: usize = 256;

pub struct MemoryRelay {
    url: String,
    events: Mutex<Vec<Event>>,
    subscriptions: Mutex<HashMap<String, (EventFilter, mpsc::Sender<RelayNotification>)>>,
    next_sub: AtomicU64,
    connected: AtomicBool,
    offline: AtomicBool,
    status_tx: broadcast::Sender<RelayStatusEvent>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new("memory://relay")
    }
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self {
            url: url.into(),
            events: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_sub: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            status_tx,
        }
    }

    /// While offline, publishes fail and nothing is stored.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every event accepted so far, in publish order.
    pub fn published(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Accepted events of one kind.
    pub fn published_of_kind(&self, kind: u16) -> Vec<Event> {
        self.published().into_iter().filter(|e| e.kind.as_u16() == kind).collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn matching_senders(&self, event: &Event) -> Vec<mpsc::Sender<RelayNotification>> {
        match self.subscriptions.lock() {
            Ok(subs) => subs
                .values()
                .filter(|(filter, _)| filter.matches(event))
                .map(|(_, tx)| tx.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn connect(&self) -> anyhow::Result<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.status_tx.send(RelayStatusEvent::Connected(self.url.clone()));
        }
        Ok(())
    }

    async fn add_relay(&self, url: &str) -> anyhow::Result<()> {
        anyhow::bail!("memory relay cannot add {}", url)
    }

    async fn publish(&self, event: &Event) -> anyhow::Result<usize> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("{} is offline", self.url);
        }
        let senders = {
            let mut events = self.events.lock().map_err(|_| anyhow::anyhow!("relay lock"))?;
            events.push(event.clone());
            self.matching_senders(event)
        };
        for tx in senders {
            let _ = tx.send(RelayNotification::Event(Box::new(event.clone()))).await;
        }
        Ok(1)
    }

    async fn subscribe(&self, filter: EventFilter) -> anyhow::Result<Subscription> {
        let id = format!("mem-{}", self.next_sub.fetch_add(1, Ordering::Relaxed));

        // Backlog and registration happen under the events lock so a concurrent
        // publish lands after EOSE, never before the stored events.
        let events = self.events.lock().map_err(|_| anyhow::anyhow!("relay lock"))?;
        let mut backlog: Vec<&Event> = events.iter().filter(|e| filter.matches(e)).collect();
        if let Some(limit) = filter.limit {
            if backlog.len() > limit {
                backlog.drain(..backlog.len() - limit);
            }
        }

        let (tx, notifications) = mpsc::channel(backlog.len() + SUBSCRIPTION_BUFFER);
        for event in backlog {
            tx.try_send(RelayNotification::Event(Box::new(event.clone())))
                .map_err(|_| anyhow::anyhow!("subscription buffer full"))?;
        }
        tx.try_send(RelayNotification::EndOfStoredEvents { relay: self.url.clone() })
            .map_err(|_| anyhow::anyhow!("subscription buffer full"))?;

        self.subscriptions
            .lock()
            .map_err(|_| anyhow::anyhow!("relay lock"))?
            .insert(id.clone(), (filter, tx));
        drop(events);
        Ok(Subscription { id, notifications })
    }

    async fn unsubscribe(&self, id: &str) {
        let removed = self.subscriptions.lock().ok().and_then(|mut s| s.remove(id));
        if let Some((_, tx)) = removed {
            let _ = tx
                .send(RelayNotification::Closed { relay: self.url.clone(), message: None })
                .await;
        }
    }

    async fn relay_states(&self) -> Vec<(String, RelayState)> {
        let state = if self.connected.load(Ordering::SeqCst) {
            RelayState::Connected
        } else {
            RelayState::Disconnected
        };
        vec![(self.url.clone(), state)]
    }

    fn status_events(&self) -> broadcast::Receiver<RelayStatusEvent> {
        self.status_tx.subscribe()
    }
}
