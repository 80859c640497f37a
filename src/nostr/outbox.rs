//! Outbox - keeps events no relay accepted and republishes them on demand
//!
//! Cached events expire after [`MAX_AGE`] and at most [`MAX_PENDING`] are
//! kept (oldest dropped first), so a long outage never replays stale replies.

use nostr::Event;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::RelayTransport;

/// How long an unpublished event stays eligible for retry
pub const MAX_AGE: Duration = Duration::from_secs(600);
/// Cached events kept at most
pub const MAX_PENDING: usize = 256;

pub struct Outbox {
    transport: Arc<dyn RelayTransport>,
    pending: Mutex<VecDeque<(Event, Instant)>>,
}

impl Outbox {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self { transport, pending: Mutex::new(VecDeque::new()) }
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Publish, caching the event when it reached no relay. Never fails.
    pub async fn publish(&self, event: Event) -> bool {
        match self.transport.publish(&event).await {
            Ok(n) if n > 0 => {
                tracing::debug!(event_id = %event.id, relays = n, "Published");
                true
            }
            Ok(_) => {
                tracing::warn!(event_id = %event.id, "No relay accepted event, caching for retry");
                self.cache(event, Instant::now()).await;
                false
            }
            Err(e) => {
                tracing::warn!(event_id = %event.id, "Publish failed, caching for retry: {}", e);
                self.cache(event, Instant::now()).await;
                false
            }
        }
    }

    async fn cache(&self, event: Event, cached_at: Instant) {
        let mut pending = self.pending.lock().await;
        purge_expired(&mut pending);
        while pending.len() >= MAX_PENDING {
            if let Some((dropped, _)) = pending.pop_front() {
                tracing::warn!(event_id = %dropped.id, "Outbox full, dropping oldest event");
            }
        }
        pending.push_back((event, cached_at));
    }

    /// Republish cached events that have not expired. Returns how many went out.
    pub async fn retry(&self) -> usize {
        let cached = {
            let mut pending = self.pending.lock().await;
            purge_expired(&mut pending);
            std::mem::take(&mut *pending)
        };
        if cached.is_empty() {
            return 0;
        }
        tracing::info!("Retrying {} unpublished events", cached.len());

        let mut sent = 0;
        let mut still_pending = Vec::new();
        for (event, cached_at) in cached {
            match self.transport.publish(&event).await {
                Ok(n) if n > 0 => sent += 1,
                _ => still_pending.push((event, cached_at)),
            }
        }
        for (event, cached_at) in still_pending {
            self.cache(event, cached_at).await;
        }
        sent
    }

    pub async fn pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        purge_expired(&mut pending);
        pending.len()
    }
}

fn purge_expired(pending: &mut VecDeque<(Event, Instant)>) {
    let before = pending.len();
    pending.retain(|(_, cached_at)| cached_at.elapsed() < MAX_AGE);
    if pending.len() < before {
        tracing::debug!(dropped = before - pending.len(), "Expired unpublished events");
    }
}
