//! Nostr - Relay transport for wallet-connect and discovery
//!
//! - NIP-01 framing over tokio-tungstenite WebSockets (`RelayPool`)
//! - In-process relay for tests and embedding (`MemoryRelay`)
//! - Publish retry cache for events no relay accepted (`Outbox`)
//!
//! Both the request dispatcher and the discovery engine hold independent
//! subscriptions over the same transport.

#[cfg(feature = "native")]
pub mod client;
mod memory;
mod outbox;
mod transport;

#[cfg(feature = "native")]
pub use client::{parse_relay_message, RelayClient, RelayMessage, RelayPool};
pub use memory::MemoryRelay;
pub use outbox::Outbox;
pub use transport::{
    RelayNotification, RelayState, RelayStatusEvent, RelayTransport, Subscription,
};

use nostr::Event;
use serde::{Deserialize, Serialize};

/// Reserved event kinds. Part of the wire contract with NWC clients.
pub mod kinds {
    /// Wallet service capability advertisement (replaceable)
    pub const INFO: u16 = 13194;
    /// Encrypted client request
    pub const REQUEST: u16 = 23194;
    /// Encrypted wallet response
    pub const RESPONSE: u16 = 23195;
    /// Encrypted wallet notification
    pub const NOTIFICATION: u16 = 23196;
    /// Federation advertisement (parameterized replaceable)
    pub const FEDERATION_ANNOUNCEMENT: u16 = 38173;
}

/// Default relay list
pub fn default_relays() -> Vec<String> {
    [
        "wss://nostr.mutinywallet.com/",
        "wss://relay.damus.io/",
        "wss://relay.getalby.com/v1/",
        "wss://nos.lol/",
        "wss://relay.nostr.band/",
        "wss://relay.snort.social/",
        "wss://relay.primal.net/",
        "wss://bitcoiner.social/",
        "wss://nostr.bitcoiner.social/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Event filter for subscriptions (NIP-01)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn kind(kind: u16) -> Self {
        Self { kinds: Some(vec![kind]), ..Default::default() }
    }

    pub fn with_p_tag(mut self, pubkey_hex: impl Into<String>) -> Self {
        self.p_tags.get_or_insert_with(Vec::new).push(pubkey_hex.into());
        self
    }

    /// Client-side match. `limit` only applies to stored events and is ignored.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id.to_hex()) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey.to_hex()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind.as_u16()) {
                return false;
            }
        }
        if let Some(p_tags) = &self.p_tags {
            let tagged = tag_values(event, "p").any(|v| p_tags.iter().any(|p| p == v));
            if !tagged {
                return false;
            }
        }
        let created_at = event.created_at.as_u64();
        if self.since.is_some_and(|since| created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| created_at > until) {
            return false;
        }
        true
    }
}

/// Values (second element) of every tag named `name`.
pub fn tag_values<'a>(event: &'a Event, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    event.tags.iter().filter_map(move |tag| {
        let parts = tag.as_slice();
        match (parts.first(), parts.get(1)) {
            (Some(key), Some(value)) if key == name => Some(value.as_str()),
            _ => None,
        }
    })
}

/// First value of tag `name`, if any.
pub fn first_tag_value<'a>(event: &'a Event, name: &'a str) -> Option<&'a str> {
    tag_values(event, name).next()
}
