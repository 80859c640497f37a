//! Configuration - bridge defaults, timeouts and persisted user settings

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::nostr::default_relays;
use crate::nwc::invoices::DEFAULT_INVOICE_EXPIRY;
use crate::store::{keys, KvStore, StoreError};

/// Relay embedded in new pairings when the app asks for none
pub const DEFAULT_PAIRING_RELAY: &str = "wss://relay.getalby.com/v1";

/// Listening windows for SDK streams and relay readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// First balance value for `get_balance`
    pub balance: Duration,
    /// Settlement watch after `make_invoice`
    pub invoice_monitor: Duration,
    /// Terminal state for `pay_invoice`
    pub payment: Duration,
    /// Claim for `lookup_invoice`
    pub lookup: Duration,
    /// Federation discovery session length
    pub discovery: Duration,
    /// Wait for a first relay connection during initialization
    pub connection_wait: Duration,
    pub connection_poll: Duration,
    /// Delay between reconnect attempts for dropped relays
    pub reconnect_interval: Duration,
    /// Invoice correlation lifetime when the request sets no expiry
    pub invoice_ttl: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            balance: Duration::from_secs(10),
            invoice_monitor: Duration::from_secs(30),
            payment: Duration::from_secs(300),
            lookup: Duration::from_secs(300),
            discovery: Duration::from_secs(30),
            connection_wait: Duration::from_secs(5),
            connection_poll: Duration::from_millis(500),
            reconnect_interval: Duration::from_secs(30),
            invoice_ttl: Duration::from_secs(DEFAULT_INVOICE_EXPIRY),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NwcConfig {
    pub relays: Vec<String>,
    pub default_relay: String,
    /// Wallet name in `get_info` and the info event `d` tag
    pub alias: String,
    pub color: String,
    pub network: String,
    pub data_dir: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl Default for NwcConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            default_relay: DEFAULT_PAIRING_RELAY.into(),
            alias: "Haze Wallet".into(),
            color: "#1570cbff".into(),
            network: "regtest".into(),
            data_dir: None,
            timeouts: Timeouts::default(),
        }
    }
}

impl NwcConfig {
    /// Defaults overridden by `HAZE_RELAYS` (comma separated), `HAZE_DEFAULT_RELAY`,
    /// `HAZE_ALIAS`, `HAZE_NETWORK` and `HAZE_DATA_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(relays) = std::env::var("HAZE_RELAYS") {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
            if !relays.is_empty() {
                config.relays = relays;
            }
        }
        if let Ok(relay) = std::env::var("HAZE_DEFAULT_RELAY") {
            config.default_relay = relay;
        }
        if let Ok(alias) = std::env::var("HAZE_ALIAS") {
            config.alias = alias;
        }
        if let Ok(network) = std::env::var("HAZE_NETWORK") {
            config.network = network;
        }
        if let Ok(dir) = std::env::var("HAZE_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        config
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self { self.relays = relays; self }
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self { self.alias = alias.into(); self }
    pub fn with_default_relay(mut self, relay: impl Into<String>) -> Self { self.default_relay = relay.into(); self }
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self { self.timeouts = timeouts; self }
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self { self.data_dir = Some(dir.into()); self }
}

/// User toggles persisted across restarts
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn KvStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Request handling is on only when explicitly enabled.
    pub fn nwc_enabled(&self) -> Result<bool, StoreError> {
        Ok(self.store.get_json::<bool>(keys::NWC_ENABLED)?.unwrap_or(false))
    }

    pub fn set_nwc_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.store.set_json(keys::NWC_ENABLED, &enabled)
    }

    /// Persisted relay list, or `defaults` when none was saved.
    pub fn relays(&self, defaults: &[String]) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .get_json::<Vec<String>>(keys::NWC_RELAYS)?
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| defaults.to_vec()))
    }

    /// Append `url` to the persisted list. Returns false if already present.
    pub fn add_relay(&self, url: &str, defaults: &[String]) -> Result<bool, StoreError> {
        let mut relays = self.relays(defaults)?;
        if relays.iter().any(|r| r == url) {
            return Ok(false);
        }
        relays.push(url.to_string());
        self.store.set_json(keys::NWC_RELAYS, &relays)?;
        Ok(true)
    }
}
