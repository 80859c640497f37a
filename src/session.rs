//! NwcSession - composition root for the wallet-connect bridge
//!
//! Owns the shared relay transport, the pairing registry, the outbox, the
//! discovery engine and at most one request dispatcher. Attaching a new
//! wallet always stops the previous wallet's dispatcher before the new one
//! subscribes, so two dispatchers never handle the same request stream.

use nostr::PublicKey;
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{NwcConfig, Settings};
use crate::discovery::{DiscoveredFederation, DiscoveryEngine};
use crate::identity::{KeyError, ServiceIdentity};
use crate::nostr::{Outbox, RelayState, RelayTransport};
use crate::nwc::codec::EventCodec;
use crate::nwc::message::advertised_capabilities;
use crate::nwc::{DispatcherState, RequestDispatcher};
use crate::registry::{ClientPairing, ConnectionRegistry, NwcConnection, RegistryError};
use crate::sdk::{FederationPreviewer, WalletSdk};
use crate::store::{KvStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No wallet attached")]
    NoWallet,
    #[error("Session not ready")]
    NotReady,
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Wallet error: {0}")]
    Wallet(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
}

struct ActiveWallet {
    identity: ServiceIdentity,
    wallet: Arc<dyn WalletSdk>,
    dispatcher: Option<RequestDispatcher>,
}

pub struct NwcSession {
    config: NwcConfig,
    transport: Arc<dyn RelayTransport>,
    settings: Settings,
    registry: Arc<ConnectionRegistry>,
    outbox: Arc<Outbox>,
    discovery: DiscoveryEngine,
    lifecycle: RwLock<Lifecycle>,
    init_lock: Mutex<()>,
    active: Mutex<Option<ActiveWallet>>,
}

impl NwcSession {
    pub fn new(
        config: NwcConfig,
        transport: Arc<dyn RelayTransport>,
        store: Arc<dyn KvStore>,
        previewer: Arc<dyn FederationPreviewer>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::load(store.clone(), config.default_relay.clone()));
        let outbox = Arc::new(Outbox::new(transport.clone()));
        let discovery = DiscoveryEngine::new(transport.clone(), previewer, config.timeouts.discovery);
        Self {
            settings: Settings::new(store),
            transport,
            registry,
            outbox,
            discovery,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            init_lock: Mutex::new(()),
            active: Mutex::new(None),
            config,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.read().map(|l| *l).unwrap_or(Lifecycle::Uninitialized)
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        if let Ok(mut lifecycle) = self.lifecycle.write() {
            *lifecycle = next;
        }
    }

    pub fn config(&self) -> &NwcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Connect relays and wait briefly for the first one.
    ///
    /// Runs once; concurrent callers wait for the first to finish. Proceeds
    /// without a connected relay after the connection window.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let _guard = self.init_lock.lock().await;
        if self.lifecycle() == Lifecycle::Ready {
            return Ok(());
        }
        self.set_lifecycle(Lifecycle::Initializing);
        info!("Initializing wallet-connect session");

        if let Err(e) = self.transport.connect().await {
            warn!("Relay connection failed: {}", e);
        }

        let window = self.config.timeouts.connection_wait;
        let poll = self.config.timeouts.connection_poll;
        let connected = tokio::time::timeout(window, async {
            while !self.is_connected().await {
                tokio::time::sleep(poll).await;
            }
        })
        .await
        .is_ok();
        if !connected {
            warn!("No relay connected after {:?}, continuing anyway", window);
        }

        self.set_lifecycle(Lifecycle::Ready);
        Ok(())
    }

    /// Switch to `wallet`. The previous dispatcher is stopped first.
    pub async fn attach_wallet(&self, wallet: Arc<dyn WalletSdk>) -> Result<PublicKey, SessionError> {
        self.initialize().await?;
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!(pubkey = %previous.identity.pubkey_hex, "Wallet changed, stopping previous dispatcher");
            if let Some(dispatcher) = previous.dispatcher {
                dispatcher.stop().await;
            }
        }

        let words = wallet.mnemonic().await.map_err(|e| SessionError::Wallet(e.to_string()))?;
        if words.is_empty() {
            return Err(KeyError::InvalidSeed("wallet returned no mnemonic".into()).into());
        }
        let identity = ServiceIdentity::from_mnemonic(&words)?;
        let pubkey = identity.public_key();
        info!(pubkey = %identity.pubkey_hex, "Wallet attached");

        let mut entry = ActiveWallet { identity, wallet, dispatcher: None };
        if self.settings.nwc_enabled()? {
            self.start_dispatcher(&mut entry).await?;
        }
        *active = Some(entry);
        Ok(pubkey)
    }

    /// Stop handling requests for the current wallet and forget it.
    pub async fn detach_wallet(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            if let Some(dispatcher) = previous.dispatcher {
                dispatcher.stop().await;
            }
            info!(pubkey = %previous.identity.pubkey_hex, "Wallet detached");
        }
    }

    pub async fn service_pubkey(&self) -> Option<PublicKey> {
        self.active.lock().await.as_ref().map(|a| a.identity.public_key())
    }

    pub async fn dispatcher_state(&self) -> Option<DispatcherState> {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(|a| a.dispatcher.as_ref().map(|d| d.state()))
    }

    /// Pair a new app, announce the wallet and turn request handling on.
    pub async fn generate_connection(&self, app_name: &str, relay: Option<&str>) -> Result<NwcConnection, SessionError> {
        self.initialize().await?;
        let mut active = self.active.lock().await;
        let entry = active.as_mut().ok_or(SessionError::NoWallet)?;

        let connection = self.registry.generate_connection(app_name, relay, &entry.identity.public_key())?;
        self.announce(&entry.identity, Some(&self.config.alias)).await;

        self.settings.set_nwc_enabled(true)?;
        if entry.dispatcher.is_none() {
            self.start_dispatcher(entry).await?;
        }
        Ok(connection)
    }

    /// Paired apps, for rebuilding the connection list after a reload
    pub fn connections(&self) -> Vec<(String, ClientPairing)> {
        self.registry.list()
    }

    pub fn nwc_enabled(&self) -> Result<bool, SessionError> {
        Ok(self.settings.nwc_enabled()?)
    }

    pub async fn enable_nwc(&self) -> Result<(), SessionError> {
        self.settings.set_nwc_enabled(true)?;
        let retried = self.outbox.retry().await;
        if retried > 0 {
            info!("Republished {} cached events", retried);
        }
        let mut active = self.active.lock().await;
        if let Some(entry) = active.as_mut() {
            if entry.dispatcher.is_none() {
                self.start_dispatcher(entry).await?;
            }
        }
        Ok(())
    }

    pub async fn disable_nwc(&self) -> Result<(), SessionError> {
        self.settings.set_nwc_enabled(false)?;
        if let Some(entry) = self.active.lock().await.as_mut() {
            if let Some(dispatcher) = entry.dispatcher.take() {
                dispatcher.stop().await;
            }
        }
        Ok(())
    }

    /// Relays to connect to: the persisted list, or the configured defaults.
    pub fn configured_relays(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.settings.relays(&self.config.relays)?)
    }

    /// Persist `url` and add it to the live transport.
    pub async fn update_relay(&self, url: &str) -> Result<(), SessionError> {
        let url = url.trim();
        if !(url.starts_with("wss://") || url.starts_with("ws://")) {
            return Err(RegistryError::InvalidRelay(url.to_string()).into());
        }
        if self.settings.add_relay(url, &self.config.relays)? {
            info!(relay = url, "Relay added");
        }
        if let Err(e) = self.transport.add_relay(url).await {
            warn!(relay = url, "Relay not added to live pool: {}", e);
        }
        Ok(())
    }

    pub async fn relay_status(&self) -> Vec<(String, RelayState)> {
        self.transport.relay_states().await
    }

    pub async fn is_connected(&self) -> bool {
        self.transport
            .relay_states()
            .await
            .iter()
            .any(|(_, state)| *state == RelayState::Connected)
    }

    pub async fn discover(&self) -> Result<(), SessionError> {
        self.initialize().await?;
        self.discovery
            .start()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    pub async fn stop_discovery(&self) {
        self.discovery.stop().await;
    }

    pub fn discovered(&self) -> watch::Receiver<Vec<DiscoveredFederation>> {
        self.discovery.subscribe()
    }

    pub fn discovered_federations(&self) -> Vec<DiscoveredFederation> {
        self.discovery.results()
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_discovering()
    }

    /// Stop every subscription this session holds.
    pub async fn shutdown(&self) {
        self.stop_discovery().await;
        self.detach_wallet().await;
        info!("Wallet-connect session shut down");
    }

    async fn start_dispatcher(&self, entry: &mut ActiveWallet) -> Result<(), SessionError> {
        self.announce(&entry.identity, None).await;
        let dispatcher = RequestDispatcher::new(
            &entry.identity,
            entry.wallet.clone(),
            self.registry.clone(),
            self.outbox.clone(),
            &self.config,
        );
        dispatcher
            .start()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        entry.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Publish the capability advertisement. Failures are cached by the outbox.
    async fn announce(&self, identity: &ServiceIdentity, wallet_name: Option<&str>) {
        let codec = EventCodec::new(identity.keys.clone());
        match codec.info_event(&advertised_capabilities(), wallet_name) {
            Ok(event) => {
                let published = self.outbox.publish(event).await;
                debug!(published, "Info event announced");
            }
            Err(e) => warn!("Failed to build info event: {}", e),
        }
    }
}
