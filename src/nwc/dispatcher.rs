//! RequestDispatcher - the inbound request loop of one wallet session
//!
//! Holds one subscription for request events addressed to the service key.
//! Each event is checked in order (own event, paired sender, decryptable
//! envelope, not expired) and then handled on its own task, so a slow
//! payment never blocks a balance query.

use nostr::{Event, PublicKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec::{self, CodecError, EventCodec};
use super::handlers::{Capabilities, Outcome};
use super::message::{ErrorCode, Method, Request, Response};
use crate::config::NwcConfig;
use crate::identity::ServiceIdentity;
use crate::nostr::{kinds, EventFilter, Outbox, RelayNotification};
use crate::registry::ConnectionRegistry;
use crate::sdk::WalletSdk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Listening,
    Stopped,
}

/// Where an accepted request currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Processing,
    Responding,
}

struct Listener {
    subscription_id: String,
    task: JoinHandle<()>,
}

struct Inner {
    codec: EventCodec,
    service_pubkey: PublicKey,
    registry: Arc<ConnectionRegistry>,
    capabilities: Arc<Capabilities>,
    outbox: Arc<Outbox>,
    in_flight: Mutex<HashMap<String, RequestPhase>>,
}

pub struct RequestDispatcher {
    inner: Arc<Inner>,
    state: watch::Sender<DispatcherState>,
    listener: tokio::sync::Mutex<Option<Listener>>,
}

impl RequestDispatcher {
    pub fn new(
        identity: &ServiceIdentity,
        wallet: Arc<dyn WalletSdk>,
        registry: Arc<ConnectionRegistry>,
        outbox: Arc<Outbox>,
        config: &NwcConfig,
    ) -> Self {
        let codec = EventCodec::new(identity.keys.clone());
        let capabilities = Arc::new(Capabilities::new(wallet, codec.clone(), outbox.clone(), config));
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            inner: Arc::new(Inner {
                codec,
                service_pubkey: identity.public_key(),
                registry,
                capabilities,
                outbox,
                in_flight: Mutex::new(HashMap::new()),
            }),
            state,
            listener: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    pub fn service_pubkey(&self) -> PublicKey {
        self.inner.service_pubkey
    }

    /// Requests accepted but not yet answered
    pub fn in_flight(&self) -> HashMap<String, RequestPhase> {
        self.inner.in_flight.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Subscribe and start the listen loop. A second call is a no-op.
    ///
    /// Only requests created from now on are handled; stored requests from
    /// earlier sessions were already answered or abandoned.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let mut filter = EventFilter::kind(kinds::REQUEST).with_p_tag(self.inner.service_pubkey.to_hex());
        filter.since = Some(nostr::Timestamp::now().as_u64());
        let subscription = self.inner.outbox.transport().subscribe(filter).await?;
        let subscription_id = subscription.id.clone();
        info!(pubkey = %self.inner.service_pubkey, sub = %subscription_id, "Listening for wallet-connect requests");

        let inner = self.inner.clone();
        let mut notifications = subscription.notifications;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                match notification {
                    RelayNotification::Event(event) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            inner.process(*event).await;
                        });
                    }
                    RelayNotification::EndOfStoredEvents { relay } => {
                        debug!(relay = %relay, "End of stored requests");
                    }
                    RelayNotification::Closed { relay, message } => {
                        info!(relay = %relay, "Request subscription closed: {}", message.unwrap_or_default());
                    }
                }
            }
        });

        *listener = Some(Listener { subscription_id, task });
        self.state.send_replace(DispatcherState::Listening);
        Ok(())
    }

    /// Cancel the subscription. Requests already being handled still answer.
    pub async fn stop(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.task.abort();
            self.inner.outbox.transport().unsubscribe(&listener.subscription_id).await;
            info!(pubkey = %self.inner.service_pubkey, "Stopped listening for requests");
        }
        self.state.send_replace(DispatcherState::Stopped);
    }

    /// Handle one inbound event. Returns the published response, if any.
    pub async fn process(&self, event: Event) -> Option<Event> {
        self.inner.process(event).await
    }
}

impl Inner {
    async fn process(&self, event: Event) -> Option<Event> {
        if event.kind.as_u16() != kinds::REQUEST {
            return None;
        }
        if event.pubkey == self.service_pubkey {
            debug!(event_id = %event.id, "Skipping event from own wallet");
            return None;
        }
        if !self.registry.is_paired(&event.pubkey) {
            info!(sender = %event.pubkey, "Request from unpaired client, ignoring");
            return None;
        }

        let envelope = match self.codec.decode_request(&event) {
            Ok(envelope) => envelope,
            Err(CodecError::UnknownMethod) => {
                debug!(event_id = %event.id, "Request without method, dropping");
                return None;
            }
            Err(e) => {
                debug!(event_id = %event.id, "Undecodable request dropped: {}", e);
                return None;
            }
        };

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if codec::is_expired(&event, now) {
            info!(event_id = %event.id, method = %envelope.method, "Request expired, ignoring");
            return None;
        }

        let request_id = envelope.id.clone().unwrap_or_else(|| event.id.to_hex());
        self.set_phase(&request_id, Some(RequestPhase::Processing));

        let outcome = match Method::parse(&envelope.method) {
            None => Outcome::error(ErrorCode::MethodNotFound, format!("Method {} not supported", envelope.method)),
            Some(method) => match Request::from_parts(method, envelope.params) {
                Ok(request) => self.run_handler(request, event.pubkey).await,
                Err(e) => Outcome::error(ErrorCode::InvalidParams, format!("Invalid params for {}: {}", method.as_str(), e)),
            },
        };

        let result = match outcome {
            Outcome::Reply(result) => result,
            Outcome::NoReply => {
                self.set_phase(&request_id, None);
                return None;
            }
        };

        self.set_phase(&request_id, Some(RequestPhase::Responding));
        let response = Response::new(request_id.clone(), envelope.method, result);
        let reply = match self.codec.response(&event.pubkey, &event.id, &response) {
            Ok(reply) => reply,
            Err(e) => {
                error!(request_id = %request_id, "Failed to encode response: {}", e);
                self.set_phase(&request_id, None);
                return None;
            }
        };
        if !self.outbox.publish(reply.clone()).await {
            warn!(request_id = %request_id, "Response cached for retry");
        }
        self.set_phase(&request_id, None);
        Some(reply)
    }

    /// Run the handler on its own task so a panic becomes PROCESSING_ERROR.
    async fn run_handler(&self, request: Request, requester: PublicKey) -> Outcome {
        let method = request.method();
        let capabilities = self.capabilities.clone();
        match tokio::spawn(async move { capabilities.handle(request, requester).await }).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(method = method.as_str(), "Request processing failed: {}", e);
                Outcome::error(ErrorCode::ProcessingError, "Failed to process request")
            }
            Err(e) => {
                error!(method = method.as_str(), "Request handler aborted: {}", e);
                Outcome::error(ErrorCode::ProcessingError, "Failed to process request")
            }
        }
    }

    fn set_phase(&self, request_id: &str, phase: Option<RequestPhase>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        match phase {
            Some(phase) => {
                in_flight.insert(request_id.to_string(), phase);
            }
            None => {
                in_flight.remove(request_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWallet;
    use crate::nostr::MemoryRelay;
    use crate::nwc::message::RequestEnvelope;
    use crate::registry::ClientPairing;
    use crate::store::MemoryStore;
    use nostr::Keys;
    use serde_json::{json, Value};

    struct Fixture {
        dispatcher: RequestDispatcher,
        relay: Arc<MemoryRelay>,
        registry: Arc<ConnectionRegistry>,
        client: EventCodec,
        wallet_pk: PublicKey,
    }

    fn service_identity() -> ServiceIdentity {
        ServiceIdentity::from_secret(&[7u8; 32]).unwrap()
    }

    fn fixture() -> Fixture {
        let relay = Arc::new(MemoryRelay::default());
        let outbox = Arc::new(Outbox::new(relay.clone()));
        let registry = Arc::new(ConnectionRegistry::load(Arc::new(MemoryStore::new()), "wss://r"));
        let client_keys = Keys::generate();
        registry
            .insert("test", ClientPairing { client_pubkey: client_keys.public_key().to_hex(), preferred_relay: None })
            .unwrap();

        let identity = service_identity();
        let wallet = Arc::new(MockWallet::new());
        wallet.set_balance(42_000);
        let dispatcher = RequestDispatcher::new(&identity, wallet, registry.clone(), outbox, &NwcConfig::default());
        Fixture { dispatcher, relay, registry, client: EventCodec::new(client_keys), wallet_pk: identity.public_key() }
    }

    fn request(f: &Fixture, id: &str, method: &str, params: Value, expiration: Option<u64>) -> Event {
        f.client
            .request(&f.wallet_pk, &RequestEnvelope::new(id, method, params), expiration)
            .unwrap()
    }

    #[tokio::test]
    async fn test_balance_request_answered() {
        let f = fixture();
        let reply = f.dispatcher.process(request(&f, "1", "get_balance", json!({}), None)).await.unwrap();
        let body: Value = f.client.decode(&reply).unwrap();
        assert_eq!(body["id"], "1");
        assert_eq!(body["result_type"], "get_balance");
        assert_eq!(body["result"]["balance"], 42000);
        assert_eq!(f.relay.published_of_kind(kinds::RESPONSE).len(), 1);
        assert!(f.dispatcher.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let f = fixture();
        let reply = f.dispatcher.process(request(&f, "3", "nonexistent_method", json!({}), None)).await.unwrap();
        let body: Value = f.client.decode(&reply).unwrap();
        assert_eq!(body["error"]["code"], "METHOD_NOT_FOUND");
        assert_eq!(body["id"], "3");
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let f = fixture();
        let reply = f.dispatcher.process(request(&f, "4", "make_invoice", json!({"amount": "ten"}), None)).await.unwrap();
        let body: Value = f.client.decode(&reply).unwrap();
        assert_eq!(body["error"]["code"], "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn test_unpaired_sender_ignored() {
        let f = fixture();
        let stranger = EventCodec::new(Keys::generate());
        let event = stranger
            .request(&f.wallet_pk, &RequestEnvelope::new("1", "get_balance", json!({})), None)
            .unwrap();
        assert!(f.dispatcher.process(event).await.is_none());
        assert!(f.relay.published().is_empty());
    }

    #[tokio::test]
    async fn test_own_events_ignored_even_when_paired() {
        let f = fixture();
        f.registry
            .insert("self", ClientPairing { client_pubkey: f.wallet_pk.to_hex(), preferred_relay: None })
            .unwrap();
        assert!(f.registry.is_paired(&f.wallet_pk));

        let own = EventCodec::new(service_identity().keys);
        let event = own
            .request(&f.wallet_pk, &RequestEnvelope::new("loop", "get_balance", json!({})), None)
            .unwrap();
        assert!(f.dispatcher.process(event).await.is_none());
        assert!(f.relay.published().is_empty());
    }

    #[tokio::test]
    async fn test_expired_request_ignored() {
        let f = fixture();
        let past = chrono::Utc::now().timestamp() as u64 - 60;
        assert!(f.dispatcher.process(request(&f, "1", "get_balance", json!({}), Some(past))).await.is_none());
        assert!(f.relay.published().is_empty());
    }

    #[tokio::test]
    async fn test_missing_id_uses_event_id() {
        let f = fixture();
        let event = f
            .client
            .encode(kinds::REQUEST, &json!({"method": "get_info"}), &f.wallet_pk, Vec::new())
            .unwrap();
        let event_id = event.id.to_hex();
        let reply = f.dispatcher.process(event).await.unwrap();
        let body: Value = f.client.decode(&reply).unwrap();
        assert_eq!(body["id"], event_id);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_unsubscribes() {
        let f = fixture();
        assert_eq!(f.dispatcher.state(), DispatcherState::Idle);
        f.dispatcher.start().await.unwrap();
        f.dispatcher.start().await.unwrap();
        assert_eq!(f.relay.subscription_count(), 1);
        assert_eq!(f.dispatcher.state(), DispatcherState::Listening);

        f.dispatcher.stop().await;
        f.dispatcher.stop().await;
        assert_eq!(f.relay.subscription_count(), 0);
        assert_eq!(f.dispatcher.state(), DispatcherState::Stopped);
    }
}
