//! Federation discovery - advertisements resolved into displayable previews
//!
//! One session at a time. A session subscribes to federation
//! advertisements, resolves each new federation through the previewer and
//! appends it to the published result list. The session ends at its
//! deadline or on `stop()`, keeping whatever resolved so far.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::nostr::{first_tag_value, kinds, EventFilter, RelayNotification, RelayTransport};
use crate::sdk::{FederationPreview, FederationPreviewer};

/// Invite code tag on an advertisement
pub const INVITE_TAG: &str = "u";
/// Federation id tag on an advertisement
pub const FEDERATION_TAG: &str = "d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFederation {
    pub invite_code: String,
    #[serde(rename = "federationID")]
    pub federation_id: String,
    pub icon_url: Option<String>,
    pub fed_name: String,
    pub welcome_message: Option<String>,
    /// Whether on-chain deposits are accepted. `None` when the federation does not say.
    pub on_chain_deposit: Option<bool>,
    pub total_guardians: usize,
    /// Max stable balance in millisatoshis
    pub max_balance: Option<u64>,
    pub consensus_version: Value,
    pub modules: Value,
}

impl DiscoveredFederation {
    /// Build a display entry from a raw preview.
    ///
    /// The config may arrive as a JSON string. Meta values are strings in
    /// federation configs; booleans and numbers are accepted too.
    pub fn from_preview(invite_code: &str, federation_id: &str, preview: &FederationPreview) -> anyhow::Result<Self> {
        let config = match &preview.config {
            Value::String(raw) => serde_json::from_str(raw)?,
            other => other.clone(),
        };
        let global = config
            .get("global")
            .ok_or_else(|| anyhow::anyhow!("federation config has no global section"))?;
        let meta = global.get("meta").cloned().unwrap_or(Value::Null);
        let text = |key: &str| meta.get(key).and_then(Value::as_str).map(String::from);

        let deposits_disabled = match meta.get("onchain_deposits_disabled") {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) => s.trim().parse::<bool>().ok(),
            _ => None,
        };
        let max_balance = match meta.get("max_stable_balance_msats") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };

        Ok(Self {
            invite_code: invite_code.to_string(),
            federation_id: federation_id.to_string(),
            icon_url: text("federation_icon_url"),
            fed_name: text("federation_name").unwrap_or_else(|| federation_id.to_string()),
            welcome_message: text("welcome_message"),
            on_chain_deposit: deposits_disabled.map(|disabled| !disabled),
            total_guardians: global.get("api_endpoints").and_then(Value::as_object).map_or(0, |e| e.len()),
            max_balance,
            consensus_version: global.get("consensus_version").cloned().unwrap_or(Value::Null),
            modules: config.get("modules").cloned().unwrap_or(Value::Null),
        })
    }
}

struct ActiveSession {
    subscription_id: String,
    task: JoinHandle<()>,
}

struct Shared {
    transport: Arc<dyn RelayTransport>,
    previewer: Arc<dyn FederationPreviewer>,
    results: watch::Sender<Vec<DiscoveredFederation>>,
    discovering: watch::Sender<bool>,
    /// (session, federation id) lookups in progress
    resolving: Mutex<HashSet<(u64, String)>>,
    generation: AtomicU64,
}

pub struct DiscoveryEngine {
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    deadline: Duration,
}

impl DiscoveryEngine {
    pub fn new(transport: Arc<dyn RelayTransport>, previewer: Arc<dyn FederationPreviewer>, deadline: Duration) -> Self {
        let (results, _) = watch::channel(Vec::new());
        let (discovering, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                transport,
                previewer,
                results,
                discovering,
                resolving: Mutex::new(HashSet::new()),
                generation: AtomicU64::new(0),
            }),
            session: tokio::sync::Mutex::new(None),
            deadline,
        }
    }

    /// Start a fresh session, stopping any active one and clearing results.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut session = self.session.lock().await;
        if let Some(active) = session.take() {
            self.shared.end(active).await;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.results.send_replace(Vec::new());

        let subscription = self
            .shared
            .transport
            .subscribe(EventFilter::kind(kinds::FEDERATION_ANNOUNCEMENT))
            .await?;
        let subscription_id = subscription.id.clone();
        self.shared.discovering.send_replace(true);
        info!(sub = %subscription_id, "Starting federation discovery");

        let shared = self.shared.clone();
        let deadline = self.deadline;
        let mut notifications = subscription.notifications;
        let sub_id = subscription_id.clone();
        let task = tokio::spawn(async move {
            let timer = tokio::time::sleep(deadline);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => {
                        info!("Discovery window elapsed");
                        break;
                    }
                    notification = notifications.recv() => match notification {
                        Some(RelayNotification::Event(event)) => {
                            let shared = shared.clone();
                            tokio::spawn(async move { shared.resolve(generation, *event).await });
                        }
                        Some(RelayNotification::EndOfStoredEvents { relay }) => {
                            debug!(relay = %relay, "Stored advertisements delivered");
                        }
                        Some(RelayNotification::Closed { relay, .. }) => {
                            debug!(relay = %relay, "Advertisement subscription closed by relay");
                        }
                        None => break,
                    }
                }
            }
            shared.transport.unsubscribe(&sub_id).await;
            if shared.generation.load(Ordering::SeqCst) == generation {
                shared.discovering.send_replace(false);
            }
        });

        *session = Some(ActiveSession { subscription_id, task });
        Ok(())
    }

    /// End the active session, keeping results. Safe to call at any time.
    pub async fn stop(&self) {
        if let Some(active) = self.session.lock().await.take() {
            self.shared.end(active).await;
            info!("Stopped federation discovery");
        }
        self.shared.discovering.send_replace(false);
    }

    /// Observe the result list. Every successful resolution publishes a new list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredFederation>> {
        self.shared.results.subscribe()
    }

    pub fn results(&self) -> Vec<DiscoveredFederation> {
        self.shared.results.borrow().clone()
    }

    pub fn watch_discovering(&self) -> watch::Receiver<bool> {
        self.shared.discovering.subscribe()
    }

    pub fn is_discovering(&self) -> bool {
        *self.shared.discovering.borrow()
    }
}

impl Shared {
    async fn end(&self, active: ActiveSession) {
        active.task.abort();
        self.transport.unsubscribe(&active.subscription_id).await;
    }

    async fn resolve(&self, generation: u64, event: nostr::Event) {
        let invite = first_tag_value(&event, INVITE_TAG).filter(|v| !v.is_empty());
        let federation = first_tag_value(&event, FEDERATION_TAG).filter(|v| !v.is_empty());
        let (Some(invite), Some(federation_id)) = (invite, federation) else {
            debug!(event_id = %event.id, "Advertisement without invite code or federation id, skipping");
            return;
        };
        let key = (generation, federation_id.to_string());

        {
            let mut resolving = self.resolving.lock().unwrap_or_else(|p| p.into_inner());
            if self.results.borrow().iter().any(|f| f.federation_id == federation_id) {
                debug!(federation = federation_id, "Federation already discovered");
                return;
            }
            if !resolving.insert(key.clone()) {
                debug!(federation = federation_id, "Federation already being resolved");
                return;
            }
        }

        let outcome = self
            .previewer
            .preview(invite)
            .await
            .and_then(|preview| DiscoveredFederation::from_preview(invite, federation_id, &preview));

        if self.generation.load(Ordering::SeqCst) == generation {
            match outcome {
                Ok(found) => {
                    let name = found.fed_name.clone();
                    let added = self.results.send_if_modified(|list| {
                        if list.iter().any(|f| f.federation_id == found.federation_id) {
                            false
                        } else {
                            list.push(found);
                            true
                        }
                    });
                    if added {
                        info!(federation = federation_id, name = %name, "Discovered federation");
                    }
                }
                Err(e) => debug!(federation = federation_id, "Preview failed, dropping candidate: {}", e),
            }
        }

        self.resolving.lock().unwrap_or_else(|p| p.into_inner()).remove(&key);
    }
}
