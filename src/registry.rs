//! Connection registry - paired client apps and their connection URIs
//!
//! Each pairing maps an app name to the public half of a freshly generated
//! client keypair. The secret half leaves the wallet exactly once, inside the
//! connection URI, and is never stored.

use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::identity::{ephemeral_keys, secret_hex};
use crate::store::{keys, KvStore, StoreError};

pub const URI_SCHEME: &str = "nostr+walletconnect://";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("App name must not be empty")]
    EmptyAppName,
    #[error("Invalid relay URL: {0}")]
    InvalidRelay(String),
    #[error("Invalid connection URI: {0}")]
    InvalidUri(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Registry lock poisoned")]
    Poisoned,
}

/// Stored pairing. Field names match the persisted blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPairing {
    #[serde(rename = "clientPubKey")]
    pub client_pubkey: String,
    /// Relay the app asked for, if any
    #[serde(rename = "relay", default)]
    pub preferred_relay: Option<String>,
}

/// `nostr+walletconnect://<wallet pubkey>?relay=<url>&secret=<client secret>`
#[derive(Clone, PartialEq, Eq)]
pub struct NwcUri {
    pub wallet_pubkey: PublicKey,
    pub relay: String,
    pub secret: String,
}

impl fmt::Display for NwcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}?relay={}&secret={}",
            URI_SCHEME,
            self.wallet_pubkey.to_hex(),
            urlencoding::encode(&self.relay),
            self.secret
        )
    }
}

impl fmt::Debug for NwcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NwcUri")
            .field("wallet_pubkey", &self.wallet_pubkey.to_hex())
            .field("relay", &self.relay)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl FromStr for NwcUri {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| RegistryError::InvalidUri("wrong scheme".into()))?;
        let (pubkey, query) = rest
            .split_once('?')
            .ok_or_else(|| RegistryError::InvalidUri("missing query".into()))?;
        let wallet_pubkey = PublicKey::from_hex(pubkey.trim_end_matches('/'))
            .map_err(|e| RegistryError::InvalidUri(e.to_string()))?;

        let mut relay = None;
        let mut secret = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("relay", v)) => {
                    let decoded = urlencoding::decode(v).map_err(|e| RegistryError::InvalidUri(e.to_string()))?;
                    relay = Some(decoded.into_owned());
                }
                Some(("secret", v)) => secret = Some(v.to_string()),
                _ => {}
            }
        }
        Ok(Self {
            wallet_pubkey,
            relay: relay.ok_or_else(|| RegistryError::InvalidUri("missing relay".into()))?,
            secret: secret.ok_or_else(|| RegistryError::InvalidUri("missing secret".into()))?,
        })
    }
}

/// Result of a new pairing
#[derive(Debug, Clone)]
pub struct NwcConnection {
    pub app_name: String,
    pub client_pubkey: PublicKey,
    pub uri: NwcUri,
}

pub struct ConnectionRegistry {
    store: Arc<dyn KvStore>,
    pairings: RwLock<BTreeMap<String, ClientPairing>>,
    default_relay: String,
}

impl ConnectionRegistry {
    /// Load pairings from `store`. A corrupt blob is logged and treated as empty.
    pub fn load(store: Arc<dyn KvStore>, default_relay: impl Into<String>) -> Self {
        let pairings = match store.get_json::<BTreeMap<String, ClientPairing>>(keys::CLIENT_RELAY_KEYS) {
            Ok(Some(map)) => map,
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Ignoring unreadable pairings: {}", e);
                BTreeMap::new()
            }
        };
        tracing::debug!(count = pairings.len(), "Loaded client pairings");
        Self { store, pairings: RwLock::new(pairings), default_relay: default_relay.into() }
    }

    /// Pair a new app with fresh client keys.
    ///
    /// Re-using an app name replaces its pairing; other pairings are kept.
    pub fn generate_connection(
        &self,
        app_name: &str,
        relay: Option<&str>,
        wallet_pubkey: &PublicKey,
    ) -> Result<NwcConnection, RegistryError> {
        let app_name = app_name.trim();
        if app_name.is_empty() {
            return Err(RegistryError::EmptyAppName);
        }
        let relay = relay.map(str::trim).filter(|r| !r.is_empty());
        if let Some(url) = relay {
            validate_relay(url)?;
        }

        let mut client = ephemeral_keys();
        while client.public_key() == *wallet_pubkey {
            client = ephemeral_keys();
        }

        let pairing = ClientPairing {
            client_pubkey: client.public_key().to_hex(),
            preferred_relay: relay.map(String::from),
        };
        self.insert(app_name, pairing)?;
        tracing::info!(app = app_name, "Paired new client");

        Ok(NwcConnection {
            app_name: app_name.to_string(),
            client_pubkey: client.public_key(),
            uri: NwcUri {
                wallet_pubkey: *wallet_pubkey,
                relay: relay.unwrap_or(&self.default_relay).to_string(),
                secret: secret_hex(&client),
            },
        })
    }

    /// Insert or replace one pairing and persist the whole map.
    pub fn insert(&self, app_name: &str, pairing: ClientPairing) -> Result<(), RegistryError> {
        let mut pairings = self.pairings.write().map_err(|_| RegistryError::Poisoned)?;
        let mut next = pairings.clone();
        next.insert(app_name.to_string(), pairing);
        self.store.set_json(keys::CLIENT_RELAY_KEYS, &next)?;
        *pairings = next;
        Ok(())
    }

    pub fn get(&self, app_name: &str) -> Option<ClientPairing> {
        self.pairings.read().ok().and_then(|p| p.get(app_name).cloned())
    }

    /// Whether `pubkey` belongs to any paired app
    pub fn is_paired(&self, pubkey: &PublicKey) -> bool {
        let hex = pubkey.to_hex();
        self.pairings
            .read()
            .map(|p| p.values().any(|pairing| pairing.client_pubkey.eq_ignore_ascii_case(&hex)))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<(String, ClientPairing)> {
        self.pairings
            .read()
            .map(|p| p.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pairings.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_relay(url: &str) -> Result<(), RegistryError> {
    let host = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .ok_or_else(|| RegistryError::InvalidRelay(url.to_string()))?;
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(RegistryError::InvalidRelay(url.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_public_key;
    use crate::store::MemoryStore;
    use nostr::Keys;

    fn registry() -> (Arc<dyn KvStore>, ConnectionRegistry) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::load(store.clone(), "wss://relay.getalby.com/v1");
        (store, registry)
    }

    #[test]
    fn test_generate_connection_uri() {
        let (_, registry) = registry();
        let wallet = Keys::generate().public_key();
        let conn = registry.generate_connection("Alby", None, &wallet).unwrap();

        let uri = conn.uri.to_string();
        assert!(uri.starts_with(&format!("nostr+walletconnect://{}?relay=", wallet.to_hex())));
        assert!(uri.contains("relay=wss%3A%2F%2Frelay.getalby.com%2Fv1&secret="));

        let parsed: NwcUri = uri.parse().unwrap();
        assert_eq!(parsed, conn.uri);
        assert_eq!(derive_public_key(&parsed.secret).unwrap(), conn.client_pubkey);
        assert!(registry.is_paired(&conn.client_pubkey));
        assert_eq!(registry.get("Alby").unwrap().preferred_relay, None);
    }

    #[test]
    fn test_pairings_merge_and_persist() {
        let (store, registry) = registry();
        let wallet = Keys::generate().public_key();
        let a = registry.generate_connection("A", Some("wss://relay.damus.io"), &wallet).unwrap();
        let b = registry.generate_connection("B", None, &wallet).unwrap();
        assert_ne!(a.client_pubkey, b.client_pubkey);
        assert_eq!(registry.len(), 2);

        let reloaded = ConnectionRegistry::load(store, "wss://x");
        assert!(reloaded.is_paired(&a.client_pubkey));
        assert!(reloaded.is_paired(&b.client_pubkey));
        assert_eq!(reloaded.get("A").unwrap().preferred_relay.as_deref(), Some("wss://relay.damus.io"));
    }

    #[test]
    fn test_same_name_replaces_pairing() {
        let (_, registry) = registry();
        let wallet = Keys::generate().public_key();
        let first = registry.generate_connection("App", None, &wallet).unwrap();
        let second = registry.generate_connection("App", None, &wallet).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_paired(&first.client_pubkey));
        assert!(registry.is_paired(&second.client_pubkey));
    }

    #[test]
    fn test_rejects_bad_input() {
        let (_, registry) = registry();
        let wallet = Keys::generate().public_key();
        assert!(matches!(registry.generate_connection("  ", None, &wallet), Err(RegistryError::EmptyAppName)));
        assert!(matches!(
            registry.generate_connection("App", Some("https://relay.example"), &wallet),
            Err(RegistryError::InvalidRelay(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_persisted_blob_shape() {
        let (store, registry) = registry();
        let wallet = Keys::generate().public_key();
        registry.generate_connection("App", Some("wss://r"), &wallet).unwrap();
        let raw: serde_json::Value = store.get_json(keys::CLIENT_RELAY_KEYS).unwrap().unwrap();
        assert!(raw["App"]["clientPubKey"].is_string());
        assert_eq!(raw["App"]["relay"], "wss://r");
    }

    #[test]
    fn test_corrupt_blob_loads_empty() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.set(keys::CLIENT_RELAY_KEYS, "not json").unwrap();
        assert!(ConnectionRegistry::load(store, "wss://x").is_empty());
    }

    #[test]
    fn test_relay_with_query_survives_uri() {
        let (_, registry) = registry();
        let wallet = Keys::generate().public_key();
        let relay = "wss://relay.example/?token=a&x=b#frag";
        let conn = registry.generate_connection("App", Some(relay), &wallet).unwrap();

        let parsed: NwcUri = conn.uri.to_string().parse().unwrap();
        assert_eq!(parsed.relay, relay);
        assert_eq!(parsed.secret, conn.uri.secret);
    }

    #[test]
    fn test_plain_relay_still_parses() {
        let pk = Keys::generate().public_key().to_hex();
        let secret = "11".repeat(32);
        let uri = format!("nostr+walletconnect://{}?relay=wss://relay.damus.io&secret={}", pk, secret);
        let parsed: NwcUri = uri.parse().unwrap();
        assert_eq!(parsed.relay, "wss://relay.damus.io");
    }

    struct ReadOnlyStore;

    impl KvStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only")))
        }

        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_persist_does_not_authorize() {
        let registry = ConnectionRegistry::load(Arc::new(ReadOnlyStore), "wss://x");
        let wallet = Keys::generate().public_key();
        assert!(matches!(registry.generate_connection("App", None, &wallet), Err(RegistryError::Store(_))));
        assert!(registry.is_empty());
        assert!(registry.get("App").is_none());
    }

    #[test]
    fn test_uri_parse_errors() {
        assert!("http://x".parse::<NwcUri>().is_err());
        let pk = Keys::generate().public_key().to_hex();
        assert!(format!("nostr+walletconnect://{}?relay=wss://r", pk).parse::<NwcUri>().is_err());
    }
}
