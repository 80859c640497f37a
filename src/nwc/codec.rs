//! EventCodec - NIP-04 encrypted wallet-connect events
//!
//! Every request, response and notification travels as JSON encrypted to the
//! counterpart with the shared secret of the service key and the client key.
//! The counterpart of an inbound event is always its author.

use nostr::nips::nip04;
use nostr::{Event, EventId, Keys, Kind, PublicKey, Tag, Timestamp, UnsignedEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use super::message::{Notification, RequestEnvelope, Response};
use crate::nostr::{first_tag_value, kinds};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),
    #[error("Encryption failed: {0}")]
    EncryptionFailure(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Request has no method")]
    UnknownMethod,
    #[error("Signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone)]
pub struct EventCodec {
    keys: Keys,
}

impl EventCodec {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Plaintext capability advertisement, tagged to the service itself.
    /// `wallet_name` adds a `d` tag.
    pub fn info_event(&self, capabilities: &[&str], wallet_name: Option<&str>) -> Result<Event, CodecError> {
        let own = self.public_key().to_hex();
        let mut tags = vec![tag(&["p", &own])?];
        if let Some(name) = wallet_name {
            tags.push(tag(&["d", name])?);
        }
        let content = json!({ "methods": capabilities }).to_string();
        self.sign(kinds::INFO, tags, content)
    }

    /// Encrypt `payload` to `recipient` and sign it as `kind`.
    pub fn encode<T: Serialize>(
        &self,
        kind: u16,
        payload: &T,
        recipient: &PublicKey,
        mut extra_tags: Vec<Tag>,
    ) -> Result<Event, CodecError> {
        let plaintext = serde_json::to_string(payload).map_err(|e| CodecError::MalformedPayload(e.to_string()))?;
        let content = nip04::encrypt(self.keys.secret_key(), recipient, plaintext)
            .map_err(|e| CodecError::EncryptionFailure(e.to_string()))?;

        let mut tags = vec![tag(&["p", &recipient.to_hex()])?];
        tags.append(&mut extra_tags);
        self.sign(kind, tags, content)
    }

    /// Client side: a request to the wallet, optionally expiring at `expiration` (unix seconds).
    pub fn request(
        &self,
        wallet: &PublicKey,
        envelope: &RequestEnvelope,
        expiration: Option<u64>,
    ) -> Result<Event, CodecError> {
        let mut extra = Vec::new();
        if let Some(at) = expiration {
            extra.push(tag(&["expiration", &at.to_string()])?);
        }
        self.encode(kinds::REQUEST, envelope, wallet, extra)
    }

    /// Response to `request_id`, tagged `p` = requester, `e` = request event.
    pub fn response(&self, requester: &PublicKey, request_id: &EventId, response: &Response) -> Result<Event, CodecError> {
        let extra = vec![tag(&["e", &request_id.to_hex()])?];
        self.encode(kinds::RESPONSE, response, requester, extra)
    }

    pub fn notification(&self, recipient: &PublicKey, notification: &Notification) -> Result<Event, CodecError> {
        self.encode(kinds::NOTIFICATION, notification, recipient, Vec::new())
    }

    /// Decrypt an event authored by a counterpart.
    pub fn decrypt(&self, event: &Event) -> Result<String, CodecError> {
        nip04::decrypt(self.keys.secret_key(), &event.pubkey, &event.content)
            .map_err(|e| CodecError::DecryptionFailure(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self, event: &Event) -> Result<T, CodecError> {
        let plaintext = self.decrypt(event)?;
        serde_json::from_str(&plaintext).map_err(|e| CodecError::MalformedPayload(e.to_string()))
    }

    /// Decrypt and split a request into id, method and params.
    ///
    /// Numeric ids are accepted and stringified.
    pub fn decode_request(&self, event: &Event) -> Result<RequestEnvelope, CodecError> {
        let value: Value = self.decode(event)?;
        let obj = value
            .as_object()
            .ok_or_else(|| CodecError::MalformedPayload("request is not an object".into()))?;

        let method = match obj.get("method").and_then(Value::as_str) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => return Err(CodecError::UnknownMethod),
        };
        let id = match obj.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        Ok(RequestEnvelope { id, method, params })
    }

    fn sign(&self, kind: u16, tags: Vec<Tag>, content: String) -> Result<Event, CodecError> {
        UnsignedEvent::new(self.keys.public_key(), Timestamp::now(), Kind::from(kind), tags, content)
            .sign_with_keys(&self.keys)
            .map_err(|e| CodecError::Signing(e.to_string()))
    }
}

fn tag(parts: &[&str]) -> Result<Tag, CodecError> {
    Tag::parse(parts).map_err(|e| CodecError::MalformedPayload(format!("tag {:?}: {}", parts.first(), e)))
}

/// `expiration` tag value in unix seconds. Unparseable values are ignored.
pub fn expiration(event: &Event) -> Option<u64> {
    first_tag_value(event, "expiration").and_then(|v| v.trim().parse().ok())
}

/// Expired once `now` is strictly past the expiration.
pub fn is_expired(event: &Event, now: u64) -> bool {
    expiration(event).is_some_and(|at| now > at)
}
