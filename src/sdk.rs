//! Wallet SDK seam - the federation wallet capabilities the bridge consumes
//!
//! Balance, invoices, payments and federation previews are owned by the
//! external wallet SDK. Subscription-style calls return an [`SdkStream`]; the
//! caller must unsubscribe once its listening window is over.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Stream of SDK updates plus the SDK's unsubscribe hook.
///
/// Dropping the stream unsubscribes if [`SdkStream::unsubscribe`] was not called.
pub struct SdkStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> SdkStream<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { rx, unsubscribe: Some(Box::new(unsubscribe)) }
    }

    /// Stream with no unsubscribe hook.
    pub fn detached(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, unsubscribe: None }
    }

    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        if let Some(hook) = self.unsubscribe.take() {
            hook();
        }
    }
}

impl<T> Drop for SdkStream<T> {
    fn drop(&mut self) {
        if let Some(hook) = self.unsubscribe.take() {
            hook();
        }
    }
}

/// State updates carry SDK-side subscription errors as `Err`.
pub type StateStream<T> = SdkStream<Result<T, String>>;

/// Outgoing lightning payment states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LnPayState {
    Created,
    Funded,
    AwaitingChange,
    WaitingForRefund { error_reason: String },
    Canceled,
    Refunded { gateway_error: String },
    UnexpectedError { error_message: String },
    Success { preimage: String },
}

/// Incoming lightning invoice states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LnReceiveState {
    Created,
    WaitingForPayment { invoice: String, timeout: u64 },
    Canceled { reason: String },
    Funded,
    AwaitingFunds,
    Claimed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub operation_id: String,
    pub invoice: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingPayment {
    pub operation_id: String,
    /// Fee in millisatoshis
    pub fee: u64,
}

/// Raw federation preview as returned by the SDK
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationPreview {
    pub federation_id: String,
    /// Federation client config; some SDK versions hand it over as a JSON string
    pub config: Value,
}

/// One operation-log record as the SDK reports it.
///
/// `kind` is the federation module (`ln`, `mint`, `wallet`), `direction` is
/// `send` or `receive`, `timestamp` is in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    pub timestamp: u64,
    #[serde(default)]
    pub operation_id: String,
    pub kind: String,
    #[serde(rename = "type")]
    pub direction: String,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub amount_msats: Option<u64>,
    #[serde(default)]
    pub fee: Option<u64>,
}

#[async_trait]
pub trait WalletSdk: Send + Sync {
    /// Recovery words of the wallet seed
    async fn mnemonic(&self) -> anyhow::Result<Vec<String>>;

    /// Balance updates in millisatoshis. The first value is the current balance.
    fn subscribe_balance(&self) -> SdkStream<u64>;

    async fn create_invoice(
        &self,
        amount_msats: u64,
        description: &str,
        expiry_secs: Option<u64>,
    ) -> anyhow::Result<CreatedInvoice>;

    async fn pay_invoice(&self, invoice: &str) -> anyhow::Result<OutgoingPayment>;

    fn subscribe_ln_pay(&self, operation_id: &str) -> StateStream<LnPayState>;

    fn subscribe_ln_receive(&self, operation_id: &str) -> StateStream<LnReceiveState>;

    /// Operation log as raw records; shapes vary by module and SDK version
    async fn list_transactions(&self) -> anyhow::Result<Vec<Value>>;
}

#[async_trait]
pub trait FederationPreviewer: Send + Sync {
    async fn preview(&self, invite_code: &str) -> anyhow::Result<FederationPreview>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unsubscribe_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = calls.clone();
        let mut stream = SdkStream::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tx.send(7u64).unwrap();
        assert_eq!(stream.next().await, Some(7));
        stream.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel::<u64>();
        let counter = calls.clone();
        drop(SdkStream::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pay_state_wire_shape() {
        let state: LnPayState = serde_json::from_str(r#"{"success":{"preimage":"ab"}}"#).unwrap();
        assert_eq!(state, LnPayState::Success { preimage: "ab".into() });
        let state: LnReceiveState = serde_json::from_str(r#""claimed""#).unwrap();
        assert_eq!(state, LnReceiveState::Claimed);
    }
}
