//! In-memory wallet SDK and federation previewer for tests and demos
//!
//! `MockWallet` creates fake invoices, settles them on demand and drives
//! payments through a configurable [`PayBehavior`]. Streams that must never
//! resolve keep their sender parked inside the mock.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::sdk::{
    CreatedInvoice, FederationPreview, FederationPreviewer, LnPayState, LnReceiveState, OutgoingPayment,
    SdkStream, StateStream, WalletSdk,
};

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// How the next payments end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayBehavior {
    Succeed { preimage: String, fee: u64 },
    Cancel,
    /// `pay_invoice` itself fails
    Reject(String),
    /// No final state ever arrives
    Hang,
}

type ReceiveSender = mpsc::UnboundedSender<Result<LnReceiveState, String>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct MockWallet {
    mnemonic: Vec<String>,
    balance: AtomicU64,
    stall_balance: AtomicBool,
    fail_invoices: AtomicBool,
    pay: Mutex<PayBehavior>,
    transactions: Mutex<Vec<Value>>,
    next_op: AtomicU64,
    invoices: Mutex<HashMap<String, String>>,
    claimed: Mutex<HashSet<String>>,
    receive_watchers: Mutex<HashMap<String, Vec<ReceiveSender>>>,
    parked: Mutex<Vec<Box<dyn std::any::Any + Send>>>,
    unsubscribes: Arc<AtomicUsize>,
}

impl Default for MockWallet {
    fn default() -> Self {
        Self::with_mnemonic(TEST_MNEMONIC)
    }
}

impl MockWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mnemonic(phrase: &str) -> Self {
        Self {
            mnemonic: phrase.split_whitespace().map(String::from).collect(),
            balance: AtomicU64::new(0),
            stall_balance: AtomicBool::new(false),
            fail_invoices: AtomicBool::new(false),
            pay: Mutex::new(PayBehavior::Succeed { preimage: "00".repeat(32), fee: 0 }),
            transactions: Mutex::new(Vec::new()),
            next_op: AtomicU64::new(1),
            invoices: Mutex::new(HashMap::new()),
            claimed: Mutex::new(HashSet::new()),
            receive_watchers: Mutex::new(HashMap::new()),
            parked: Mutex::new(Vec::new()),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_balance(&self, msats: u64) {
        self.balance.store(msats, Ordering::SeqCst);
    }

    /// Balance subscriptions never yield while stalled.
    pub fn stall_balance(&self, stall: bool) {
        self.stall_balance.store(stall, Ordering::SeqCst);
    }

    pub fn fail_invoices(&self, fail: bool) {
        self.fail_invoices.store(fail, Ordering::SeqCst);
    }

    pub fn set_pay_behavior(&self, behavior: PayBehavior) {
        *lock(&self.pay) = behavior;
    }

    pub fn set_transactions(&self, records: Vec<Value>) {
        *lock(&self.transactions) = records;
    }

    /// Unsubscribe hooks run so far, across every stream handed out.
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Mark an invoice paid and tell every watcher. False if the invoice is unknown.
    pub fn settle_invoice(&self, invoice: &str) -> bool {
        let Some(operation_id) = lock(&self.invoices).get(invoice).cloned() else {
            return false;
        };
        lock(&self.claimed).insert(operation_id.clone());
        if let Some(watchers) = lock(&self.receive_watchers).get(&operation_id) {
            for tx in watchers {
                let _ = tx.send(Ok(LnReceiveState::Funded));
                let _ = tx.send(Ok(LnReceiveState::Claimed));
            }
        }
        true
    }

    fn stream<T: Send + 'static>(&self, rx: mpsc::UnboundedReceiver<T>) -> SdkStream<T> {
        let counter = self.unsubscribes.clone();
        SdkStream::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn park<T: Send + 'static>(&self, tx: mpsc::UnboundedSender<T>) {
        lock(&self.parked).push(Box::new(tx));
    }
}

#[async_trait]
impl WalletSdk for MockWallet {
    async fn mnemonic(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.mnemonic.clone())
    }

    fn subscribe_balance(&self) -> SdkStream<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.stall_balance.load(Ordering::SeqCst) {
            self.park(tx);
        } else {
            let _ = tx.send(self.balance.load(Ordering::SeqCst));
        }
        self.stream(rx)
    }

    async fn create_invoice(
        &self,
        amount_msats: u64,
        _description: &str,
        expiry_secs: Option<u64>,
    ) -> anyhow::Result<CreatedInvoice> {
        if self.fail_invoices.load(Ordering::SeqCst) {
            anyhow::bail!("federation unreachable");
        }
        let n = self.next_op.fetch_add(1, Ordering::SeqCst);
        let created = CreatedInvoice {
            operation_id: format!("{:064x}", n),
            invoice: format!("lnbcrt{}n1mock{}x{}", amount_msats / 1000, n, expiry_secs.unwrap_or(0)),
        };
        lock(&self.invoices).insert(created.invoice.clone(), created.operation_id.clone());
        Ok(created)
    }

    async fn pay_invoice(&self, _invoice: &str) -> anyhow::Result<OutgoingPayment> {
        let fee = match &*lock(&self.pay) {
            PayBehavior::Reject(reason) => anyhow::bail!("{}", reason),
            PayBehavior::Succeed { fee, .. } => *fee,
            _ => 0,
        };
        let n = self.next_op.fetch_add(1, Ordering::SeqCst);
        Ok(OutgoingPayment { operation_id: format!("{:064x}", n), fee })
    }

    fn subscribe_ln_pay(&self, _operation_id: &str) -> StateStream<LnPayState> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(LnPayState::Created));
        match lock(&self.pay).clone() {
            PayBehavior::Succeed { preimage, .. } => {
                let _ = tx.send(Ok(LnPayState::Funded));
                let _ = tx.send(Ok(LnPayState::Success { preimage }));
            }
            PayBehavior::Cancel => {
                let _ = tx.send(Ok(LnPayState::Canceled));
            }
            PayBehavior::Reject(reason) => {
                let _ = tx.send(Err(reason));
            }
            PayBehavior::Hang => self.park(tx),
        }
        self.stream(rx)
    }

    fn subscribe_ln_receive(&self, operation_id: &str) -> StateStream<LnReceiveState> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(LnReceiveState::Created));
        if lock(&self.claimed).contains(operation_id) {
            let _ = tx.send(Ok(LnReceiveState::Claimed));
        } else {
            lock(&self.receive_watchers).entry(operation_id.to_string()).or_default().push(tx);
        }
        self.stream(rx)
    }

    async fn list_transactions(&self) -> anyhow::Result<Vec<Value>> {
        Ok(lock(&self.transactions).clone())
    }
}

/// Federation previews keyed by invite code
#[derive(Default)]
pub struct MockPreviewer {
    previews: Mutex<HashMap<String, FederationPreview>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl MockPreviewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a federation with `guardians` API endpoints.
    pub fn add(&self, invite_code: &str, federation_id: &str, name: &str, guardians: usize) {
        let endpoints: serde_json::Map<String, Value> = (0..guardians)
            .map(|i| (i.to_string(), json!({ "url": format!("wss://guardian-{}.example/", i), "name": format!("g{}", i) })))
            .collect();
        let config = json!({
            "global": {
                "api_endpoints": endpoints,
                "consensus_version": { "major": 2, "minor": 0 },
                "meta": {
                    "federation_name": name,
                    "welcome_message": format!("Welcome to {}", name),
                    "onchain_deposits_disabled": "false",
                    "max_stable_balance_msats": "100000000",
                }
            },
            "modules": { "0": { "kind": "ln" }, "1": { "kind": "mint" } }
        });
        self.insert(invite_code, FederationPreview { federation_id: federation_id.to_string(), config });
    }

    pub fn insert(&self, invite_code: &str, preview: FederationPreview) {
        lock(&self.previews).insert(invite_code.to_string(), preview);
    }

    /// Every preview waits `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FederationPreviewer for MockPreviewer {
    async fn preview(&self, invite_code: &str) -> anyhow::Result<FederationPreview> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.previews)
            .get(invite_code)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown invite code {}", invite_code))
    }
}
