//! Capability handlers - one per wallet-connect method
//!
//! Handlers translate SDK results and failures into protocol results and
//! error codes. SDK failures never escape as `Err`; an `Err` from
//! [`Capabilities::handle`] means the request itself could not be processed.

use nostr::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::codec::{CodecError, EventCodec};
use super::invoices::{InFlightInvoices, TrackedInvoice, MAX_INVOICE_EXPIRY};
use super::message::*;
use crate::config::{NwcConfig, Timeouts};
use crate::nostr::Outbox;
use crate::sdk::{CreatedInvoice, LnPayState, LnReceiveState, TransactionEntry, WalletSdk};

const DEFAULT_DESCRIPTION: &str = "Haze wallet invoice";

/// Handler result. `NoReply` leaves the request unanswered.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Reply(Result<ResponseResult, ErrorBody>),
    NoReply,
}

impl Outcome {
    pub fn ok(result: ResponseResult) -> Self {
        Outcome::Reply(Ok(result))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Outcome::Reply(Err(ErrorBody::new(code, message)))
    }
}

/// Publishes encrypted notifications to paired clients
pub struct Notifier {
    codec: EventCodec,
    outbox: Arc<Outbox>,
}

impl Notifier {
    pub fn new(codec: EventCodec, outbox: Arc<Outbox>) -> Self {
        Self { codec, outbox }
    }

    pub async fn payment_received(&self, recipient: &PublicKey, payment: PaymentNotification) -> Result<(), CodecError> {
        let status = payment.status;
        let event = self.codec.notification(recipient, &Notification::payment_received(payment))?;
        if !self.outbox.publish(event).await {
            warn!(?status, "payment_received notification cached for retry");
        }
        Ok(())
    }
}

pub struct Capabilities {
    wallet: Arc<dyn WalletSdk>,
    invoices: Arc<InFlightInvoices>,
    notifier: Arc<Notifier>,
    info: InfoResult,
    timeouts: Timeouts,
}

impl Capabilities {
    pub fn new(
        wallet: Arc<dyn WalletSdk>,
        codec: EventCodec,
        outbox: Arc<Outbox>,
        config: &NwcConfig,
    ) -> Self {
        let info = InfoResult {
            alias: config.alias.clone(),
            color: config.color.clone(),
            pubkey: codec.public_key().to_hex(),
            network: config.network.clone(),
            block_height: 0,
            block_hash: "0".repeat(64),
            methods: advertised_capabilities().into_iter().map(String::from).collect(),
            notifications: NOTIFICATION_TYPES.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            wallet,
            invoices: Arc::new(InFlightInvoices::new()),
            notifier: Arc::new(Notifier::new(codec, outbox)),
            info,
            timeouts: config.timeouts,
        }
    }

    pub fn invoices(&self) -> &Arc<InFlightInvoices> {
        &self.invoices
    }

    pub async fn handle(&self, request: Request, requester: PublicKey) -> anyhow::Result<Outcome> {
        debug!(method = request.method().as_str(), "Handling request");
        match request {
            Request::GetInfo => Ok(Outcome::ok(ResponseResult::Info(self.info.clone()))),
            Request::GetBalance => Ok(self.get_balance().await),
            Request::MakeInvoice(params) => self.make_invoice(params, requester).await,
            Request::PayInvoice(params) => Ok(self.pay_invoice(params).await),
            Request::LookupInvoice(params) => Ok(self.lookup_invoice(params).await),
            Request::ListTransactions(params) => Ok(self.list_transactions(params).await),
        }
    }

    async fn get_balance(&self) -> Outcome {
        let mut stream = self.wallet.subscribe_balance();
        let first = timeout(self.timeouts.balance, stream.next()).await;
        stream.unsubscribe();
        match first {
            Ok(Some(msats)) => Outcome::ok(ResponseResult::Balance(BalanceResult { balance: msats })),
            Ok(None) => Outcome::error(ErrorCode::BalanceError, "Balance stream closed"),
            Err(_) => Outcome::error(ErrorCode::BalanceError, "Timeout while fetching balance"),
        }
    }

    async fn make_invoice(&self, params: MakeInvoiceParams, requester: PublicKey) -> anyhow::Result<Outcome> {
        if params.expiry.is_some_and(|e| e > MAX_INVOICE_EXPIRY) {
            return Ok(Outcome::error(
                ErrorCode::InvalidParams,
                format!("expiry must be at most {} seconds", MAX_INVOICE_EXPIRY),
            ));
        }
        let description = params
            .description
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());

        let created = match self.wallet.create_invoice(params.amount, &description, params.expiry).await {
            Ok(created) => created,
            Err(e) => {
                warn!("Invoice creation failed: {}", e);
                return Ok(Outcome::error(ErrorCode::Internal, format!("Failed to create invoice: {}", e)));
            }
        };

        let expiry = params.expiry.unwrap_or_else(|| self.timeouts.invoice_ttl.as_secs());
        let created_at = chrono::Utc::now().timestamp();
        let tracked = TrackedInvoice {
            operation_id: created.operation_id.clone(),
            amount: params.amount,
            description,
            description_hash: params.description_hash.clone(),
            created_at,
            expires_at: created_at.saturating_add(i64::try_from(expiry).unwrap_or(i64::MAX)),
        };
        self.invoices.insert(created.invoice.clone(), tracked.clone(), Duration::from_secs(expiry));
        info!(operation_id = %created.operation_id, amount = params.amount, "Invoice created");

        self.notifier
            .payment_received(&requester, payment_notification(&created.invoice, &tracked, PaymentStatus::Pending))
            .await?;
        self.spawn_settlement_monitor(created.clone(), tracked.clone(), requester);

        Ok(Outcome::ok(ResponseResult::Transaction(invoice_record(
            &created.invoice,
            &tracked,
            TransactionState::Pending,
        ))))
    }

    /// Watch the invoice for the monitoring window and notify on claim.
    fn spawn_settlement_monitor(&self, created: CreatedInvoice, tracked: TrackedInvoice, requester: PublicKey) {
        let mut stream = self.wallet.subscribe_ln_receive(&created.operation_id);
        let notifier = self.notifier.clone();
        let window = self.timeouts.invoice_monitor;

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        debug!(operation_id = %created.operation_id, "Invoice monitoring window closed");
                        break;
                    }
                    state = stream.next() => match state {
                        Some(Ok(LnReceiveState::Claimed)) => {
                            info!(operation_id = %created.operation_id, "Invoice settled");
                            let mut settled = payment_notification(&created.invoice, &tracked, PaymentStatus::Settled);
                            settled.settled_at = Some(chrono::Utc::now().timestamp());
                            if let Err(e) = notifier.payment_received(&requester, settled).await {
                                warn!("Settlement notification failed: {}", e);
                            }
                            break;
                        }
                        Some(Ok(LnReceiveState::Canceled { reason })) => {
                            debug!(operation_id = %created.operation_id, "Invoice canceled: {}", reason);
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(operation_id = %created.operation_id, "Receive subscription error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            stream.unsubscribe();
        });
    }

    async fn pay_invoice(&self, params: PayInvoiceParams) -> Outcome {
        let payment = match self.wallet.pay_invoice(&params.invoice).await {
            Ok(payment) => payment,
            Err(e) => return Outcome::error(ErrorCode::PaymentFailed, e.to_string()),
        };
        info!(operation_id = %payment.operation_id, "Payment started");

        let mut stream = self.wallet.subscribe_ln_pay(&payment.operation_id);
        let terminal = timeout(self.timeouts.payment, async {
            while let Some(update) = stream.next().await {
                match update {
                    Ok(LnPayState::Success { preimage }) => {
                        return Outcome::ok(ResponseResult::Payment(PayResult { preimage, fees_paid: payment.fee }));
                    }
                    Ok(LnPayState::Canceled) => {
                        return Outcome::error(ErrorCode::PaymentCancelled, "Payment was cancelled");
                    }
                    Ok(LnPayState::Refunded { gateway_error }) => {
                        return Outcome::error(ErrorCode::PaymentFailed, format!("Payment refunded: {}", gateway_error));
                    }
                    Ok(LnPayState::UnexpectedError { error_message }) => {
                        return Outcome::error(ErrorCode::PaymentFailed, error_message);
                    }
                    Ok(state) => debug!(?state, "Payment progress"),
                    Err(e) => return Outcome::error(ErrorCode::SubscriptionError, e),
                }
            }
            Outcome::error(ErrorCode::SubscriptionError, "Payment stream ended without a final state")
        })
        .await;
        stream.unsubscribe();

        terminal.unwrap_or_else(|_| {
            warn!(operation_id = %payment.operation_id, "No final payment state in time, leaving request unanswered");
            Outcome::NoReply
        })
    }

    async fn lookup_invoice(&self, params: LookupInvoiceParams) -> Outcome {
        let Some(invoice) = params.invoice.filter(|i| !i.is_empty()) else {
            return Outcome::error(ErrorCode::InvalidInvoice, "Invoice is undefined");
        };
        let Some(tracked) = self.invoices.get(&invoice) else {
            return Outcome::error(ErrorCode::NotFound, "Invoice not found");
        };

        let mut stream = self.wallet.subscribe_ln_receive(&tracked.operation_id);
        let terminal = timeout(self.timeouts.lookup, async {
            while let Some(update) = stream.next().await {
                match update {
                    Ok(LnReceiveState::Claimed) => {
                        let mut record = invoice_record(&invoice, &tracked, TransactionState::Settled);
                        record.settled_at = Some(chrono::Utc::now().timestamp());
                        return Outcome::ok(ResponseResult::Transaction(record));
                    }
                    Ok(LnReceiveState::Canceled { reason }) => {
                        return Outcome::error(ErrorCode::PaymentCancelled, reason);
                    }
                    Ok(_) => continue,
                    Err(e) => return Outcome::error(ErrorCode::SubscriptionError, e),
                }
            }
            Outcome::error(ErrorCode::SubscriptionError, "Invoice stream ended without a final state")
        })
        .await;
        stream.unsubscribe();

        terminal.unwrap_or_else(|_| {
            warn!(operation_id = %tracked.operation_id, "Invoice not claimed in time, leaving lookup unanswered");
            Outcome::NoReply
        })
    }

    async fn list_transactions(&self, params: ListTransactionsParams) -> Outcome {
        let raw = match self.wallet.list_transactions().await {
            Ok(raw) => raw,
            Err(e) => return Outcome::error(ErrorCode::Internal, format!("Failed to list transactions: {}", e)),
        };

        let mut records: Vec<TransactionRecord> = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<TransactionEntry>(value) {
                Ok(entry) => Some(transaction_record(&entry)),
                Err(e) => {
                    debug!("Skipping unrecognized transaction record: {}", e);
                    None
                }
            })
            .filter(|record| keep(record, &params))
            .collect();

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let records: Vec<TransactionRecord> = records
            .into_iter()
            .skip(params.offset.unwrap_or(0))
            .take(params.limit.unwrap_or(usize::MAX))
            .collect();

        Outcome::ok(ResponseResult::Transactions(TransactionsResult { transactions: records }))
    }
}

fn keep(record: &TransactionRecord, params: &ListTransactionsParams) -> bool {
    if params.from.is_some_and(|from| record.created_at < from) {
        return false;
    }
    if params.until.is_some_and(|until| record.created_at > until) {
        return false;
    }
    if params.direction.is_some_and(|d| d != record.direction) {
        return false;
    }
    let unpaid = record.direction == TransactionType::Incoming && record.state == TransactionState::Pending;
    !unpaid || params.unpaid.unwrap_or(false)
}

fn payment_notification(invoice: &str, tracked: &TrackedInvoice, status: PaymentStatus) -> PaymentNotification {
    PaymentNotification {
        direction: TransactionType::Incoming,
        status,
        invoice: invoice.to_string(),
        payment_hash: tracked.operation_id.clone(),
        amount: tracked.amount,
        description: Some(tracked.description.clone()),
        preimage: None,
        created_at: tracked.created_at,
        expires_at: Some(tracked.expires_at),
        settled_at: None,
    }
}

fn invoice_record(invoice: &str, tracked: &TrackedInvoice, state: TransactionState) -> TransactionRecord {
    TransactionRecord {
        direction: TransactionType::Incoming,
        state,
        invoice: Some(invoice.to_string()),
        description: Some(tracked.description.clone()),
        description_hash: tracked.description_hash.clone(),
        preimage: None,
        payment_hash: tracked.operation_id.clone(),
        amount: tracked.amount,
        fees_paid: 0,
        created_at: tracked.created_at,
        expires_at: Some(tracked.expires_at),
        settled_at: None,
        metadata: serde_json::json!({}),
    }
}

/// Map an SDK operation-log entry. Outcome names differ per module.
fn transaction_record(entry: &TransactionEntry) -> TransactionRecord {
    let direction = if entry.direction == "send" { TransactionType::Outgoing } else { TransactionType::Incoming };
    let outcome = entry.outcome.as_deref().unwrap_or_default();
    let state = match (entry.kind.as_str(), outcome) {
        ("ln", "claimed" | "success") => TransactionState::Settled,
        ("ln", "canceled" | "failed" | "refunded") => TransactionState::Failed,
        ("mint", "Success" | "success") => TransactionState::Settled,
        ("mint", "UserCanceledProcessing" | "UserCanceledFailure") => TransactionState::Failed,
        ("wallet", "Claimed" | "Confirmed") => TransactionState::Settled,
        _ => TransactionState::Pending,
    };
    let created_at = (entry.timestamp / 1000) as i64;
    TransactionRecord {
        direction,
        state,
        invoice: entry.invoice.clone(),
        description: None,
        description_hash: None,
        preimage: None,
        payment_hash: entry.operation_id.clone(),
        amount: entry.amount_msats.unwrap_or(0),
        fees_paid: entry.fee.unwrap_or(0),
        created_at,
        expires_at: None,
        settled_at: (state == TransactionState::Settled).then_some(created_at),
        metadata: serde_json::json!({ "kind": entry.kind }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockWallet, PayBehavior};
    use crate::nostr::{kinds, MemoryRelay};
    use nostr::Keys;
    use serde_json::json;

    struct Fixture {
        wallet: Arc<MockWallet>,
        relay: Arc<MemoryRelay>,
        caps: Capabilities,
        client: Keys,
    }

    fn fixture() -> Fixture {
        let wallet = Arc::new(MockWallet::new());
        let relay = Arc::new(MemoryRelay::default());
        let outbox = Arc::new(Outbox::new(relay.clone()));
        let caps = Capabilities::new(wallet.clone(), EventCodec::new(Keys::generate()), outbox, &NwcConfig::default());
        Fixture { wallet, relay, caps, client: Keys::generate() }
    }

    #[tokio::test]
    async fn test_get_info_lists_methods() {
        let f = fixture();
        let outcome = f.caps.handle(Request::GetInfo, f.client.public_key()).await.unwrap();
        match outcome {
            Outcome::Reply(Ok(ResponseResult::Info(info))) => {
                assert_eq!(info.alias, "Haze Wallet");
                assert!(info.methods.iter().any(|m| m == "pay_invoice"));
                assert_eq!(info.pubkey.len(), 64);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_balance_unsubscribes() {
        let f = fixture();
        f.wallet.set_balance(21_000);
        let outcome = f.caps.handle(Request::GetBalance, f.client.public_key()).await.unwrap();
        assert_eq!(outcome, Outcome::ok(ResponseResult::Balance(BalanceResult { balance: 21_000 })));
        assert_eq!(f.wallet.unsubscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_balance_timeout() {
        let f = fixture();
        f.wallet.stall_balance(true);
        let outcome = f.caps.handle(Request::GetBalance, f.client.public_key()).await.unwrap();
        match outcome {
            Outcome::Reply(Err(e)) => assert_eq!(e.code, ErrorCode::BalanceError),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_make_invoice_tracks_and_notifies() {
        let f = fixture();
        let params = MakeInvoiceParams { amount: 1000, description: Some("coffee".into()), description_hash: None, expiry: None };
        let outcome = f.caps.handle(Request::MakeInvoice(params), f.client.public_key()).await.unwrap();

        let record = match outcome {
            Outcome::Reply(Ok(ResponseResult::Transaction(record))) => record,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(record.state, TransactionState::Pending);
        assert_eq!(record.amount, 1000);
        let invoice = record.invoice.unwrap();
        assert!(f.caps.invoices().get(&invoice).is_some());
        assert_eq!(f.relay.published_of_kind(kinds::NOTIFICATION).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_after_monitor_window_is_not_notified() {
        let f = fixture();
        let params = MakeInvoiceParams { amount: 2000, description: None, description_hash: None, expiry: None };
        let record = match f.caps.handle(Request::MakeInvoice(params), f.client.public_key()).await.unwrap() {
            Outcome::Reply(Ok(ResponseResult::Transaction(record))) => record,
            other => panic!("unexpected {:?}", other),
        };

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(f.wallet.unsubscribe_count(), 1);

        assert!(f.wallet.settle_invoice(&record.invoice.unwrap()));
        tokio::task::yield_now().await;
        // Only the pending notification went out
        assert_eq!(f.relay.published_of_kind(kinds::NOTIFICATION).len(), 1);
    }

    #[tokio::test]
    async fn test_make_invoice_rejects_oversized_expiry() {
        let f = fixture();
        let params = MakeInvoiceParams { amount: 1000, description: None, description_hash: None, expiry: Some(u64::MAX) };
        match f.caps.handle(Request::MakeInvoice(params), f.client.public_key()).await.unwrap() {
            Outcome::Reply(Err(e)) => assert_eq!(e.code, ErrorCode::InvalidParams),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.caps.invoices().is_empty());
        assert!(f.relay.published().is_empty());

        let params = MakeInvoiceParams {
            amount: 1000,
            description: None,
            description_hash: None,
            expiry: Some(MAX_INVOICE_EXPIRY),
        };
        match f.caps.handle(Request::MakeInvoice(params), f.client.public_key()).await.unwrap() {
            Outcome::Reply(Ok(ResponseResult::Transaction(record))) => {
                assert_eq!(record.expires_at, Some(record.created_at + MAX_INVOICE_EXPIRY as i64));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_make_invoice_sdk_failure_is_internal() {
        let f = fixture();
        f.wallet.fail_invoices(true);
        let params = MakeInvoiceParams { amount: 1, description: None, description_hash: None, expiry: None };
        match f.caps.handle(Request::MakeInvoice(params), f.client.public_key()).await.unwrap() {
            Outcome::Reply(Err(e)) => assert_eq!(e.code, ErrorCode::Internal),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pay_invoice_outcomes() {
        let f = fixture();
        f.wallet.set_pay_behavior(PayBehavior::Succeed { preimage: "ff".into(), fee: 3 });
        let req = Request::PayInvoice(PayInvoiceParams { invoice: "lnbc1".into(), amount: None });
        assert_eq!(
            f.caps.handle(req.clone(), f.client.public_key()).await.unwrap(),
            Outcome::ok(ResponseResult::Payment(PayResult { preimage: "ff".into(), fees_paid: 3 }))
        );

        f.wallet.set_pay_behavior(PayBehavior::Cancel);
        match f.caps.handle(req, f.client.public_key()).await.unwrap() {
            Outcome::Reply(Err(e)) => assert_eq!(e.code, ErrorCode::PaymentCancelled),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pay_invoice_timeout_leaves_unanswered() {
        let f = fixture();
        f.wallet.set_pay_behavior(PayBehavior::Hang);
        let req = Request::PayInvoice(PayInvoiceParams { invoice: "lnbc1".into(), amount: None });
        assert_eq!(f.caps.handle(req, f.client.public_key()).await.unwrap(), Outcome::NoReply);
    }

    #[tokio::test]
    async fn test_lookup_invoice_errors() {
        let f = fixture();
        let missing = Request::LookupInvoice(LookupInvoiceParams::default());
        match f.caps.handle(missing, f.client.public_key()).await.unwrap() {
            Outcome::Reply(Err(e)) => assert_eq!(e.code, ErrorCode::InvalidInvoice),
            other => panic!("unexpected {:?}", other),
        }

        let unknown = Request::LookupInvoice(LookupInvoiceParams { invoice: Some("lnbc-unknown".into()), payment_hash: None });
        match f.caps.handle(unknown, f.client.public_key()).await.unwrap() {
            Outcome::Reply(Err(e)) => assert_eq!(e.code, ErrorCode::NotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_transactions_skips_unrecognized() {
        let f = fixture();
        f.wallet.set_transactions(vec![
            json!({"timestamp": 2_000_000, "operationId": "a", "kind": "ln", "type": "receive", "outcome": "claimed", "amountMsats": 5000}),
            json!({"timestamp": 1_000_000, "operationId": "b", "kind": "mint", "type": "send", "outcome": "UserCanceledFailure"}),
            json!({"garbage": true}),
        ]);
        let outcome = f.caps.handle(Request::ListTransactions(ListTransactionsParams::default()), f.client.public_key()).await.unwrap();
        let txs = match outcome {
            Outcome::Reply(Ok(ResponseResult::Transactions(t))) => t.transactions,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].payment_hash, "a");
        assert_eq!(txs[0].state, TransactionState::Settled);
        assert_eq!(txs[0].created_at, 2000);
        assert_eq!(txs[1].state, TransactionState::Failed);
        assert_eq!(txs[1].direction, TransactionType::Outgoing);
    }

    #[test]
    fn test_filter_hides_unpaid_by_default() {
        let entry = TransactionEntry {
            timestamp: 5000,
            operation_id: "x".into(),
            kind: "ln".into(),
            direction: "receive".into(),
            outcome: None,
            invoice: None,
            amount_msats: None,
            fee: None,
        };
        let record = transaction_record(&entry);
        assert_eq!(record.state, TransactionState::Pending);
        assert!(!keep(&record, &ListTransactionsParams::default()));
        assert!(keep(&record, &ListTransactionsParams { unpaid: Some(true), ..Default::default() }));
        assert!(!keep(&record, &ListTransactionsParams { from: Some(6), unpaid: Some(true), ..Default::default() }));
    }
}
