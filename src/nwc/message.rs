//! Wallet-connect message model (NIP-47 shapes)
//!
//! Requests are parsed into a closed set of methods with typed params.
//! Responses and notifications serialize to the JSON the client apps expect.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Methods this wallet answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetInfo,
    GetBalance,
    MakeInvoice,
    PayInvoice,
    LookupInvoice,
    ListTransactions,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::GetInfo,
        Method::PayInvoice,
        Method::MakeInvoice,
        Method::GetBalance,
        Method::ListTransactions,
        Method::LookupInvoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetInfo => "get_info",
            Method::GetBalance => "get_balance",
            Method::MakeInvoice => "make_invoice",
            Method::PayInvoice => "pay_invoice",
            Method::LookupInvoice => "lookup_invoice",
            Method::ListTransactions => "list_transactions",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == value)
    }
}

pub const PAYMENT_RECEIVED: &str = "payment_received";
pub const PAYMENT_SENT: &str = "payment_sent";

/// Notification types the wallet can emit
pub const NOTIFICATION_TYPES: [&str; 2] = [PAYMENT_SENT, PAYMENT_RECEIVED];

/// Capability list for the info event: methods, then notification support
pub fn advertised_capabilities() -> Vec<&'static str> {
    let mut caps: Vec<&'static str> = Method::ALL.iter().map(|m| m.as_str()).collect();
    caps.push("notifications");
    caps.extend(NOTIFICATION_TYPES);
    caps
}

/// Decrypted request before method dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self { id: Some(id.into()), method: method.into(), params }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeInvoiceParams {
    /// Millisatoshis
    pub amount: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_hash: Option<String>,
    /// Seconds until the invoice expires
    #[serde(default)]
    pub expiry: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayInvoiceParams {
    pub invoice: String,
    #[serde(default)]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LookupInvoiceParams {
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub payment_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListTransactionsParams {
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub until: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub unpaid: Option<bool>,
    #[serde(default, rename = "type")]
    pub direction: Option<TransactionType>,
}

/// A request with its params validated against the method
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetInfo,
    GetBalance,
    MakeInvoice(MakeInvoiceParams),
    PayInvoice(PayInvoiceParams),
    LookupInvoice(LookupInvoiceParams),
    ListTransactions(ListTransactionsParams),
}

impl Request {
    /// Parse params for a known method. Missing params count as `{}`.
    pub fn from_parts(method: Method, params: Value) -> Result<Self, serde_json::Error> {
        let params = if params.is_null() { json!({}) } else { params };
        Ok(match method {
            Method::GetInfo => Request::GetInfo,
            Method::GetBalance => Request::GetBalance,
            Method::MakeInvoice => Request::MakeInvoice(serde_json::from_value(params)?),
            Method::PayInvoice => Request::PayInvoice(serde_json::from_value(params)?),
            Method::LookupInvoice => Request::LookupInvoice(serde_json::from_value(params)?),
            Method::ListTransactions => Request::ListTransactions(serde_json::from_value(params)?),
        })
    }

    pub fn method(&self) -> Method {
        match self {
            Request::GetInfo => Method::GetInfo,
            Request::GetBalance => Method::GetBalance,
            Request::MakeInvoice(_) => Method::MakeInvoice,
            Request::PayInvoice(_) => Method::PayInvoice,
            Request::LookupInvoice(_) => Method::LookupInvoice,
            Request::ListTransactions(_) => Method::ListTransactions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MethodNotFound,
    ProcessingError,
    InvalidParams,
    BalanceError,
    NotFound,
    InvalidInvoice,
    PaymentCancelled,
    PaymentFailed,
    SubscriptionError,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Settled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "type")]
    pub direction: TransactionType,
    pub state: TransactionState,
    pub invoice: Option<String>,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    pub preimage: Option<String>,
    pub payment_hash: String,
    /// Millisatoshis
    pub amount: u64,
    pub fees_paid: u64,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub settled_at: Option<i64>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoResult {
    pub alias: String,
    pub color: String,
    pub pubkey: String,
    pub network: String,
    pub block_height: u32,
    pub block_hash: String,
    pub methods: Vec<String>,
    pub notifications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceResult {
    /// Millisatoshis
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayResult {
    pub preimage: String,
    pub fees_paid: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionsResult {
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseResult {
    Info(InfoResult),
    Balance(BalanceResult),
    Payment(PayResult),
    Transaction(TransactionRecord),
    Transactions(TransactionsResult),
}

/// Response envelope, correlated to the request by `id`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub result_type: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn new(id: impl Into<String>, result_type: impl Into<String>, outcome: Result<ResponseResult, ErrorBody>) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Self { result_type: result_type.into(), id: id.into(), result, error }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Settled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
    #[serde(rename = "type")]
    pub direction: TransactionType,
    pub status: PaymentStatus,
    pub invoice: String,
    pub payment_hash: String,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_type: String,
    pub notification: PaymentNotification,
}

impl Notification {
    pub fn payment_received(notification: PaymentNotification) -> Self {
        Self { notification_type: PAYMENT_RECEIVED.into(), notification }
    }
}
