//! In-flight invoice table: invoice string -> operation tracked by the SDK
//!
//! Entries expire with the invoice. Expired entries are purged on every
//! insert and lookup, so the table stays bounded by the live invoice count.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Seconds an invoice stays payable when the request sets no expiry
pub const DEFAULT_INVOICE_EXPIRY: u64 = 3600;

/// Longest expiry a client may request (one year)
pub const MAX_INVOICE_EXPIRY: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedInvoice {
    pub operation_id: String,
    pub amount: u64,
    pub description: String,
    pub description_hash: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Default)]
pub struct InFlightInvoices {
    entries: Mutex<HashMap<String, (TrackedInvoice, Instant)>>,
}

impl InFlightInvoices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, invoice: impl Into<String>, tracked: TrackedInvoice, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, (_, deadline)| *deadline > now);
        let deadline = now.checked_add(ttl).unwrap_or_else(|| now + Duration::from_secs(MAX_INVOICE_EXPIRY));
        entries.insert(invoice.into(), (tracked, deadline));
    }

    pub fn get(&self, invoice: &str) -> Option<TrackedInvoice> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, (_, deadline)| *deadline > now);
        entries.get(invoice).map(|(tracked, _)| tracked.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
