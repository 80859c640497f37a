//! Wallet Connect - NIP-47 request handling over Nostr
//!
//! ```text
//! client app --kind 23194 (encrypted)--> relay --> RequestDispatcher
//!                                                     |
//!                                              Capabilities --> WalletSdk
//!                                                     |
//! client app <--kind 23195 / 23196 (encrypted)-- relay <--+
//! ```

pub mod codec;
pub mod dispatcher;
pub mod handlers;
pub mod invoices;
pub mod message;

pub use codec::{CodecError, EventCodec};
pub use dispatcher::{DispatcherState, RequestDispatcher, RequestPhase};
pub use handlers::{Capabilities, Notifier, Outcome};
pub use invoices::{InFlightInvoices, TrackedInvoice};
pub use message::{ErrorBody, ErrorCode, Method, Request, RequestEnvelope, Response, ResponseResult};
