//! Haze NWC: Nostr Wallet Connect bridge and federation discovery for a Fedimint wallet.
//!
//! # Architecture
//!
//! ```text
//! NwcSession (composition root)
//!   │
//!   ├── RelayTransport (RelayPool over WebSockets, or MemoryRelay)
//!   │     └── Outbox (retries events no relay accepted)
//!   │
//!   ├── ServiceIdentity (mnemonic → m/44'/1237'/0'/0/0 → service keys)
//!   │
//!   ├── ConnectionRegistry (app name → client pubkey, persisted in a KvStore)
//!   │
//!   ├── RequestDispatcher (one per attached wallet)
//!   │     ├── EventCodec (NIP-04 encrypted kinds 23194 / 23195 / 23196)
//!   │     └── Capabilities → WalletSdk
//!   │
//!   └── DiscoveryEngine (kind 38173 adverts → FederationPreviewer)
//! ```
//!
//! # Methods
//!
//! | Method | Result |
//! |--------|--------|
//! | get_info | alias, pubkey, network, supported methods |
//! | get_balance | first balance value within 10s |
//! | make_invoice | pending incoming transaction, plus notifications |
//! | pay_invoice | preimage and fees once the payment settles |
//! | lookup_invoice | settled transaction once claimed |
//! | list_transactions | mapped operation log with NIP-47 filters |
//!
//! # Features
//!
//! - `native` - WebSocket relay pool, file store, logging setup and the CLI
//!
//! # Usage
//!
//! ```ignore
//! use haze_nwc::{NwcConfig, NwcSession, RelayPool, FileStore};
//!
//! let config = NwcConfig::from_env();
//! let pool = Arc::new(RelayPool::new(config.relays.clone()));
//! let store = Arc::new(FileStore::open(data_dir)?);
//! let session = NwcSession::new(config, pool, store, previewer);
//!
//! session.attach_wallet(wallet).await?;
//! let connection = session.generate_connection("Alby", None).await?;
//! println!("{}", connection.uri);
//! ```

pub mod config;
pub mod discovery;
pub mod identity;
pub mod mock;
pub mod nostr;
pub mod nwc;
pub mod registry;
pub mod sdk;
pub mod session;
pub mod store;

#[cfg(feature = "native")]
pub mod logging;
#[cfg(feature = "native")]
pub mod runtime;

pub use config::{NwcConfig, Settings, Timeouts};
pub use discovery::{DiscoveredFederation, DiscoveryEngine};
pub use identity::{KeyError, ServiceIdentity};
pub use crate::nostr::{EventFilter, MemoryRelay, Outbox, RelayState, RelayTransport};
pub use nwc::{ErrorCode, EventCodec, RequestDispatcher};
pub use registry::{ClientPairing, ConnectionRegistry, NwcConnection, NwcUri};
pub use sdk::{FederationPreview, FederationPreviewer, WalletSdk};
pub use session::{Lifecycle, NwcSession, SessionError};
pub use store::{FileStore, KvStore, MemoryStore};

#[cfg(feature = "native")]
pub use crate::nostr::RelayPool;
#[cfg(feature = "native")]
pub use runtime::{install_signal_handlers, Shutdown};
