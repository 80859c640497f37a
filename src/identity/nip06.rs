//! NIP-06 - Nostr keys from a BIP39 mnemonic
//!
//! The wallet's recovery words are turned into a BIP32 master key and walked
//! down the Nostr coin type so the wallet-connect identity is stable across
//! reloads and devices that share the same seed.
//!
//! Reference: https://github.com/nostr-protocol/nips/blob/master/06.md

use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::secp256k1::Secp256k1;
use std::str::FromStr;
use zeroize::Zeroizing;

use super::KeyError;

/// SLIP-44 coin type registered for Nostr
pub const COIN_TYPE_NOSTR: u32 = 1237;

/// Derivation path for the first Nostr account: m/44'/1237'/0'/0/0
pub fn service_path() -> String {
    format!("m/44'/{}'/0'/0/0", COIN_TYPE_NOSTR)
}

/// Derive the 32-byte service secret key from mnemonic words.
///
/// Same words always yield the same key. Fails with [`KeyError::InvalidSeed`]
/// when the words do not form a BIP39 mnemonic and with
/// [`KeyError::DerivationFailure`] when the path yields no private key.
pub fn derive_service_key<S: AsRef<str>>(words: &[S]) -> Result<[u8; 32], KeyError> {
    if words.is_empty() {
        return Err(KeyError::InvalidSeed("mnemonic is empty".into()));
    }

    let phrase = Zeroizing::new(
        words.iter().map(|w| w.as_ref().trim()).collect::<Vec<_>>().join(" "),
    );
    let mnemonic = Mnemonic::parse_normalized(&phrase)
        .map_err(|e| KeyError::InvalidSeed(e.to_string()))?;
    let seed = Zeroizing::new(mnemonic.to_seed(""));

    let secp = Secp256k1::new();
    let master = Xpriv::new_master(bitcoin::Network::Bitcoin, &seed[..])
        .map_err(|e| KeyError::DerivationFailure(e.to_string()))?;

    let path = DerivationPath::from_str(&service_path())
        .map_err(|e| KeyError::DerivationFailure(e.to_string()))?;
    let child = master
        .derive_priv(&secp, &path)
        .map_err(|e| KeyError::DerivationFailure(e.to_string()))?;

    Ok(child.private_key.secret_bytes())
}
