//! Identity - Service keys derived from the wallet seed, ephemeral keys for pairing.
//!
//! The service secret lives only in memory for the session; it is recreated
//! from the mnemonic whenever a wallet is attached.

mod nip06;

pub use nip06::{derive_service_key, service_path, COIN_TYPE_NOSTR};

use nostr::{Keys, PublicKey, SecretKey};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),
    #[error("Derivation failed: {0}")]
    DerivationFailure(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Wallet-connect service identity. One per attached wallet.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub keys: Keys,
    pub pubkey_hex: String,
}

impl ServiceIdentity {
    pub fn from_secret(secret: &[u8; 32]) -> Result<Self, KeyError> {
        let sk = SecretKey::from_slice(secret).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let keys = Keys::new(sk);
        let pubkey_hex = keys.public_key().to_hex();
        Ok(Self { keys, pubkey_hex })
    }

    pub fn from_mnemonic<S: AsRef<str>>(words: &[S]) -> Result<Self, KeyError> {
        let secret = zeroize::Zeroizing::new(derive_service_key(words)?);
        Self::from_secret(&secret)
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }
}

/// Derive the x-only public key for a hex secret key.
pub fn derive_public_key(secret_hex: &str) -> Result<PublicKey, KeyError> {
    let sk = SecretKey::from_hex(secret_hex).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
    Ok(Keys::new(sk).public_key())
}

/// Fresh client keypair for a new pairing. Never derived, never reused.
pub fn ephemeral_keys() -> Keys {
    Keys::generate()
}

pub fn secret_hex(keys: &Keys) -> String {
    hex::encode(keys.secret_key().secret_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn words() -> Vec<&'static str> {
        TEST_MNEMONIC.split_whitespace().collect()
    }

    #[test]
    fn test_identity_from_mnemonic() {
        let identity = ServiceIdentity::from_mnemonic(&words()).expect("should derive");
        assert_eq!(identity.pubkey_hex.len(), 64);
        assert_eq!(identity.public_key().to_hex(), identity.pubkey_hex);
    }

    #[test]
    fn test_identity_deterministic() {
        let id1 = ServiceIdentity::from_mnemonic(&words()).expect("should derive");
        let id2 = ServiceIdentity::from_mnemonic(&words()).expect("should derive");
        assert_eq!(id1.pubkey_hex, id2.pubkey_hex);
    }

    #[test]
    fn test_derive_public_key_matches_keys() {
        let keys = ephemeral_keys();
        let pk = derive_public_key(&secret_hex(&keys)).expect("valid secret");
        assert_eq!(pk, keys.public_key());
    }

    #[test]
    fn test_derive_public_key_rejects_garbage() {
        assert!(matches!(derive_public_key("zz"), Err(KeyError::InvalidKey(_))));
    }

    #[test]
    fn test_ephemeral_keys_are_fresh() {
        let a = ephemeral_keys();
        let b = ephemeral_keys();
        assert_ne!(a.public_key(), b.public_key());
    }
}
