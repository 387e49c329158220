//! Deterministic per-user key derivation.
//!
//! Every user gets exactly one key, derived from their master seed along the
//! fixed path `m/purpose'/coin_type'/0'/0/0`. Derivation is pure: the same
//! seed always yields the same key, address and script, so addresses can be
//! rebuilt from stored seed material at any time.

use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network, PrivateKey, PublicKey, ScriptBuf};
use tracing::debug;

use crate::error::{Result, WalletError};

/// Identity a key belongs to, normalized as `platform:handle`.
pub type UserId = String;

/// Shortest master seed accepted, in bytes.
const MIN_SEED_LEN: usize = 16;
/// Longest master seed accepted, in bytes.
const MAX_SEED_LEN: usize = 64;

/// Parameters fixing the derivation path and address network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivationParams {
    /// Network addresses are rendered for.
    pub network: Network,
    /// BIP-44 purpose field (hardened).
    pub purpose: u32,
    /// BIP-44 coin type field (hardened).
    pub coin_type: u32,
}

impl Default for DerivationParams {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            purpose: 44,
            coin_type: 0,
        }
    }
}

/// One user's signing key and the artifacts derived from it.
#[derive(Clone)]
pub struct WalletKey {
    user_id: UserId,
    private_key: PrivateKey,
    public_key: PublicKey,
    address: Address,
    script_pubkey: ScriptBuf,
}

impl WalletKey {
    /// The user this key belongs to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The user's deposit address.
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// Script all of this user's outputs pay to.
    #[must_use]
    pub const fn script_pubkey(&self) -> &ScriptBuf {
        &self.script_pubkey
    }

    /// Public half of the signing key.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Signing key. Kept crate-private; only the transaction builder signs.
    pub(crate) const fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}

impl fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKey")
            .field("user_id", &self.user_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Derives one fixed-path key per user.
pub struct KeyDerivation {
    secp: Secp256k1<All>,
    network: Network,
    path: DerivationPath,
}

impl KeyDerivation {
    /// Build a derivation context for the given parameters.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::FatalInit`] when `purpose` or `coin_type` is
    /// out of range for a hardened path component.
    pub fn new(params: DerivationParams) -> Result<Self> {
        let hardened = |index: u32| {
            ChildNumber::from_hardened_idx(index).map_err(|err| {
                WalletError::fatal_init(format!("hardened index {index} out of range: {err}"))
            })
        };
        let normal = |index: u32| {
            ChildNumber::from_normal_idx(index).map_err(|err| {
                WalletError::fatal_init(format!("child index {index} out of range: {err}"))
            })
        };
        let path = DerivationPath::from(vec![
            hardened(params.purpose)?,
            hardened(params.coin_type)?,
            hardened(0)?,
            normal(0)?,
            normal(0)?,
        ]);
        Ok(Self {
            secp: Secp256k1::new(),
            network: params.network,
            path,
        })
    }

    /// Network addresses are rendered for.
    #[must_use]
    pub const fn network(&self) -> Network {
        self.network
    }

    /// Derive a user's key from their master seed.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::FatalInit`] when the seed is malformed. A
    /// wallet must never come up with a partial key set, so callers treat
    /// this as unrecoverable.
    pub fn derive(&self, user_id: &str, seed: &[u8]) -> Result<WalletKey> {
        if seed.len() < MIN_SEED_LEN || seed.len() > MAX_SEED_LEN {
            return Err(WalletError::fatal_init(format!(
                "seed for {user_id} is {} bytes, expected {MIN_SEED_LEN}..={MAX_SEED_LEN}",
                seed.len()
            )));
        }
        let master = Xpriv::new_master(self.network, seed)
            .map_err(|err| WalletError::fatal_init(format!("master key for {user_id}: {err}")))?;
        let child = master
            .derive_priv(&self.secp, &self.path)
            .map_err(|err| WalletError::fatal_init(format!("derivation for {user_id}: {err}")))?;
        let private_key = child.to_priv();
        let public_key = private_key.public_key(&self.secp);
        let address = Address::p2pkh(public_key.pubkey_hash(), self.network);
        let script_pubkey = address.script_pubkey();
        debug!(user = %user_id, address = %address, "key derived");
        Ok(WalletKey {
            user_id: user_id.to_string(),
            private_key,
            public_key,
            address,
            script_pubkey,
        })
    }
}

impl fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDerivation")
            .field("network", &self.network)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derivation() -> KeyDerivation {
        KeyDerivation::new(DerivationParams::default()).unwrap()
    }

    #[test]
    fn same_seed_same_address() {
        let kd = derivation();
        let a = kd.derive("cli:alice", &[7u8; 32]).unwrap();
        let b = kd.derive("cli:alice", &[7u8; 32]).unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(a.script_pubkey(), b.script_pubkey());
    }

    #[test]
    fn different_seeds_different_addresses() {
        let kd = derivation();
        let a = kd.derive("cli:alice", &[7u8; 32]).unwrap();
        let b = kd.derive("cli:bob", &[9u8; 32]).unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn mainnet_addresses_are_p2pkh() {
        let kd = derivation();
        let key = kd.derive("cli:alice", &[7u8; 32]).unwrap();
        assert!(key.address().to_string().starts_with('1'));
        assert!(key.script_pubkey().is_p2pkh());
    }

    #[test]
    fn short_seed_is_fatal() {
        let kd = derivation();
        let err = kd.derive("cli:alice", &[1u8; 8]).unwrap_err();
        assert!(matches!(err, WalletError::FatalInit(_)));
    }

    #[test]
    fn oversized_seed_is_fatal() {
        let kd = derivation();
        let err = kd.derive("cli:alice", &[1u8; 65]).unwrap_err();
        assert!(matches!(err, WalletError::FatalInit(_)));
    }

    #[test]
    fn out_of_range_purpose_is_fatal() {
        let err = KeyDerivation::new(DerivationParams {
            purpose: 1 << 31,
            ..DerivationParams::default()
        })
        .unwrap_err();
        assert!(matches!(err, WalletError::FatalInit(_)));
    }

    #[test]
    fn debug_redacts_key_material() {
        let kd = derivation();
        let key = kd.derive("cli:alice", &[7u8; 32]).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("cli:alice"));
        assert!(!rendered.contains(&key.private_key().to_wif()));
    }
}
