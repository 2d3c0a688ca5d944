//! Key management for the custodial funding path
//!
//! The platform signing key is deliberately scoped behind the
//! [`TradeSigner`] capability and passed into the funding coordinator,
//! never reached through a global. Swapping in a hardware-backed signer
//! means implementing this trait, nothing else.

use crate::{EscrowResult, error::EscrowError};
use async_trait::async_trait;
use secp256k1::{
    Keypair, Message, Secp256k1, SecretKey,
    hashes::{Hash, sha256},
    rand,
};
use std::str::FromStr;

/// Capability to authorize ledger submissions on the platform's behalf
#[async_trait]
pub trait TradeSigner: Send + Sync {
    /// The ledger identity submissions are made under
    fn address(&self) -> &str;

    /// Sign an arbitrary payload with the platform key
    async fn sign(&self, payload: &[u8]) -> EscrowResult<Vec<u8>>;
}

/// Process-local signer holding a secp256k1 key in memory.
///
/// Fallback for deployments without an HSM; the key never leaves this
/// struct and call sites only ever see the [`TradeSigner`] trait.
pub struct PlatformKeySigner {
    secp: Secp256k1<secp256k1::All>,
    secret_key: SecretKey,
    address: String,
}

impl PlatformKeySigner {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let address = format!("0x{}", keypair.public_key());
        Self {
            secp,
            secret_key,
            address,
        }
    }

    /// Generate a throwaway key (tests and local development).
    pub fn random() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, _) = secp.generate_keypair(&mut rand::thread_rng());
        Self::new(secret_key)
    }

    pub fn from_hex(hex_key: &str) -> EscrowResult<Self> {
        let secret_key = SecretKey::from_str(hex_key.trim_start_matches("0x"))
            .map_err(|e| EscrowError::signer(format!("invalid platform key: {e}")))?;
        Ok(Self::new(secret_key))
    }
}

#[async_trait]
impl TradeSigner for PlatformKeySigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, payload: &[u8]) -> EscrowResult<Vec<u8>> {
        let digest = sha256::Hash::hash(payload);
        let message = Message::from_digest(digest.to_byte_array());
        let signature = self.secp.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact().to_vec())
    }
}
