//! Per-party identity material
//!
//! Every node carries a key ring with an ed25519 signature keypair and an
//! encryption public key. The serializable public half (`PubKeyRing`) is
//! what travels in contracts, disputes and network messages; peers are
//! addressed and authenticated by it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Serializable public identity of one party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyRing {
    /// Hex-encoded ed25519 verifying key.
    pub signature_pub_key: String,
    /// Hex-encoded encryption public key (opaque to this crate).
    pub encryption_pub_key: String,
}

impl PubKeyRing {
    /// Stable numeric id derived from the signature key, used to key
    /// disputes and chat messages per trader.
    pub fn trader_id(&self) -> u32 {
        let digest = Sha256::digest(self.signature_pub_key.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        let bytes = hex::decode(&self.signature_pub_key)
            .map_err(|e| Error::Crypto(format!("invalid signature pub key hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("signature pub key must be 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| Error::Crypto(format!("invalid signature pub key: {}", e)))
    }

    /// Verify a hex-encoded ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> Result<()> {
        let key = self.verifying_key()?;
        let sig_bytes = hex::decode(signature_hex)
            .map_err(|e| Error::Crypto(format!("invalid signature hex: {}", e)))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| Error::Crypto("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(message, &signature)
            .map_err(|e| Error::Crypto(format!("signature verification failed: {}", e)))
    }
}

/// Full key ring held by the local node. The signing key never leaves this
/// struct; only the `PubKeyRing` half is shared.
pub struct KeyRing {
    signing_key: SigningKey,
    pub_key_ring: PubKeyRing,
}

impl KeyRing {
    /// Generate a fresh key ring.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_seed(secret)
    }

    /// Deterministic construction from a 32-byte seed (used by tests).
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        // The encryption key is derived, not random, so a seed fully
        // determines the identity.
        let encryption_pub_key = hex::encode(Sha256::digest(signing_key.verifying_key().as_bytes()));
        let pub_key_ring = PubKeyRing {
            signature_pub_key: hex::encode(signing_key.verifying_key().to_bytes()),
            encryption_pub_key,
        };
        Self {
            signing_key,
            pub_key_ring,
        }
    }

    pub fn pub_key_ring(&self) -> &PubKeyRing {
        &self.pub_key_ring
    }

    /// Sign `message`, returning the hex-encoded signature.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the signing key.
        f.debug_struct("KeyRing")
            .field("pub_key_ring", &self.pub_key_ring)
            .finish()
    }
}

/// Sha-256 over `bytes`, hex encoded. Used for contract hashes and payment
/// account payload hashes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
