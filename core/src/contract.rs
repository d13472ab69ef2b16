//! Trade contract
//!
//! Immutable snapshot of the trade terms, signed by both traders. The hash
//! and both signatures are computed over the exact canonical JSON byte form;
//! any re-serialization must reproduce those bytes, so the canonical form is
//! produced once and carried alongside the struct.

use monero_dex_common::crypto::sha256_hex;
use monero_dex_common::{AtomicAmount, Error, KeyRing, NodeAddress, PubKeyRing, Result};
use serde::{Deserialize, Serialize};

use crate::offer::OfferDirection;

/// Terms of one trade, agreed by maker and taker and countersigned by both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub offer_id: String,
    pub offer_direction: OfferDirection,
    pub currency_code: String,
    pub trade_amount: AtomicAmount,
    pub trade_price: u64,
    pub buyer_security_deposit: AtomicAmount,
    pub seller_security_deposit: AtomicAmount,
    pub buyer_node_address: NodeAddress,
    pub seller_node_address: NodeAddress,
    pub buyer_pub_key_ring: PubKeyRing,
    pub seller_pub_key_ring: PubKeyRing,
    pub buyer_payout_address: String,
    pub seller_payout_address: String,
    pub arbitrator_node_address: NodeAddress,
    pub maker_payment_account_payload_hash: String,
    pub taker_payment_account_payload_hash: String,
    pub use_market_based_price: bool,
    pub market_price_margin_pct: f64,
}

impl Contract {
    /// Canonical serialized byte form. Signatures and the contract hash are
    /// defined over these bytes.
    pub fn to_canonical_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Internal(format!("failed to serialize contract: {}", e)))
    }

    /// Content hash identifying this contract.
    pub fn hash(&self) -> Result<String> {
        Ok(sha256_hex(self.to_canonical_json()?.as_bytes()))
    }

    /// Sign the canonical form with the local key ring.
    pub fn sign(&self, key_ring: &KeyRing) -> Result<String> {
        Ok(key_ring.sign(self.to_canonical_json()?.as_bytes()))
    }

    /// Verify a party's signature over the canonical form.
    pub fn verify_signature(&self, signer: &PubKeyRing, signature_hex: &str) -> Result<()> {
        signer.verify(self.to_canonical_json()?.as_bytes(), signature_hex)
    }

    pub fn total_escrow_amount(&self) -> AtomicAmount {
        self.trade_amount + self.buyer_security_deposit + self.seller_security_deposit
    }

    /// The amount of counter currency this trade moves, in the currency's
    /// smallest unit. Used by the option-trade advisory.
    pub fn trade_volume(&self) -> u128 {
        self.trade_amount as u128 * self.trade_price as u128
            / monero_dex_common::types::XMR_ATOMIC_UNITS as u128
    }
}
