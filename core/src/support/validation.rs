//! Structural validation of incoming disputes
//!
//! Validation failures are recorded for operator inspection and never abort
//! dispute processing; a malformed dispute is still better handled than
//! dropped.

use monero_dex_common::crypto::sha256_hex;
use monero_dex_common::{Error, NodeAddress, Result};

use crate::support::dispute::Dispute;

/// One recorded validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationException {
    pub dispute_id: String,
    pub trade_id: String,
    pub message: String,
}

impl ValidationException {
    pub fn new(dispute: &Dispute, message: impl Into<String>) -> Self {
        Self {
            dispute_id: dispute.id.clone(),
            trade_id: dispute.trade_id.clone(),
            message: message.into(),
        }
    }
}

/// The payment account payloads carried by the dispute must hash to the
/// values both traders signed into the contract.
pub fn validate_payment_account_payload(dispute: &Dispute) -> Result<()> {
    let checks = [
        (
            "maker",
            &dispute.maker_payment_account_payload,
            &dispute.contract.maker_payment_account_payload_hash,
        ),
        (
            "taker",
            &dispute.taker_payment_account_payload,
            &dispute.contract.taker_payment_account_payload_hash,
        ),
    ];
    for (who, payload, expected_hash) in checks {
        let Some(payload) = payload else {
            continue;
        };
        let actual = sha256_hex(payload.as_bytes());
        if &actual != expected_hash {
            return Err(Error::InvalidInput(format!(
                "{} payment account payload does not match the hash in the contract",
                who
            )));
        }
    }
    Ok(())
}

/// Node addresses inside the contract must be well formed.
pub fn validate_node_address(address: &NodeAddress) -> Result<()> {
    if address.host_name.trim().is_empty() {
        return Err(Error::InvalidInput("node address has empty host".to_string()));
    }
    if address.port == 0 {
        return Err(Error::InvalidInput(format!(
            "node address {} has port 0",
            address.host_name
        )));
    }
    Ok(())
}

/// If the dispute references a delayed-payout donation address it must be
/// one of the allowed addresses.
pub fn validate_donation_address(dispute: &Dispute, allowed: &[String]) -> Result<()> {
    let Some(address) = &dispute.donation_address_of_delayed_payout_tx else {
        return Ok(());
    };
    if !allowed.iter().any(|a| a == address) {
        return Err(Error::InvalidInput(format!(
            "donation address {} is not an allowed address",
            address
        )));
    }
    Ok(())
}

/// Run every structural check over a dispute, collecting failures.
pub fn validate_dispute(dispute: &Dispute, allowed_donation_addresses: &[String]) -> Vec<ValidationException> {
    let mut exceptions = Vec::new();
    if let Err(e) = validate_payment_account_payload(dispute) {
        exceptions.push(ValidationException::new(dispute, e.to_string()));
    }
    if let Err(e) = validate_donation_address(dispute, allowed_donation_addresses) {
        exceptions.push(ValidationException::new(dispute, e.to_string()));
    }
    for address in [
        &dispute.contract.buyer_node_address,
        &dispute.contract.seller_node_address,
    ] {
        if let Err(e) = validate_node_address(address) {
            exceptions.push(ValidationException::new(dispute, e.to_string()));
        }
    }
    exceptions
}
