//! Multisig wallet capability traits
//!
//! One multisig wallet exists per trade, jointly controlled by buyer, seller
//! and arbitrator. The protocol layer treats it as an opaque capability:
//! create/open, import partial key material, export, sign a payout, and
//! query/thaw/freeze outputs.

use std::sync::Arc;

use async_trait::async_trait;
use monero_dex_common::Result;
use serde::{Deserialize, Serialize};

use crate::outputs::{OutputQuery, WalletOutput};

/// Instruction to build the disputed payout from the escrow, produced by the
/// arbitrator from a dispute result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub trade_id: String,
    pub buyer_payout_address: String,
    pub seller_payout_address: String,
    pub buyer_amount: u64,
    pub seller_amount: u64,
}

/// An arbitrator-signed (but not yet fully signed) payout transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayoutTx {
    pub tx_id: String,
    pub signed_tx_hex: String,
}

/// Handle to one trade's multisig wallet. Short-lived: obtained from the
/// service, used, then released via `close_multisig_wallet`.
#[async_trait]
pub trait MultisigWallet: Send + Sync {
    /// Import a counterparty's updated multisig key material.
    async fn import_multisig_hex(&self, multisig_hex: &str) -> Result<()>;

    /// Export this wallet's current multisig key material.
    async fn get_multisig_hex(&self) -> Result<String>;

    /// Build and partially sign the payout transaction for a resolved
    /// dispute.
    async fn create_signed_payout_tx(&self, request: &PayoutRequest) -> Result<SignedPayoutTx>;
}

/// Per-node wallet service managing one multisig wallet per trade plus the
/// main wallet's frozen/reserved output set.
#[async_trait]
pub trait MultisigWalletService: Send + Sync {
    /// Open (or return the already-open) multisig wallet for a trade.
    async fn get_multisig_wallet(&self, trade_id: &str) -> Result<Arc<dyn MultisigWallet>>;

    /// Release the wallet handle, bounding native resource usage.
    async fn close_multisig_wallet(&self, trade_id: &str) -> Result<()>;

    async fn multisig_wallet_exists(&self, trade_id: &str) -> bool;

    /// Delete the trade's multisig wallet. Only called once a trade is
    /// provably unfunded or fully paid out.
    async fn delete_multisig_wallet(&self, trade_id: &str) -> Result<()>;

    /// Query outputs of the main wallet.
    async fn outputs(&self, query: OutputQuery) -> Result<Vec<WalletOutput>>;

    async fn freeze_output(&self, key_image: &str) -> Result<()>;

    async fn thaw_output(&self, key_image: &str) -> Result<()>;
}
