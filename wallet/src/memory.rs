//! In-memory wallet service
//!
//! Deterministic, in-process implementation of the multisig wallet
//! capability. Used by the offline test suites and by operation without a
//! wallet RPC attached. Imported key material and signing requests are
//! recorded so tests can assert on them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use monero_dex_common::{Error, Result};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::multisig::{MultisigWallet, MultisigWalletService, PayoutRequest, SignedPayoutTx};
use crate::outputs::{OutputQuery, WalletOutput};

#[derive(Default)]
struct WalletState {
    imported_hex: Vec<String>,
    export_counter: u64,
    open: bool,
}

/// One simulated multisig wallet.
pub struct InMemoryMultisigWallet {
    trade_id: String,
    state: Mutex<WalletState>,
}

#[async_trait]
impl MultisigWallet for InMemoryMultisigWallet {
    async fn import_multisig_hex(&self, multisig_hex: &str) -> Result<()> {
        if multisig_hex.is_empty() {
            return Err(Error::Wallet("empty multisig hex".to_string()));
        }
        let mut state = self.state.lock().await;
        state.imported_hex.push(multisig_hex.to_string());
        debug!(trade_id = %self.trade_id, "imported multisig hex");
        Ok(())
    }

    async fn get_multisig_hex(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        state.export_counter += 1;
        // Derived from trade id and counter so each export is distinct but
        // reproducible.
        let digest = Sha256::digest(format!("{}:{}", self.trade_id, state.export_counter));
        Ok(hex::encode(digest))
    }

    async fn create_signed_payout_tx(&self, request: &PayoutRequest) -> Result<SignedPayoutTx> {
        if request.buyer_amount == 0 && request.seller_amount == 0 {
            return Err(Error::Wallet("payout with no outputs".to_string()));
        }
        let digest = Sha256::digest(
            format!(
                "{}:{}:{}:{}:{}",
                request.trade_id,
                request.buyer_payout_address,
                request.seller_payout_address,
                request.buyer_amount,
                request.seller_amount
            )
            .as_bytes(),
        );
        let tx_id = hex::encode(&digest[..16]);
        Ok(SignedPayoutTx {
            tx_id,
            signed_tx_hex: hex::encode(digest),
        })
    }
}

impl InMemoryMultisigWallet {
    /// Multisig hex strings imported into this wallet, in arrival order.
    pub async fn imported_hex(&self) -> Vec<String> {
        self.state.lock().await.imported_hex.clone()
    }
}

/// In-memory implementation of [`MultisigWalletService`].
#[derive(Default)]
pub struct InMemoryWalletService {
    wallets: Mutex<HashMap<String, Arc<InMemoryMultisigWallet>>>,
    outputs: Mutex<HashMap<String, WalletOutput>>,
}

impl InMemoryWalletService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the main wallet with an output (tests).
    pub async fn add_output(&self, key_image: &str, amount: u64, frozen: bool) {
        self.outputs.lock().await.insert(
            key_image.to_string(),
            WalletOutput {
                key_image: key_image.to_string(),
                amount,
                frozen,
                spent: false,
            },
        );
    }

    /// Typed handle to a trade's in-memory wallet (tests).
    pub async fn wallet(&self, trade_id: &str) -> Option<Arc<InMemoryMultisigWallet>> {
        self.wallets.lock().await.get(trade_id).cloned()
    }

    pub async fn is_open(&self, trade_id: &str) -> bool {
        match self.wallets.lock().await.get(trade_id) {
            Some(wallet) => wallet.state.lock().await.open,
            None => false,
        }
    }
}

#[async_trait]
impl MultisigWalletService for InMemoryWalletService {
    async fn get_multisig_wallet(&self, trade_id: &str) -> Result<Arc<dyn MultisigWallet>> {
        Error::require_non_empty(trade_id, "trade id")?;
        let mut wallets = self.wallets.lock().await;
        let wallet = wallets
            .entry(trade_id.to_string())
            .or_insert_with(|| {
                Arc::new(InMemoryMultisigWallet {
                    trade_id: trade_id.to_string(),
                    state: Mutex::new(WalletState::default()),
                })
            })
            .clone();
        wallet.state.lock().await.open = true;
        Ok(wallet)
    }

    async fn close_multisig_wallet(&self, trade_id: &str) -> Result<()> {
        let wallets = self.wallets.lock().await;
        match wallets.get(trade_id) {
            Some(wallet) => {
                wallet.state.lock().await.open = false;
                Ok(())
            }
            None => {
                warn!(trade_id, "close requested for unknown multisig wallet");
                Ok(())
            }
        }
    }

    async fn multisig_wallet_exists(&self, trade_id: &str) -> bool {
        self.wallets.lock().await.contains_key(trade_id)
    }

    async fn delete_multisig_wallet(&self, trade_id: &str) -> Result<()> {
        if self.wallets.lock().await.remove(trade_id).is_none() {
            return Err(Error::Wallet(format!(
                "multisig wallet for trade {} does not exist",
                trade_id
            )));
        }
        Ok(())
    }

    async fn outputs(&self, query: OutputQuery) -> Result<Vec<WalletOutput>> {
        let outputs = self.outputs.lock().await;
        Ok(outputs.values().filter(|o| query.matches(o)).cloned().collect())
    }

    async fn freeze_output(&self, key_image: &str) -> Result<()> {
        let mut outputs = self.outputs.lock().await;
        match outputs.get_mut(key_image) {
            Some(output) => {
                output.frozen = true;
                Ok(())
            }
            None => Err(Error::Wallet(format!("unknown output {}", key_image))),
        }
    }

    async fn thaw_output(&self, key_image: &str) -> Result<()> {
        let mut outputs = self.outputs.lock().await;
        match outputs.get_mut(key_image) {
            Some(output) => {
                output.frozen = false;
                Ok(())
            }
            None => {
                // Thawing an unknown output is tolerated: reconciliation may
                // race a spend.
                warn!(key_image, "thaw requested for unknown output");
                Ok(())
            }
        }
    }
}
