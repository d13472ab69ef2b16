//! Wallet output bookkeeping
//!
//! Outputs backing an open offer or an in-flight trade are frozen in the
//! wallet so they cannot be double-spent. The trade manager reconciles the
//! frozen set against live reservations at startup.

use serde::{Deserialize, Serialize};

/// One spendable (or frozen) wallet output, identified by its key image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletOutput {
    pub key_image: String,
    pub amount: u64,
    pub frozen: bool,
    pub spent: bool,
}

/// Filter for querying wallet outputs, mirroring the wallet RPC's
/// query-by-filter shape. `None` fields match everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputQuery {
    pub is_frozen: Option<bool>,
    pub is_spent: Option<bool>,
}

impl OutputQuery {
    pub fn frozen_unspent() -> Self {
        Self {
            is_frozen: Some(true),
            is_spent: Some(false),
        }
    }

    pub fn matches(&self, output: &WalletOutput) -> bool {
        if let Some(frozen) = self.is_frozen {
            if output.frozen != frozen {
                return false;
            }
        }
        if let Some(spent) = self.is_spent {
            if output.spent != spent {
                return false;
            }
        }
        true
    }
}
