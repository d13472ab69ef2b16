//! Error type shared across the trade core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the trade and dispute subsystems.
///
/// Protocol violations (wrong sender, wrong role, wrong phase) are normally
/// logged and dropped at the call site rather than propagated; the variants
/// here cover the cases a caller can meaningfully react to.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no trade with id {0}")]
    TradeNotFound(String),

    #[error("offer {0} is not available")]
    OfferNotAvailable(String),

    #[error("dispute already open for trade {trade_id} and trader {trader_id}")]
    DisputeAlreadyOpen { trade_id: String, trader_id: u32 },

    #[error("no dispute found for trade {0}")]
    DisputeNotFound(String),

    #[error("sending dispute message failed: {0}")]
    DisputeMessageDeliveryFailed(String),

    #[error("trade phase may not move backwards: {current} -> {requested}")]
    PhaseRegression { current: String, requested: String },

    #[error("payout amounts do not match escrowed funds: buyer {buyer} + seller {seller} != escrowed {escrowed}")]
    PayoutMismatch {
        buyer: u64,
        seller: u64,
        escrowed: u64,
    },

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Non-empty-string guard used by every message handler before a trade
    /// id is looked up.
    pub fn require_non_empty(value: &str, what: &str) -> Result<()> {
        if value.trim().is_empty() {
            Err(Error::InvalidInput(format!("{} must not be empty", what)))
        } else {
            Ok(())
        }
    }
}
