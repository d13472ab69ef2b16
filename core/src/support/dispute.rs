//! Dispute records and results
//!
//! A dispute is a per-trader record of an arbitration case against a trade.
//! For a two-party trade the arbitrator keeps two mirrored records, one per
//! trader, linked by trade id; each side is closed explicitly by the
//! resolution step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use monero_dex_common::{AtomicAmount, PubKeyRing};

use crate::contract::Contract;
use crate::support::chat::ChatMessage;

/// Kind of support case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupportType {
    Arbitration,
    Mediation,
    Refund,
}

/// Lifecycle of a dispute record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeState {
    New,
    Open,
    Reopened,
    Closed,
}

/// Party a dispute resolution awards the trade amount to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeWinner {
    Buyer,
    Seller,
}

/// Why the dispute was raised / how it was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeReason {
    BuyerNotResponding,
    SellerNotResponding,
    TradeAlreadySettled,
    NoReply,
    Bank,
    OptionTrade,
    Scam,
    Other,
}

impl DisputeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeReason::BuyerNotResponding => "buyer not responding",
            DisputeReason::SellerNotResponding => "seller not responding",
            DisputeReason::TradeAlreadySettled => "trade already settled",
            DisputeReason::NoReply => "no reply",
            DisputeReason::Bank => "bank issue",
            DisputeReason::OptionTrade => "option trade",
            DisputeReason::Scam => "scam",
            DisputeReason::Other => "other",
        }
    }
}

/// Payout allocation decided by the arbitrator for one trader's dispute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeResult {
    pub trade_id: String,
    pub trader_id: u32,
    pub winner: DisputeWinner,
    pub reason: DisputeReason,
    pub summary_notes: String,
    pub buyer_payout_amount: AtomicAmount,
    pub seller_payout_amount: AtomicAmount,
    pub close_date: DateTime<Utc>,
    /// Arbitrator-signed textual summary of the decision.
    pub signed_summary: Option<String>,
    /// Arbitrator-signed payout tx, present only on the opener's result for
    /// non-mediation disputes.
    pub arbitrator_signed_payout_tx_hex: Option<String>,
    /// Arbitrator's multisig export after signing, for the traders to
    /// import before countersigning.
    pub arbitrator_updated_multisig_hex: Option<String>,
    /// Uid of the chat message that carried this result; reapplication with
    /// the same uid is a no-op.
    pub chat_message_uid: Option<String>,
}

impl DisputeResult {
    pub fn new(
        trade_id: impl Into<String>,
        trader_id: u32,
        winner: DisputeWinner,
        reason: DisputeReason,
        summary_notes: impl Into<String>,
        buyer_payout_amount: AtomicAmount,
        seller_payout_amount: AtomicAmount,
        close_date: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            trader_id,
            winner,
            reason,
            summary_notes: summary_notes.into(),
            buyer_payout_amount,
            seller_payout_amount,
            close_date,
            signed_summary: None,
            arbitrator_signed_payout_tx_hex: None,
            arbitrator_updated_multisig_hex: None,
            chat_message_uid: None,
        }
    }

    /// The payouts must account for every atomic unit held in escrow.
    pub fn payout_covers_escrow(&self, escrowed: AtomicAmount, protocol_fee: AtomicAmount) -> bool {
        self.buyer_payout_amount + self.seller_payout_amount == escrowed - protocol_fee
    }
}

/// Per-trader record of an arbitration case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    /// Globally unique id of this record.
    pub id: String,
    pub trade_id: String,
    /// Stable id of the trader this record belongs to.
    pub trader_id: u32,
    pub opening_date: DateTime<Utc>,
    /// True on the record of the trader who opened the dispute.
    pub is_opener: bool,
    pub dispute_opener_is_buyer: bool,
    pub dispute_opener_is_maker: bool,
    pub trader_pub_key_ring: PubKeyRing,
    pub agent_pub_key_ring: PubKeyRing,
    pub trade_date: DateTime<Utc>,
    pub trade_period_end: DateTime<Utc>,
    pub contract: Contract,
    pub contract_hash: String,
    pub contract_as_json: String,
    pub maker_contract_signature: Option<String>,
    pub taker_contract_signature: Option<String>,
    pub maker_payment_account_payload: Option<String>,
    pub taker_payment_account_payload: Option<String>,
    pub deposit_tx_id: Option<String>,
    pub payout_tx_id: Option<String>,
    pub donation_address_of_delayed_payout_tx: Option<String>,
    pub support_type: SupportType,
    pub state: DisputeState,
    pub is_support_ticket: bool,
    chat_messages: Vec<ChatMessage>,
    pub dispute_result: Option<DisputeResult>,
}

impl Dispute {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trade_id: impl Into<String>,
        trader_id: u32,
        is_opener: bool,
        dispute_opener_is_buyer: bool,
        dispute_opener_is_maker: bool,
        trader_pub_key_ring: PubKeyRing,
        agent_pub_key_ring: PubKeyRing,
        trade_date: DateTime<Utc>,
        trade_period_end: DateTime<Utc>,
        contract: Contract,
        contract_hash: String,
        contract_as_json: String,
        support_type: SupportType,
    ) -> Self {
        let trade_id = trade_id.into();
        Self {
            id: format!("{}_{}", trade_id, trader_id),
            trade_id,
            trader_id,
            opening_date: Utc::now(),
            is_opener,
            dispute_opener_is_buyer,
            dispute_opener_is_maker,
            trader_pub_key_ring,
            agent_pub_key_ring,
            trade_date,
            trade_period_end,
            contract,
            contract_hash,
            contract_as_json,
            maker_contract_signature: None,
            taker_contract_signature: None,
            maker_payment_account_payload: None,
            taker_payment_account_payload: None,
            deposit_tx_id: None,
            payout_tx_id: None,
            donation_address_of_delayed_payout_tx: None,
            support_type,
            state: DisputeState::New,
            is_support_ticket: false,
            chat_messages: Vec::new(),
            dispute_result: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == DisputeState::Closed
    }

    pub fn is_mediation_dispute(&self) -> bool {
        self.support_type == SupportType::Mediation
    }

    pub fn set_closed(&mut self) {
        self.state = DisputeState::Closed;
    }

    pub fn chat_messages(&self) -> &[ChatMessage] {
        &self.chat_messages
    }

    /// Append a chat message, dropping duplicates by uid.
    pub fn add_chat_message(&mut self, message: ChatMessage) -> bool {
        if self.chat_messages.iter().any(|m| m.uid == message.uid) {
            warn!(
                trade_id = %self.trade_id,
                uid = %message.uid,
                "chat message already stored, ignoring duplicate"
            );
            return false;
        }
        self.chat_messages.push(message);
        true
    }

    pub fn chat_message_mut(&mut self, uid: &str) -> Option<&mut ChatMessage> {
        self.chat_messages.iter_mut().find(|m| m.uid == uid)
    }

    /// The pub key ring of the non-opening trader, resolved from the
    /// contract.
    pub fn peer_pub_key_ring(&self) -> &PubKeyRing {
        if self.dispute_opener_is_buyer {
            &self.contract.seller_pub_key_ring
        } else {
            &self.contract.buyer_pub_key_ring
        }
    }

    pub fn opener_pub_key_ring(&self) -> &PubKeyRing {
        if self.dispute_opener_is_buyer {
            &self.contract.buyer_pub_key_ring
        } else {
            &self.contract.seller_pub_key_ring
        }
    }

    pub fn short_trade_id(&self) -> &str {
        &self.trade_id[..self.trade_id.len().min(8)]
    }
}
