//! Logical network messages
//!
//! Only the fields and ordering of these messages matter to the core; wire
//! encoding and encryption belong to the transport. Every message carries
//! the trade id it concerns plus its own uid, which the receiver echoes in
//! the acknowledgment.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use monero_dex_common::{AtomicAmount, NodeAddress, PubKeyRing};

use crate::support::chat::ChatMessage;
use crate::support::dispute::{Dispute, DisputeResult, SupportType};

/// Acknowledgment for a processed message, echoing the source uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub uid: String,
    pub source_uid: String,
    pub source_type: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub sender_node_address: NodeAddress,
}

impl AckMessage {
    pub fn for_source(
        source_uid: impl Into<String>,
        source_type: impl Into<String>,
        success: bool,
        error_message: Option<String>,
        sender_node_address: NodeAddress,
    ) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            source_uid: source_uid.into(),
            source_type: source_type.into(),
            success,
            error_message,
            sender_node_address,
        }
    }
}

// ============================================================================
// Trade protocol messages
// ============================================================================

/// First message of the protocol: taker → arbitrator → maker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitTradeRequest {
    pub trade_id: String,
    pub uid: String,
    pub sender_pub_key_ring: PubKeyRing,
    pub trade_amount: AtomicAmount,
    pub trade_price: u64,
    pub maker_node_address: NodeAddress,
    pub taker_node_address: NodeAddress,
    pub arbitrator_node_address: NodeAddress,
    pub payment_account_payload_hash: String,
}

/// Multisig key-material exchange between the three parties. Each stage hex
/// is present once the sender has produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMultisigRequest {
    pub trade_id: String,
    pub uid: String,
    pub prepared_multisig_hex: Option<String>,
    pub made_multisig_hex: Option<String>,
    pub exchanged_multisig_hex: Option<String>,
}

/// A trader submits its contract inputs and asks the counterparty to sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignContractRequest {
    pub trade_id: String,
    pub uid: String,
    pub payment_account_payload_hash: String,
    pub payout_address: String,
    pub deposit_tx_id: Option<String>,
}

/// Countersignature over the canonical contract bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignContractResponse {
    pub trade_id: String,
    pub uid: String,
    pub contract_signature: String,
}

/// A trader delivers its signed deposit to the arbitrator for publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub trade_id: String,
    pub uid: String,
    pub contract_signature: String,
    pub deposit_tx_hex: String,
    pub deposit_tx_key: String,
}

/// Arbitrator → traders once both deposits are published (or failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositResponse {
    pub trade_id: String,
    pub uid: String,
    pub error_message: Option<String>,
}

/// Request for the counterparty's payment account decryption key, answered
/// by the arbitrator once deposits are confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAccountKeyRequest {
    pub trade_id: String,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAccountKeyResponse {
    pub trade_id: String,
    pub uid: String,
    pub payment_account_key: String,
}

/// Multisig state sync after a wallet mutation (e.g. payout signing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMultisigRequest {
    pub trade_id: String,
    pub uid: String,
    pub updated_multisig_hex: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMultisigResponse {
    pub trade_id: String,
    pub uid: String,
    pub updated_multisig_hex: String,
}

/// Union of direct trade-protocol messages, dispatched by the trade manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TradeMessage {
    InitTradeRequest(InitTradeRequest),
    InitMultisigRequest(InitMultisigRequest),
    SignContractRequest(SignContractRequest),
    SignContractResponse(SignContractResponse),
    DepositRequest(DepositRequest),
    DepositResponse(DepositResponse),
    PaymentAccountKeyRequest(PaymentAccountKeyRequest),
    PaymentAccountKeyResponse(PaymentAccountKeyResponse),
    UpdateMultisigRequest(UpdateMultisigRequest),
    UpdateMultisigResponse(UpdateMultisigResponse),
    Ack(AckMessage),
}

impl TradeMessage {
    pub fn trade_id(&self) -> &str {
        match self {
            TradeMessage::InitTradeRequest(m) => &m.trade_id,
            TradeMessage::InitMultisigRequest(m) => &m.trade_id,
            TradeMessage::SignContractRequest(m) => &m.trade_id,
            TradeMessage::SignContractResponse(m) => &m.trade_id,
            TradeMessage::DepositRequest(m) => &m.trade_id,
            TradeMessage::DepositResponse(m) => &m.trade_id,
            TradeMessage::PaymentAccountKeyRequest(m) => &m.trade_id,
            TradeMessage::PaymentAccountKeyResponse(m) => &m.trade_id,
            TradeMessage::UpdateMultisigRequest(m) => &m.trade_id,
            TradeMessage::UpdateMultisigResponse(m) => &m.trade_id,
            TradeMessage::Ack(m) => &m.source_uid,
        }
    }

    pub fn uid(&self) -> &str {
        match self {
            TradeMessage::InitTradeRequest(m) => &m.uid,
            TradeMessage::InitMultisigRequest(m) => &m.uid,
            TradeMessage::SignContractRequest(m) => &m.uid,
            TradeMessage::SignContractResponse(m) => &m.uid,
            TradeMessage::DepositRequest(m) => &m.uid,
            TradeMessage::DepositResponse(m) => &m.uid,
            TradeMessage::PaymentAccountKeyRequest(m) => &m.uid,
            TradeMessage::PaymentAccountKeyResponse(m) => &m.uid,
            TradeMessage::UpdateMultisigRequest(m) => &m.uid,
            TradeMessage::UpdateMultisigResponse(m) => &m.uid,
            TradeMessage::Ack(m) => &m.uid,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TradeMessage::InitTradeRequest(_) => "InitTradeRequest",
            TradeMessage::InitMultisigRequest(_) => "InitMultisigRequest",
            TradeMessage::SignContractRequest(_) => "SignContractRequest",
            TradeMessage::SignContractResponse(_) => "SignContractResponse",
            TradeMessage::DepositRequest(_) => "DepositRequest",
            TradeMessage::DepositResponse(_) => "DepositResponse",
            TradeMessage::PaymentAccountKeyRequest(_) => "PaymentAccountKeyRequest",
            TradeMessage::PaymentAccountKeyResponse(_) => "PaymentAccountKeyResponse",
            TradeMessage::UpdateMultisigRequest(_) => "UpdateMultisigRequest",
            TradeMessage::UpdateMultisigResponse(_) => "UpdateMultisigResponse",
            TradeMessage::Ack(_) => "AckMessage",
        }
    }
}

// ============================================================================
// Dispute messages
// ============================================================================

/// Trader → arbitrator: open a dispute. Carries the opener's dispute record
/// (including the first, system chat message) and the opener's fresh
/// multisig export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenNewDisputeMessage {
    pub uid: String,
    pub sender_node_address: NodeAddress,
    pub dispute: Dispute,
    pub support_type: SupportType,
    pub updated_multisig_hex: String,
}

/// Arbitrator → the opener's counterparty: mirror of the opened dispute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerOpenedDisputeMessage {
    pub uid: String,
    pub sender_node_address: NodeAddress,
    pub dispute: Dispute,
    pub support_type: SupportType,
}

/// Arbitrator → each trader: the dispute's resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeResultMessage {
    pub uid: String,
    pub sender_node_address: NodeAddress,
    pub dispute_result: DisputeResult,
    pub support_type: SupportType,
}

/// Union of dispute-side messages, carried over the mailbox channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SupportMessage {
    OpenNewDispute(OpenNewDisputeMessage),
    PeerOpenedDispute(PeerOpenedDisputeMessage),
    DisputeResult(DisputeResultMessage),
    Chat(ChatMessage),
    Ack(AckMessage),
}

impl SupportMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SupportMessage::OpenNewDispute(_) => "OpenNewDisputeMessage",
            SupportMessage::PeerOpenedDispute(_) => "PeerOpenedDisputeMessage",
            SupportMessage::DisputeResult(_) => "DisputeResultMessage",
            SupportMessage::Chat(_) => "ChatMessage",
            SupportMessage::Ack(_) => "AckMessage",
        }
    }

    pub fn uid(&self) -> &str {
        match self {
            SupportMessage::OpenNewDispute(m) => &m.uid,
            SupportMessage::PeerOpenedDispute(m) => &m.uid,
            SupportMessage::DisputeResult(m) => &m.uid,
            SupportMessage::Chat(m) => &m.uid,
            SupportMessage::Ack(m) => &m.uid,
        }
    }
}
