//! Dispute chat messages
//!
//! The chat transcript is the persisted, user-visible record of a dispute.
//! Delivery state lives on the chat message, not on the wrapping network
//! message: only the chat message is persisted, so delivery flags must be
//! re-derivable from it alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use monero_dex_common::NodeAddress;

/// One message in a dispute's chat transcript. Append-only per dispute,
/// ordered by insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub uid: String,
    pub trade_id: String,
    /// Stable id of the trader this message belongs to.
    pub trader_id: u32,
    pub sender_is_trader: bool,
    pub message: String,
    pub sender_node_address: NodeAddress,
    pub date: DateTime<Utc>,
    pub is_system_message: bool,
    // Delivery state, each flag set at most once by the mailbox callback.
    pub arrived: bool,
    pub stored_in_mailbox: bool,
    pub send_message_error: Option<String>,
    pub acknowledged: bool,
    pub ack_error: Option<String>,
}

impl ChatMessage {
    pub fn new(
        trade_id: impl Into<String>,
        trader_id: u32,
        sender_is_trader: bool,
        message: impl Into<String>,
        sender_node_address: NodeAddress,
    ) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            trade_id: trade_id.into(),
            trader_id,
            sender_is_trader,
            message: message.into(),
            sender_node_address,
            date: Utc::now(),
            is_system_message: false,
            arrived: false,
            stored_in_mailbox: false,
            send_message_error: None,
            acknowledged: false,
            ack_error: None,
        }
    }

    pub fn system(
        trade_id: impl Into<String>,
        trader_id: u32,
        message: impl Into<String>,
        sender_node_address: NodeAddress,
    ) -> Self {
        let mut msg = Self::new(trade_id, trader_id, false, message, sender_node_address);
        msg.is_system_message = true;
        msg
    }

    pub fn set_arrived(&mut self) {
        self.arrived = true;
    }

    pub fn set_stored_in_mailbox(&mut self) {
        self.stored_in_mailbox = true;
    }

    pub fn set_send_message_error(&mut self, error: impl Into<String>) {
        self.send_message_error = Some(error.into());
    }

    pub fn set_acknowledged(&mut self, success: bool, error: Option<String>) {
        self.acknowledged = success;
        self.ack_error = error;
    }
}
