//! Messaging capabilities
//!
//! Trade-protocol traffic goes peer to peer (`DirectMessenger`); dispute
//! traffic goes through the store-and-forward mailbox channel
//! (`MailboxService`), which is at-least-once and asynchronous. Delivery of
//! a mailbox message terminates in exactly one of three states, modeled as
//! the future's resolved value; the caller must tolerate resolution on a
//! different task than the send.

use async_trait::async_trait;
use monero_dex_common::{NodeAddress, PubKeyRing, Result};

use crate::messages::{SupportMessage, TradeMessage};

/// Terminal delivery state of a mailbox send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxDelivery {
    /// The peer was online and received the message directly.
    Arrived,
    /// The peer was offline; the message is stored for later pickup.
    StoredInMailbox,
    /// The send failed.
    Fault(String),
}

impl MailboxDelivery {
    pub fn is_fault(&self) -> bool {
        matches!(self, MailboxDelivery::Fault(_))
    }
}

/// Peer-to-peer delivery of trade protocol messages.
#[async_trait]
pub trait DirectMessenger: Send + Sync {
    async fn send_direct_message(
        &self,
        to: &NodeAddress,
        to_pub_key_ring: &PubKeyRing,
        message: TradeMessage,
    ) -> Result<()>;
}

/// Encrypted store-and-forward channel for dispute messages.
#[async_trait]
pub trait MailboxService: Send + Sync {
    /// Send `message` to `to`, resolving once delivery reaches a terminal
    /// state. Never returns an `Err`; transport failures surface as
    /// [`MailboxDelivery::Fault`].
    async fn send_encrypted_mailbox_message(
        &self,
        to: &NodeAddress,
        to_pub_key_ring: &PubKeyRing,
        message: SupportMessage,
    ) -> MailboxDelivery;
}
