//! Arbitration manager
//!
//! Drives the dispute protocol: opening a dispute with the arbitrator,
//! mirroring it to the peer, chat, and resolution. Owns the dispute list;
//! trades are referenced by id through the trade manager only, never held.
//!
//! Closing the two mirrored disputes of a trade is sequential and not
//! atomic. A crash between the two closes leaves the peer's dispute open;
//! re-running `resolve_dispute` is safe because each close is
//! check-then-set and the result send is at-least-once.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use monero_dex_common::types::format_xmr;
use monero_dex_common::{AtomicAmount, Error, KeyRing, NodeAddress, PubKeyRing, Result};
use monero_dex_wallet::{MultisigWalletService, PayoutRequest};

use crate::config::ProtocolConfig;
use crate::mailbox::{MailboxDelivery, MailboxService};
use crate::messages::{
    AckMessage, DisputeResultMessage, OpenNewDisputeMessage, PeerOpenedDisputeMessage,
    SupportMessage,
};
use crate::services::{PersistenceRequester, PriceFeedService};
use crate::support::chat::ChatMessage;
use crate::support::dispute::{
    Dispute, DisputeReason, DisputeResult, DisputeState, DisputeWinner, SupportType,
};
use crate::support::validation::{validate_dispute, ValidationException};
use crate::trade::manager::TradeManager;
use crate::trade::TradeDisputeState;

/// Refund floor keeping some incentive to accept a mediated proposal.
const MIN_REFUND_AT_MEDIATED_DISPUTE: AtomicAmount = 50_000_000_000; // 0.05 XMR

pub struct DisputeManager {
    key_ring: Arc<KeyRing>,
    own_address: NodeAddress,
    mailbox: Arc<dyn MailboxService>,
    wallet_service: Arc<dyn MultisigWalletService>,
    persistence: Arc<dyn PersistenceRequester>,
    price_feed: Arc<dyn PriceFeedService>,
    trade_manager: Arc<TradeManager>,
    config: ProtocolConfig,
    allowed_donation_addresses: Vec<String>,

    disputes: Mutex<Vec<Dispute>>,
    validation_exceptions: Mutex<Vec<ValidationException>>,
}

impl DisputeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key_ring: Arc<KeyRing>,
        own_address: NodeAddress,
        mailbox: Arc<dyn MailboxService>,
        wallet_service: Arc<dyn MultisigWalletService>,
        persistence: Arc<dyn PersistenceRequester>,
        price_feed: Arc<dyn PriceFeedService>,
        trade_manager: Arc<TradeManager>,
        config: ProtocolConfig,
        allowed_donation_addresses: Vec<String>,
    ) -> Self {
        Self {
            key_ring,
            own_address,
            mailbox,
            wallet_service,
            persistence,
            price_feed,
            trade_manager,
            config,
            allowed_donation_addresses,
            disputes: Mutex::new(Vec::new()),
            validation_exceptions: Mutex::new(Vec::new()),
        }
    }

    pub fn request_persistence(&self) {
        self.persistence.request_persistence();
    }

    fn support_type(&self) -> SupportType {
        SupportType::Arbitration
    }

    pub fn is_agent(&self, dispute: &Dispute) -> bool {
        &dispute.agent_pub_key_ring == self.key_ring.pub_key_ring()
    }

    pub fn is_trader(&self, dispute: &Dispute) -> bool {
        &dispute.trader_pub_key_ring == self.key_ring.pub_key_ring()
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Load persisted disputes, run structural validation over each and do
    /// the reconciliation pass for disputes closed right before a crash.
    pub async fn on_all_services_initialized(&self, persisted: Vec<Dispute>) {
        {
            let mut disputes = self.disputes.lock().await;
            *disputes = persisted;
        }
        let disputes = self.disputes.lock().await.clone();
        for dispute in &disputes {
            let exceptions = validate_dispute(dispute, &self.allowed_donation_addresses);
            if !exceptions.is_empty() {
                let mut list = self.validation_exceptions.lock().await;
                for e in exceptions {
                    error!(dispute_id = %e.dispute_id, message = %e.message, "dispute validation failed");
                    list.push(e);
                }
            }
        }
        self.cleanup_disputes().await;
    }

    /// Reconcile closed disputes with their trades: a dispute that carries
    /// a result but whose trade is still pending means we crashed between
    /// close and trade completion.
    pub async fn cleanup_disputes(&self) {
        let mut closed: Vec<String> = {
            let disputes = self.disputes.lock().await;
            disputes
                .iter()
                .filter(|d| d.is_closed() && d.dispute_result.is_some())
                .map(|d| d.trade_id.clone())
                .collect()
        };
        closed.dedup();
        for trade_id in closed {
            if let Some(trade) = self.trade_manager.get_open_trade(&trade_id).await {
                let payout_published = trade.lock().await.is_payout_published();
                if payout_published {
                    info!(trade_id = %trade_id, "closing disputed trade left pending by earlier shutdown");
                    self.trade_manager
                        .close_disputed_trade(&trade_id, TradeDisputeState::DisputeClosed)
                        .await;
                }
            }
        }
    }

    // ========================================================================
    // Open dispute (trader side)
    // ========================================================================

    /// Build a dispute for one of our trades and send it to the arbitrator.
    pub async fn open_dispute(self: &Arc<Self>, trade_id: &str) -> Result<()> {
        let trade = self
            .trade_manager
            .get_trade(trade_id)
            .await
            .ok_or_else(|| Error::TradeNotFound(trade_id.to_string()))?;

        let dispute = {
            let mut guard = trade.lock().await;
            let contract = guard.contract.clone().ok_or_else(|| {
                Error::ProtocolViolation(format!("trade {} has no contract yet", trade_id))
            })?;
            let agent_pub_key_ring = guard.arbitrator.pub_key_ring.clone().ok_or_else(|| {
                Error::ProtocolViolation(format!("trade {} has no arbitrator", trade_id))
            })?;
            let own_pub_key_ring = self.key_ring.pub_key_ring().clone();
            let opener_is_buyer = contract.buyer_pub_key_ring == own_pub_key_ring;
            let opener_is_maker = guard.role() == crate::trade::TradeRole::Maker;
            let contract_hash = guard
                .contract_hash
                .clone()
                .unwrap_or(contract.hash()?);
            let contract_as_json = guard
                .contract_as_json
                .clone()
                .unwrap_or(contract.to_canonical_json()?);
            let dispute = Dispute::new(
                trade_id,
                own_pub_key_ring.trader_id(),
                true,
                opener_is_buyer,
                opener_is_maker,
                own_pub_key_ring,
                agent_pub_key_ring,
                guard.trade_date,
                guard.max_trade_period_date.unwrap_or_else(Utc::now),
                contract,
                contract_hash,
                contract_as_json,
                self.support_type(),
            );
            guard.set_dispute_state(TradeDisputeState::DisputeRequested);
            dispute
        };
        self.trade_manager.request_persistence();

        // The arbitrator needs our current multisig state to co-sign the
        // eventual payout.
        let wallet = self.wallet_service.get_multisig_wallet(trade_id).await?;
        let updated_multisig_hex = wallet.get_multisig_hex().await?;
        self.wallet_service.close_multisig_wallet(trade_id).await?;

        self.send_open_new_dispute_message(dispute, false, updated_multisig_hex)
            .await
    }

    /// Send a freshly built dispute to the arbitrator over the mailbox
    /// channel. Rejects (trade, trader) pairs that already have a stored
    /// dispute unless `re_open` is set.
    pub async fn send_open_new_dispute_message(
        self: &Arc<Self>,
        dispute: Dispute,
        re_open: bool,
        updated_multisig_hex: String,
    ) -> Result<()> {
        info!(
            trade_id = %dispute.trade_id,
            dispute_id = %dispute.id,
            re_open,
            "sending open new dispute message"
        );

        let chat_message = {
            let mut disputes = self.disputes.lock().await;
            let stored = disputes
                .iter()
                .any(|d| d.trade_id == dispute.trade_id && d.trader_id == dispute.trader_id);
            if stored && !re_open {
                let msg = format!(
                    "we already have a dispute open for that trade and trading peer, trade id {}",
                    dispute.trade_id
                );
                warn!("{}", msg);
                return Err(Error::DisputeAlreadyOpen {
                    trade_id: dispute.trade_id.clone(),
                    trader_id: dispute.trader_id,
                });
            }

            let mut dispute = dispute;
            let chat_message = ChatMessage::system(
                dispute.trade_id.clone(),
                dispute.trader_id,
                format!(
                    "System message: you opened a dispute for trade {}.",
                    dispute.short_trade_id()
                ),
                self.own_address.clone(),
            );
            dispute.add_chat_message(chat_message.clone());
            dispute.state = DisputeState::Open;
            if re_open {
                if let Some(existing) = disputes
                    .iter_mut()
                    .find(|d| d.trade_id == dispute.trade_id && d.trader_id == dispute.trader_id)
                {
                    existing.state = DisputeState::Reopened;
                    existing.add_chat_message(chat_message.clone());
                }
            } else {
                disputes.push(dispute.clone());
            }
            chat_message
        };
        self.request_persistence();

        let (dispute_snapshot, agent_address, agent_pub_key_ring) = {
            let disputes = self.disputes.lock().await;
            let Some(stored) = disputes
                .iter()
                .find(|d| d.trade_id == chat_message.trade_id && d.trader_id == chat_message.trader_id)
            else {
                return Err(Error::Internal("dispute vanished while sending".to_string()));
            };
            (
                stored.clone(),
                stored.contract.arbitrator_node_address.clone(),
                stored.agent_pub_key_ring.clone(),
            )
        };

        let message = OpenNewDisputeMessage {
            uid: Uuid::new_v4().to_string(),
            sender_node_address: self.own_address.clone(),
            dispute: dispute_snapshot,
            support_type: self.support_type(),
            updated_multisig_hex,
        };
        info!(
            trade_id = %chat_message.trade_id,
            message_uid = %message.uid,
            chat_uid = %chat_message.uid,
            agent = %agent_address,
            "sending OpenNewDisputeMessage to arbitrator"
        );
        let delivery = self
            .mailbox
            .send_encrypted_mailbox_message(&agent_address, &agent_pub_key_ring, SupportMessage::OpenNewDispute(message))
            .await;
        self.apply_delivery_to_chat_message(&chat_message.trade_id, chat_message.trader_id, &chat_message.uid, &delivery)
            .await;
        match delivery {
            MailboxDelivery::Arrived | MailboxDelivery::StoredInMailbox => Ok(()),
            MailboxDelivery::Fault(e) => Err(Error::DisputeMessageDeliveryFailed(e)),
        }
    }

    /// Record the terminal delivery state on the persisted chat message.
    /// The chat message, not the network message, carries delivery state:
    /// it is the only persisted, user-visible record.
    async fn apply_delivery_to_chat_message(
        &self,
        trade_id: &str,
        trader_id: u32,
        chat_uid: &str,
        delivery: &MailboxDelivery,
    ) {
        let mut disputes = self.disputes.lock().await;
        let Some(dispute) = disputes
            .iter_mut()
            .find(|d| d.trade_id == trade_id && d.trader_id == trader_id)
        else {
            return;
        };
        if let Some(chat_message) = dispute.chat_message_mut(chat_uid) {
            match delivery {
                MailboxDelivery::Arrived => chat_message.set_arrived(),
                MailboxDelivery::StoredInMailbox => chat_message.set_stored_in_mailbox(),
                MailboxDelivery::Fault(e) => chat_message.set_send_message_error(e.clone()),
            }
        }
        drop(disputes);
        self.request_persistence();
    }

    // ========================================================================
    // Inbound message handlers
    // ========================================================================

    /// Dispatch for inbound support messages.
    pub async fn on_support_message(self: &Arc<Self>, message: SupportMessage) {
        match message {
            SupportMessage::OpenNewDispute(m) => self.on_open_new_dispute_message(m).await,
            SupportMessage::PeerOpenedDispute(m) => self.on_peer_opened_dispute_message(m).await,
            SupportMessage::DisputeResult(m) => self.on_dispute_result_message(m).await,
            SupportMessage::Chat(m) => self.on_chat_message(m).await,
            SupportMessage::Ack(m) => self.on_ack_message(m).await,
        }
    }

    /// Arbitrator receives a trader's newly opened dispute.
    pub async fn on_open_new_dispute_message(self: &Arc<Self>, message: OpenNewDisputeMessage) {
        let mut dispute = message.dispute.clone();
        info!(
            trade_id = %dispute.trade_id,
            dispute_id = %dispute.id,
            "on open new dispute message"
        );

        // Messages from older schema versions may miss these fields.
        dispute.support_type = message.support_type;
        dispute.state = DisputeState::New;

        let Some(trade) = self.trade_manager.get_trade(&dispute.trade_id).await else {
            warn!(trade_id = %dispute.trade_id, "dispute trade does not exist");
            return;
        };

        // The trade is the monitor: its lock serializes this handler with
        // concurrent protocol messages for the same trade.
        let trade_guard = trade.lock().await;

        let mut error_message: Option<String> = None;
        if self.is_agent(&dispute) {
            // Bring the arbitrator's multisig wallet up to date, then
            // release the handle.
            match self.wallet_service.get_multisig_wallet(&dispute.trade_id).await {
                Ok(wallet) => {
                    if let Err(e) = wallet.import_multisig_hex(&message.updated_multisig_hex).await {
                        warn!(trade_id = %dispute.trade_id, error = %e, "failed to import opener multisig hex");
                    } else {
                        info!(trade_id = %dispute.trade_id, "arbitrator multisig wallet updated on new dispute");
                    }
                    if let Err(e) = self.wallet_service.close_multisig_wallet(&dispute.trade_id).await {
                        warn!(trade_id = %dispute.trade_id, error = %e, "failed to close multisig wallet");
                    }
                }
                Err(e) => {
                    warn!(trade_id = %dispute.trade_id, error = %e, "failed to open multisig wallet for dispute");
                }
            }

            let mut disputes = self.disputes.lock().await;
            let stored = disputes
                .iter()
                .any(|d| d.trade_id == dispute.trade_id && d.trader_id == dispute.trader_id);
            if !stored {
                dispute.state = DisputeState::Open;
                disputes.push(dispute.clone());
                drop(disputes);

                // Mirror the dispute to the peer after a short delay so a
                // concurrently arriving open-request from that peer wins
                // the race and is used as the valid message. Known race
                // heuristic, kept for observable-behavior parity.
                let manager = self.clone();
                let dispute_for_peer = dispute.clone();
                let delay = self.config.dispute_mirror_delay();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.do_send_peer_opened_dispute_message(dispute_for_peer).await;
                });
            } else {
                // Valid when both traders opened and the agent was offline.
                let msg = format!(
                    "we already have a dispute stored for that trade and trader, trade id {}",
                    dispute.trade_id
                );
                warn!("{}", msg);
                error_message = Some(msg);
            }
        } else {
            let msg = "trader received OpenNewDisputeMessage, that must never happen".to_string();
            error!("{}", msg);
            error_message = Some(msg);
        }

        // Ack on the embedded chat message, which is what the opener
        // persisted and shows to the user.
        if let Some(chat_message) = message.dispute.chat_messages().first() {
            let opener_pub_key_ring = message.dispute.opener_pub_key_ring().clone();
            let opener_address = if message.dispute.dispute_opener_is_buyer {
                message.dispute.contract.buyer_node_address.clone()
            } else {
                message.dispute.contract.seller_node_address.clone()
            };
            self.send_support_ack(
                chat_message,
                &opener_address,
                &opener_pub_key_ring,
                error_message.is_none(),
                error_message.clone(),
            )
            .await;
        }
        drop(trade_guard);

        self.spawn_price_info_task(dispute.trade_id.clone(), dispute.trader_id);

        let exceptions = validate_dispute(&dispute, &self.allowed_donation_addresses);
        if !exceptions.is_empty() {
            let mut list = self.validation_exceptions.lock().await;
            for e in exceptions {
                error!(dispute_id = %e.dispute_id, message = %e.message, "dispute validation failed");
                list.push(e);
            }
        }
        self.request_persistence();
    }

    /// Build and send the mirrored dispute record to the opener's peer.
    async fn do_send_peer_opened_dispute_message(self: &Arc<Self>, dispute_from_opener: Dispute) {
        let contract = dispute_from_opener.contract.clone();
        let peer_pub_key_ring = dispute_from_opener.peer_pub_key_ring().clone();
        let peer_address = if dispute_from_opener.dispute_opener_is_buyer {
            contract.seller_node_address.clone()
        } else {
            contract.buyer_node_address.clone()
        };

        let mut dispute = Dispute::new(
            dispute_from_opener.trade_id.clone(),
            peer_pub_key_ring.trader_id(),
            false,
            dispute_from_opener.dispute_opener_is_buyer,
            dispute_from_opener.dispute_opener_is_maker,
            peer_pub_key_ring.clone(),
            dispute_from_opener.agent_pub_key_ring.clone(),
            dispute_from_opener.trade_date,
            dispute_from_opener.trade_period_end,
            contract,
            dispute_from_opener.contract_hash.clone(),
            dispute_from_opener.contract_as_json.clone(),
            dispute_from_opener.support_type,
        );
        dispute.maker_contract_signature = dispute_from_opener.maker_contract_signature.clone();
        dispute.taker_contract_signature = dispute_from_opener.taker_contract_signature.clone();
        dispute.maker_payment_account_payload =
            dispute_from_opener.maker_payment_account_payload.clone();
        dispute.taker_payment_account_payload =
            dispute_from_opener.taker_payment_account_payload.clone();
        dispute.deposit_tx_id = dispute_from_opener.deposit_tx_id.clone();
        dispute.payout_tx_id = dispute_from_opener.payout_tx_id.clone();
        dispute.donation_address_of_delayed_payout_tx = dispute_from_opener
            .donation_address_of_delayed_payout_tx
            .clone();

        {
            let mut disputes = self.disputes.lock().await;
            let stored = disputes
                .iter()
                .any(|d| d.trade_id == dispute.trade_id && d.trader_id == dispute.trader_id);
            if stored {
                // Valid when both traders opened while the agent was offline;
                // the peer's own open-request already created this record.
                info!(
                    trade_id = %dispute.trade_id,
                    "dispute already open for that trade and trading peer, not mirroring"
                );
                return;
            }
            let chat_message = ChatMessage::system(
                dispute.trade_id.clone(),
                dispute.trader_id,
                format!(
                    "System message: your trading peer opened a dispute for trade {}.",
                    dispute.short_trade_id()
                ),
                self.own_address.clone(),
            );
            dispute.add_chat_message(chat_message);
            dispute.state = DisputeState::Open;
            disputes.push(dispute.clone());
        }

        self.spawn_price_info_task(dispute.trade_id.clone(), dispute.trader_id);

        let chat_uid = dispute
            .chat_messages()
            .first()
            .map(|m| m.uid.clone())
            .unwrap_or_default();
        let message = PeerOpenedDisputeMessage {
            uid: Uuid::new_v4().to_string(),
            sender_node_address: self.own_address.clone(),
            dispute: dispute.clone(),
            support_type: dispute.support_type,
        };
        info!(
            trade_id = %dispute.trade_id,
            peer = %peer_address,
            message_uid = %message.uid,
            "sending PeerOpenedDisputeMessage"
        );
        let delivery = self
            .mailbox
            .send_encrypted_mailbox_message(&peer_address, &peer_pub_key_ring, SupportMessage::PeerOpenedDispute(message))
            .await;
        self.apply_delivery_to_chat_message(&dispute.trade_id, dispute.trader_id, &chat_uid, &delivery)
            .await;
        self.request_persistence();
    }

    /// Non-opening trader receives the mirrored dispute from the agent.
    pub async fn on_peer_opened_dispute_message(self: &Arc<Self>, message: PeerOpenedDisputeMessage) {
        let dispute = message.dispute.clone();
        info!(
            trade_id = %dispute.trade_id,
            dispute_id = %dispute.id,
            "on peer opened dispute message"
        );

        let Some(trade) = self.trade_manager.get_open_trade(&dispute.trade_id).await else {
            warn!(trade_id = %dispute.trade_id, "no open trade for peer opened dispute");
            return;
        };
        let mut trade_guard = trade.lock().await;

        let mut error_message: Option<String> = None;
        if !self.is_agent(&dispute) {
            let mut disputes = self.disputes.lock().await;
            let stored = disputes
                .iter()
                .any(|d| d.trade_id == dispute.trade_id && d.trader_id == dispute.trader_id);
            if !stored {
                disputes.push(dispute.clone());
                drop(disputes);
                trade_guard.set_dispute_state(TradeDisputeState::DisputeOpenedByPeer);
                self.trade_manager.request_persistence();
            } else {
                let msg = format!(
                    "we already have a dispute stored for that trade and trader, trade id {}",
                    dispute.trade_id
                );
                warn!("{}", msg);
                error_message = Some(msg);
            }
        } else {
            let msg = "arbitrator received PeerOpenedDisputeMessage, that must never happen".to_string();
            error!("{}", msg);
            error_message = Some(msg);
        }

        if let Some(chat_message) = message.dispute.chat_messages().first() {
            let agent_address = message.dispute.contract.arbitrator_node_address.clone();
            let agent_pub_key_ring = message.dispute.agent_pub_key_ring.clone();
            self.send_support_ack(
                chat_message,
                &agent_address,
                &agent_pub_key_ring,
                error_message.is_none(),
                error_message,
            )
            .await;
        }
        drop(trade_guard);
        self.request_persistence();
    }

    /// Trader receives the arbitrator's resolution. Reapplication of a
    /// result already bound to the same chat message uid is a no-op.
    pub async fn on_dispute_result_message(self: &Arc<Self>, message: DisputeResultMessage) {
        let result = message.dispute_result.clone();
        info!(
            trade_id = %result.trade_id,
            trader_id = result.trader_id,
            "on dispute result message"
        );

        {
            let mut disputes = self.disputes.lock().await;
            let Some(dispute) = disputes
                .iter_mut()
                .find(|d| d.trade_id == result.trade_id && d.trader_id == result.trader_id)
            else {
                warn!(trade_id = %result.trade_id, "no dispute for result message");
                return;
            };

            if let (Some(existing), Some(new_uid)) =
                (&dispute.dispute_result, &result.chat_message_uid)
            {
                if existing.chat_message_uid.as_ref() == Some(new_uid) {
                    warn!(
                        trade_id = %result.trade_id,
                        "dispute result already applied, ignoring redelivery"
                    );
                    return;
                }
            }

            if let Some(summary) = &result.signed_summary {
                let mut chat_message = ChatMessage::system(
                    dispute.trade_id.clone(),
                    dispute.trader_id,
                    summary.clone(),
                    message.sender_node_address.clone(),
                );
                if let Some(uid) = &result.chat_message_uid {
                    chat_message.uid = uid.clone();
                }
                dispute.add_chat_message(chat_message);
            }
            dispute.dispute_result = Some(result.clone());
            dispute.set_closed();
        }

        self.trade_manager
            .close_disputed_trade(&result.trade_id, TradeDisputeState::DisputeClosed)
            .await;
        self.request_persistence();
    }

    /// Plain chat traffic for an open dispute.
    pub async fn on_chat_message(self: &Arc<Self>, message: ChatMessage) {
        let stored = self.add_and_persist_chat_message(message.clone()).await;
        if !stored {
            return;
        }
        // Ack back to the sender.
        let (address, pub_key_ring) = {
            let disputes = self.disputes.lock().await;
            let Some(dispute) = disputes
                .iter()
                .find(|d| d.trade_id == message.trade_id && d.trader_id == message.trader_id)
            else {
                return;
            };
            if message.sender_is_trader {
                (
                    trader_node_address(dispute),
                    dispute.trader_pub_key_ring.clone(),
                )
            } else {
                (
                    dispute.contract.arbitrator_node_address.clone(),
                    dispute.agent_pub_key_ring.clone(),
                )
            }
        };
        self.send_support_ack(&message, &address, &pub_key_ring, true, None).await;
    }

    /// Mark the chat message the ack refers to as acknowledged.
    pub async fn on_ack_message(self: &Arc<Self>, ack: AckMessage) {
        let mut updated = false;
        {
            let mut disputes = self.disputes.lock().await;
            for dispute in disputes.iter_mut() {
                if let Some(chat_message) = dispute.chat_message_mut(&ack.source_uid) {
                    chat_message.set_acknowledged(ack.success, ack.error_message.clone());
                    updated = true;
                    break;
                }
            }
        }
        if updated {
            self.request_persistence();
        }
    }

    /// Store a chat message, deduplicating by uid. Returns whether it was
    /// new.
    pub async fn add_and_persist_chat_message(&self, message: ChatMessage) -> bool {
        let mut disputes = self.disputes.lock().await;
        let Some(dispute) = disputes
            .iter_mut()
            .find(|d| d.trade_id == message.trade_id && d.trader_id == message.trader_id)
        else {
            warn!(
                trade_id = %message.trade_id,
                trader_id = message.trader_id,
                "no dispute for chat message"
            );
            return false;
        };
        let added = dispute.add_chat_message(message);
        drop(disputes);
        if added {
            self.request_persistence();
        }
        added
    }

    /// Author and send a chat message on an open dispute.
    pub async fn send_dispute_chat_message(self: &Arc<Self>, dispute_id: &str, text: String) -> Result<()> {
        let (chat_message, address, pub_key_ring) = {
            let mut disputes = self.disputes.lock().await;
            let Some(dispute) = disputes.iter_mut().find(|d| d.id == dispute_id) else {
                return Err(Error::DisputeNotFound(dispute_id.to_string()));
            };
            let is_trader = self.is_trader(dispute);
            let chat_message = ChatMessage::new(
                dispute.trade_id.clone(),
                dispute.trader_id,
                is_trader,
                text,
                self.own_address.clone(),
            );
            dispute.add_chat_message(chat_message.clone());
            let (address, pub_key_ring) = if is_trader {
                (
                    dispute.contract.arbitrator_node_address.clone(),
                    dispute.agent_pub_key_ring.clone(),
                )
            } else {
                (trader_node_address(dispute), dispute.trader_pub_key_ring.clone())
            };
            (chat_message, address, pub_key_ring)
        };
        self.request_persistence();

        let delivery = self
            .mailbox
            .send_encrypted_mailbox_message(&address, &pub_key_ring, SupportMessage::Chat(chat_message.clone()))
            .await;
        self.apply_delivery_to_chat_message(
            &chat_message.trade_id,
            chat_message.trader_id,
            &chat_message.uid,
            &delivery,
        )
        .await;
        match delivery {
            MailboxDelivery::Fault(e) => Err(Error::DisputeMessageDeliveryFailed(e)),
            _ => Ok(()),
        }
    }

    async fn send_support_ack(
        &self,
        chat_message: &ChatMessage,
        to: &NodeAddress,
        to_pub_key_ring: &PubKeyRing,
        success: bool,
        error_message: Option<String>,
    ) {
        let ack = AckMessage::for_source(
            chat_message.uid.clone(),
            "ChatMessage",
            success,
            error_message,
            self.own_address.clone(),
        );
        let delivery = self
            .mailbox
            .send_encrypted_mailbox_message(to, to_pub_key_ring, SupportMessage::Ack(ack))
            .await;
        if let MailboxDelivery::Fault(e) = delivery {
            warn!(peer = %to, error = %e, "failed to deliver ack");
        }
    }

    // ========================================================================
    // Resolution (arbitrator side)
    // ========================================================================

    /// Resolve a dispute: build the result, sign the payout from the
    /// multisig wallet, close the opener's ticket and then the peer's
    /// mirrored ticket. Safe to re-run after a partial failure.
    pub async fn resolve_dispute(
        self: &Arc<Self>,
        trade_id: &str,
        winner: DisputeWinner,
        reason: DisputeReason,
        summary_notes: &str,
        buyer_payout_amount: AtomicAmount,
        seller_payout_amount: AtomicAmount,
    ) -> Result<()> {
        // The opener's dispute triggers the payout code.
        let opener = {
            let disputes = self.disputes.lock().await;
            disputes
                .iter()
                .find(|d| d.trade_id == trade_id && d.is_opener)
                .cloned()
                .ok_or_else(|| Error::DisputeNotFound(trade_id.to_string()))?
        };

        let escrowed = opener.contract.total_escrow_amount();
        if buyer_payout_amount + seller_payout_amount != escrowed {
            return Err(Error::PayoutMismatch {
                buyer: buyer_payout_amount,
                seller: seller_payout_amount,
                escrowed,
            });
        }

        let close_date = Utc::now();
        let mut result = DisputeResult::new(
            trade_id,
            opener.trader_id,
            winner,
            reason,
            summary_notes,
            buyer_payout_amount,
            seller_payout_amount,
            close_date,
        );

        // The arbitrator only creates and signs the payout tx when
        // resolving the opener's side, avoiding a dual-signing race with
        // the mirrored record.
        if !opener.is_mediation_dispute() && !opener.is_closed() {
            let wallet = self.wallet_service.get_multisig_wallet(trade_id).await?;
            let payout = wallet
                .create_signed_payout_tx(&PayoutRequest {
                    trade_id: trade_id.to_string(),
                    buyer_payout_address: opener.contract.buyer_payout_address.clone(),
                    seller_payout_address: opener.contract.seller_payout_address.clone(),
                    buyer_amount: buyer_payout_amount,
                    seller_amount: seller_payout_amount,
                })
                .await?;
            result.arbitrator_signed_payout_tx_hex = Some(payout.signed_tx_hex);
            result.arbitrator_updated_multisig_hex = Some(wallet.get_multisig_hex().await?);
            self.wallet_service.close_multisig_wallet(trade_id).await?;
        }

        // Close the opener's ticket, then the peer's. Not atomic; each
        // close is idempotent.
        self.close_dispute_ticket(&opener, result.clone()).await?;

        let peer = {
            let disputes = self.disputes.lock().await;
            disputes
                .iter()
                .find(|d| d.trade_id == trade_id && d.trader_id != opener.trader_id)
                .cloned()
        };
        if let Some(peer) = peer {
            let mut peer_result = DisputeResult::new(
                trade_id,
                peer.trader_id,
                winner,
                reason,
                summary_notes,
                buyer_payout_amount,
                seller_payout_amount,
                close_date,
            );
            peer_result.arbitrator_updated_multisig_hex =
                result.arbitrator_updated_multisig_hex.clone();
            self.close_dispute_ticket(&peer, peer_result).await?;
        }
        Ok(())
    }

    /// Close one trader's ticket: bind the result, sign the summary, send
    /// the `DisputeResultMessage`. A ticket that already carries a result
    /// is left untouched and nothing is re-sent.
    async fn close_dispute_ticket(self: &Arc<Self>, dispute: &Dispute, mut result: DisputeResult) -> Result<()> {
        {
            let disputes = self.disputes.lock().await;
            let stored = disputes
                .iter()
                .find(|d| d.trade_id == dispute.trade_id && d.trader_id == dispute.trader_id);
            if let Some(stored) = stored {
                if stored.is_closed() && stored.dispute_result.is_some() {
                    info!(
                        dispute_id = %dispute.id,
                        "dispute already closed with a result, skipping"
                    );
                    return Ok(());
                }
            }
        }

        let summary_text = self.build_summary_text(dispute, &result);
        let signature = self.key_ring.sign(summary_text.as_bytes());
        let signed_summary = format!("{}\n\nArbitrator signature:\n{}", summary_text, signature);
        result.signed_summary = Some(signed_summary.clone());

        let chat_message = ChatMessage::new(
            dispute.trade_id.clone(),
            dispute.trader_id,
            false,
            signed_summary,
            self.own_address.clone(),
        );
        result.chat_message_uid = Some(chat_message.uid.clone());

        {
            let mut disputes = self.disputes.lock().await;
            let Some(stored) = disputes
                .iter_mut()
                .find(|d| d.trade_id == dispute.trade_id && d.trader_id == dispute.trader_id)
            else {
                return Err(Error::DisputeNotFound(dispute.trade_id.clone()));
            };
            stored.add_chat_message(chat_message.clone());
            stored.dispute_result = Some(result.clone());
            stored.set_closed();
        }
        self.request_persistence();

        let trader_address = trader_node_address(dispute);
        let message = DisputeResultMessage {
            uid: Uuid::new_v4().to_string(),
            sender_node_address: self.own_address.clone(),
            dispute_result: result,
            support_type: dispute.support_type,
        };
        info!(
            trade_id = %dispute.trade_id,
            trader = %trader_address,
            message_uid = %message.uid,
            chat_uid = %chat_message.uid,
            "sending DisputeResultMessage"
        );
        let delivery = self
            .mailbox
            .send_encrypted_mailbox_message(
                &trader_address,
                &dispute.trader_pub_key_ring,
                SupportMessage::DisputeResult(message),
            )
            .await;
        self.apply_delivery_to_chat_message(&dispute.trade_id, dispute.trader_id, &chat_message.uid, &delivery)
            .await;
        self.request_persistence();
        Ok(())
    }

    fn build_summary_text(&self, dispute: &Dispute, result: &DisputeResult) -> String {
        format!(
            "Dispute summary for trade {}\n\
             Close date: {}\n\
             Arbitrator: {}\n\
             Currency: {}\n\
             Trade amount: {}\n\
             Buyer payout: {}\n\
             Seller payout: {}\n\
             Reason: {}\n\
             Notes: {}",
            dispute.short_trade_id(),
            result.close_date.format("%Y-%m-%d %H:%M:%S UTC"),
            self.own_address,
            dispute.contract.currency_code,
            format_xmr(dispute.contract.trade_amount),
            format_xmr(result.buyer_payout_amount),
            format_xmr(result.seller_payout_amount),
            result.reason.as_str(),
            result.summary_notes,
        )
    }

    // ========================================================================
    // Price-info advisory
    // ========================================================================

    /// Best-effort option-trade advisory: compares the trade price against
    /// the current market price and the worst-case security-deposit loss.
    /// Never blocks dispute processing; gives up silently when the price
    /// feed stays empty.
    fn spawn_price_info_task(self: &Arc<Self>, trade_id: String, trader_id: u32) {
        let manager = self.clone();
        tokio::spawn(async move {
            let max_retries = manager.config.price_info_max_retries;
            let mut attempt = 0u32;
            loop {
                if manager.price_feed.has_prices() {
                    manager.append_price_info_message(&trade_id, trader_id).await;
                    return;
                }
                if attempt >= max_retries {
                    warn!(
                        trade_id = %trade_id,
                        "price feed still has no data after {} retries, giving up",
                        max_retries
                    );
                    return;
                }
                info!(
                    trade_id = %trade_id,
                    "price feed has no data yet, retrying in {}s",
                    manager.config.price_info_retry_delay_secs
                );
                tokio::time::sleep(manager.config.price_info_retry_delay()).await;
                attempt += 1;
            }
        });
    }

    async fn append_price_info_message(&self, trade_id: &str, trader_id: u32) {
        let contract = {
            let disputes = self.disputes.lock().await;
            match disputes
                .iter()
                .find(|d| d.trade_id == trade_id && d.trader_id == trader_id)
            {
                Some(d) => d.contract.clone(),
                None => return,
            }
        };

        let Some(price_now) = self.price_feed.market_price(&contract.currency_code) else {
            info!(
                currency = %contract.currency_code,
                "price feed has no price for currency, skipping advisory"
            );
            return;
        };
        if price_now == 0 {
            return;
        }

        // XMR buyable today with the trade's counter-currency volume.
        let volume = contract.trade_volume();
        let potential_amount_now = (volume
            * monero_dex_common::types::XMR_ATOMIC_UNITS as u128
            / price_now as u128) as i128;
        let max_loss_sec_deposit = contract
            .buyer_security_deposit
            .saturating_sub(MIN_REFUND_AT_MEDIATED_DISPUTE) as i128;
        let potential_gain =
            potential_amount_now - contract.trade_amount as i128 - max_loss_sec_deposit;

        let headline = if potential_gain > 0 {
            "This might be a potential option trade!"
        } else {
            "It does not appear to be an option trade."
        };
        let gain_abs = format_xmr(potential_gain.unsigned_abs().min(u64::MAX as u128) as u64);
        let gain_line = if potential_gain > 0 {
            format!("Possible gain from an option trade is: {}", gain_abs)
        } else {
            format!("Possible loss from an option trade is: {}", gain_abs)
        };
        let price_details = if contract.use_market_based_price {
            format!(
                " (market based price was used: {}%)",
                contract.market_price_margin_pct * 100.0
            )
        } else {
            " (fix price was used)".to_string()
        };
        let text = format!(
            "System message: {}\n\n\
             Trade price: {}{}\n\
             Trade amount: {}\n\
             XMR amount calculated with price at dispute opening: {}\n\
             Max loss of security deposit is: {}\n\
             {}",
            headline,
            contract.trade_price,
            price_details,
            format_xmr(contract.trade_amount),
            format_xmr(potential_amount_now.max(0).min(u64::MAX as i128) as u64),
            format_xmr(max_loss_sec_deposit.max(0) as u64),
            gain_line,
        );

        let mut disputes = self.disputes.lock().await;
        if let Some(dispute) = disputes
            .iter_mut()
            .find(|d| d.trade_id == trade_id && d.trader_id == trader_id)
        {
            let message = ChatMessage::system(
                trade_id.to_string(),
                trader_id,
                text,
                self.own_address.clone(),
            );
            dispute.add_chat_message(message);
        }
        drop(disputes);
        self.request_persistence();
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub async fn disputes(&self) -> Vec<Dispute> {
        self.disputes.lock().await.clone()
    }

    pub async fn find_dispute(&self, trade_id: &str, trader_id: u32) -> Option<Dispute> {
        self.disputes
            .lock()
            .await
            .iter()
            .find(|d| d.trade_id == trade_id && d.trader_id == trader_id)
            .cloned()
    }

    pub async fn find_dispute_by_trade(&self, trade_id: &str) -> Option<Dispute> {
        self.disputes
            .lock()
            .await
            .iter()
            .find(|d| d.trade_id == trade_id)
            .cloned()
    }

    pub async fn find_dispute_by_id(&self, dispute_id: &str) -> Option<Dispute> {
        self.disputes
            .lock()
            .await
            .iter()
            .find(|d| d.id == dispute_id)
            .cloned()
    }

    pub async fn num_open_disputes(&self) -> usize {
        self.disputes
            .lock()
            .await
            .iter()
            .filter(|d| !d.is_closed())
            .count()
    }

    pub async fn disputed_trade_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .disputes
            .lock()
            .await
            .iter()
            .map(|d| d.trade_id.clone())
            .collect();
        ids.dedup();
        ids
    }

    pub async fn validation_exceptions(&self) -> Vec<ValidationException> {
        self.validation_exceptions.lock().await.clone()
    }
}

/// The node address of the trader a dispute record belongs to, resolved
/// from the contract.
fn trader_node_address(dispute: &Dispute) -> NodeAddress {
    if dispute.contract.buyer_pub_key_ring == dispute.trader_pub_key_ring {
        dispute.contract.buyer_node_address.clone()
    } else {
        dispute.contract.seller_node_address.clone()
    }
}
