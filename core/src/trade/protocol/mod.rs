//! Role-specialized trade protocol
//!
//! One protocol instance exists per trade uid for the process lifetime,
//! created lazily by the trade manager. Every inbound message goes through
//! the same gate: trade-id check, sender check for the message type and
//! current phase, mutation under the trade lock, an ack echoing the source
//! uid, and a persistence request. A message arriving at the wrong role is
//! a protocol violation: logged and dropped without ack or state change.

pub mod arbitrator;
pub mod maker;
pub mod taker;

use std::sync::Arc;

use tracing::{info, warn};

use monero_dex_common::{Error, KeyRing, NodeAddress, PubKeyRing, Result};
use monero_dex_wallet::MultisigWalletService;

use crate::config::ProtocolConfig;
use crate::contract::Contract;
use crate::mailbox::DirectMessenger;
use crate::messages::{
    AckMessage, DepositResponse, InitMultisigRequest, PaymentAccountKeyResponse,
    SignContractRequest, SignContractResponse, TradeMessage, UpdateMultisigRequest,
    UpdateMultisigResponse,
};
use crate::services::{NotificationService, PersistenceRequester};
use crate::trade::{Trade, TradeHandle, TradePhase, TradeRole};

/// Shared collaborators injected into every protocol instance.
pub struct ProtocolContext {
    pub key_ring: Arc<KeyRing>,
    pub own_address: NodeAddress,
    pub messenger: Arc<dyn DirectMessenger>,
    pub wallet_service: Arc<dyn MultisigWalletService>,
    pub persistence: Arc<dyn PersistenceRequester>,
    pub notifications: Arc<dyn NotificationService>,
    pub config: ProtocolConfig,
}

/// Message handler for one trade, polymorphic over the trade's role.
pub struct TradeProtocol {
    role: TradeRole,
    trade: Arc<TradeHandle>,
    ctx: Arc<ProtocolContext>,
}

impl TradeProtocol {
    pub fn new(role: TradeRole, trade: Arc<TradeHandle>, ctx: Arc<ProtocolContext>) -> Self {
        Self { role, trade, ctx }
    }

    pub fn role(&self) -> TradeRole {
        self.role
    }

    pub fn trade(&self) -> &Arc<TradeHandle> {
        &self.trade
    }

    pub(crate) fn persistence(&self) -> &dyn PersistenceRequester {
        self.ctx.persistence.as_ref()
    }

    pub(crate) fn messenger(&self) -> &dyn DirectMessenger {
        self.ctx.messenger.as_ref()
    }

    pub(crate) fn wallet_service(&self) -> &dyn MultisigWalletService {
        self.ctx.wallet_service.as_ref()
    }

    pub(crate) fn own_pub_key_ring(&self) -> &PubKeyRing {
        self.ctx.key_ring.pub_key_ring()
    }

    // ========================================================================
    // Shared gate
    // ========================================================================

    /// (a) of the processing rule: the message must name this instance's
    /// trade.
    fn verify_trade_id(&self, trade_id: &str) -> Result<()> {
        Error::require_non_empty(trade_id, "trade id")?;
        if trade_id != self.trade.id {
            return Err(Error::ProtocolViolation(format!(
                "message for trade {} delivered to protocol of trade {}",
                trade_id, self.trade.id
            )));
        }
        Ok(())
    }

    /// (b): the sender must be the expected counterpart. `allowed` holds the
    /// party records the message type may originate from.
    fn verify_sender(trade: &Trade, sender: &NodeAddress, allowed: &[&Option<NodeAddress>]) -> Result<()> {
        for candidate in allowed {
            if candidate.as_ref() == Some(sender) {
                return Ok(());
            }
        }
        Err(Error::ProtocolViolation(format!(
            "unexpected sender {} for trade {} in phase {}",
            sender,
            trade.id,
            trade.phase().as_str()
        )))
    }

    /// Resolve the pub key ring stored for a sender address, for acking.
    fn pub_key_ring_of(trade: &Trade, address: &NodeAddress) -> Option<PubKeyRing> {
        for party in [&trade.maker, &trade.taker, &trade.arbitrator] {
            if party.node_address.as_ref() == Some(address) {
                return party.pub_key_ring.clone();
            }
        }
        None
    }

    /// (d): acknowledge the source message. Best effort; an undeliverable
    /// ack is logged, never propagated.
    pub(crate) async fn send_ack(
        &self,
        trade: &Trade,
        to: &NodeAddress,
        source_uid: &str,
        source_type: &str,
        success: bool,
        error_message: Option<String>,
    ) {
        let Some(pub_key_ring) = Self::pub_key_ring_of(trade, to) else {
            warn!(trade_id = %trade.id, peer = %to, "no pub key ring known for ack receiver");
            return;
        };
        let ack = AckMessage::for_source(
            source_uid,
            source_type,
            success,
            error_message,
            self.ctx.own_address.clone(),
        );
        if let Err(e) = self
            .ctx
            .messenger
            .send_direct_message(to, &pub_key_ring, TradeMessage::Ack(ack))
            .await
        {
            warn!(trade_id = %trade.id, peer = %to, error = %e, "failed to send ack");
        }
    }

    /// Apply a phase transition with its side effects: a notification when
    /// deposits publish, and a persistence request on every change.
    pub(crate) fn apply_phase(&self, trade: &mut Trade, phase: TradePhase) -> Result<()> {
        let advanced = trade.set_phase(phase)?;
        if advanced {
            if phase == TradePhase::DepositsPublished {
                trade.start_trade_period(chrono::Utc::now());
                self.ctx.notifications.send_trade_notification(
                    &trade.id,
                    "Offer taken",
                    &format!("Deposits for trade {} are published", trade.short_id()),
                );
            }
            self.ctx.persistence.request_persistence();
        }
        Ok(())
    }

    // ========================================================================
    // Handlers common to every role
    // ========================================================================

    /// Multisig key-material exchange. Any of the other two parties may
    /// send; the material is imported and our own next-stage export is sent
    /// back out to both counterparts.
    pub async fn handle_init_multisig_request(
        &self,
        request: InitMultisigRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        self.verify_trade_id(&request.trade_id)?;
        let mut trade = self.trade.lock().await;
        Self::verify_sender(
            &trade,
            sender,
            &[
                &trade.maker.node_address,
                &trade.taker.node_address,
                &trade.arbitrator.node_address,
            ],
        )?;

        let result = self.process_init_multisig(&mut trade, &request, sender).await;
        let (success, error_message) = ack_fields(&result);
        self.send_ack(&trade, sender, &request.uid, "InitMultisigRequest", success, error_message)
            .await;
        self.ctx.persistence.request_persistence();
        result
    }

    async fn process_init_multisig(
        &self,
        trade: &mut Trade,
        request: &InitMultisigRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        let sender_party = party_mut_by_address(trade, sender)
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown sender {}", sender)))?;
        if let Some(hex) = &request.prepared_multisig_hex {
            sender_party.prepared_multisig_hex = Some(hex.clone());
        }
        if let Some(hex) = &request.made_multisig_hex {
            sender_party.made_multisig_hex = Some(hex.clone());
        }
        if let Some(hex) = &request.exchanged_multisig_hex {
            sender_party.exchanged_multisig_hex = Some(hex.clone());
        }

        // Import the freshest material we were given, then answer with our
        // own export so the three wallets converge.
        let incoming = request
            .exchanged_multisig_hex
            .as_ref()
            .or(request.made_multisig_hex.as_ref())
            .or(request.prepared_multisig_hex.as_ref());
        let Some(incoming) = incoming else {
            return Err(Error::InvalidInput(
                "init multisig request carries no key material".to_string(),
            ));
        };

        let wallet = self.ctx.wallet_service.get_multisig_wallet(&trade.id).await?;
        wallet.import_multisig_hex(incoming).await?;
        let own_hex = wallet.get_multisig_hex().await?;
        self.ctx.wallet_service.close_multisig_wallet(&trade.id).await?;
        trade.self_party_mut().prepared_multisig_hex = Some(own_hex.clone());

        let reply = InitMultisigRequest {
            trade_id: trade.id.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
            prepared_multisig_hex: Some(own_hex),
            made_multisig_hex: None,
            exchanged_multisig_hex: None,
        };
        self.send_to_other_parties(trade, TradeMessage::InitMultisigRequest(reply), Some(sender))
            .await;
        Ok(())
    }

    /// Submit this trader's contract inputs to the other parties. Called
    /// once the local wallet has the deposit ready; the counterpart answers
    /// through `handle_sign_contract_request` / `handle_sign_contract_response`.
    pub async fn send_sign_contract_request(
        &self,
        payment_account_payload_hash: String,
        payout_address: String,
        deposit_tx_id: Option<String>,
    ) -> Result<()> {
        if self.role == TradeRole::Arbitrator {
            return Err(Error::ProtocolViolation(
                "arbitrator does not submit contract inputs".to_string(),
            ));
        }
        let mut trade = self.trade.lock().await;
        {
            let own = trade.self_party_mut();
            own.payment_account_payload_hash = Some(payment_account_payload_hash.clone());
            own.payout_address = Some(payout_address.clone());
            if let Some(tx_id) = &deposit_tx_id {
                own.deposit_tx_id = Some(tx_id.clone());
            }
        }
        let request = SignContractRequest {
            trade_id: trade.id.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
            payment_account_payload_hash,
            payout_address,
            deposit_tx_id,
        };
        self.send_to_other_parties(&trade, TradeMessage::SignContractRequest(request), None)
            .await;
        self.ctx.persistence.request_persistence();
        Ok(())
    }

    /// A counterpart submitted its contract inputs; once both traders'
    /// inputs are present the contract is built and, on trader seats,
    /// signed.
    pub async fn handle_sign_contract_request(
        &self,
        request: SignContractRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        self.verify_trade_id(&request.trade_id)?;
        let mut trade = self.trade.lock().await;
        Self::verify_sender(
            &trade,
            sender,
            &[&trade.maker.node_address, &trade.taker.node_address],
        )?;

        let result = self.process_sign_contract_request(&mut trade, &request, sender).await;
        let (success, error_message) = ack_fields(&result);
        self.send_ack(&trade, sender, &request.uid, "SignContractRequest", success, error_message)
            .await;
        self.ctx.persistence.request_persistence();
        result
    }

    async fn process_sign_contract_request(
        &self,
        trade: &mut Trade,
        request: &SignContractRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        {
            let sender_party = party_mut_by_address(trade, sender)
                .ok_or_else(|| Error::ProtocolViolation(format!("unknown sender {}", sender)))?;
            sender_party.payment_account_payload_hash =
                Some(request.payment_account_payload_hash.clone());
            sender_party.payout_address = Some(request.payout_address.clone());
            if let Some(tx_id) = &request.deposit_tx_id {
                sender_party.deposit_tx_id = Some(tx_id.clone());
            }
        }

        let (Some(maker_hash), Some(taker_hash)) = (
            trade.maker.payment_account_payload_hash.clone(),
            trade.taker.payment_account_payload_hash.clone(),
        ) else {
            // Wait for the other trader's request.
            return Ok(());
        };

        if trade.contract.is_none() {
            let contract = build_contract(trade, &maker_hash, &taker_hash)?;
            trade.contract_hash = Some(contract.hash()?);
            trade.contract_as_json = Some(contract.to_canonical_json()?);
            trade.contract = Some(contract);
            info!(trade_id = %trade.id, "contract built from both traders' inputs");
        }

        if self.role != TradeRole::Arbitrator {
            let contract = trade
                .contract
                .clone()
                .ok_or_else(|| Error::Internal("contract missing after build".to_string()))?;
            let signature = contract.sign(&self.ctx.key_ring)?;
            trade.self_party_mut().contract_signature = Some(signature.clone());
            let response = SignContractResponse {
                trade_id: trade.id.clone(),
                uid: uuid::Uuid::new_v4().to_string(),
                contract_signature: signature,
            };
            self.send_to_other_parties(trade, TradeMessage::SignContractResponse(response), None)
                .await;
        }
        Ok(())
    }

    /// Countersignature from the peer trader. Trader seats only.
    pub async fn handle_sign_contract_response(
        &self,
        response: SignContractResponse,
        sender: &NodeAddress,
    ) -> Result<()> {
        if self.role == TradeRole::Arbitrator {
            return Err(Error::ProtocolViolation(
                "arbitrator received SignContractResponse".to_string(),
            ));
        }
        self.verify_trade_id(&response.trade_id)?;
        let mut trade = self.trade.lock().await;
        Self::verify_sender(
            &trade,
            sender,
            &[&trade.maker.node_address, &trade.taker.node_address],
        )?;

        let result = self
            .process_sign_contract_response(&mut trade, &response, sender)
            .await;
        let (success, error_message) = ack_fields(&result);
        self.send_ack(&trade, sender, &response.uid, "SignContractResponse", success, error_message)
            .await;
        self.ctx.persistence.request_persistence();
        result
    }

    async fn process_sign_contract_response(
        &self,
        trade: &mut Trade,
        response: &SignContractResponse,
        sender: &NodeAddress,
    ) -> Result<()> {
        let contract = trade
            .contract
            .clone()
            .ok_or_else(|| Error::ProtocolViolation("no contract to verify against".to_string()))?;
        {
            let sender_party = party_mut_by_address(trade, sender)
                .ok_or_else(|| Error::ProtocolViolation(format!("unknown sender {}", sender)))?;
            let signer = sender_party.pub_key_ring.clone().ok_or_else(|| {
                Error::ProtocolViolation(format!("no pub key ring for sender {}", sender))
            })?;
            contract.verify_signature(&signer, &response.contract_signature)?;
            sender_party.contract_signature = Some(response.contract_signature.clone());
        }

        // With both signatures in place the deposit can be requested from
        // the arbitrator.
        let both_signed =
            trade.maker.contract_signature.is_some() && trade.taker.contract_signature.is_some();
        if both_signed && trade.phase() < TradePhase::DepositRequested {
            self.apply_phase(trade, TradePhase::DepositRequested)?;
            let own_signature = trade
                .self_party()
                .contract_signature
                .clone()
                .ok_or_else(|| Error::Internal("own contract signature missing".to_string()))?;
            let deposit_tx_hex = trade
                .self_party()
                .deposit_tx_hex
                .clone()
                .or_else(|| trade.self_party().reserve_tx_hex.clone())
                .ok_or_else(|| Error::Internal("no deposit tx to send".to_string()))?;
            let deposit_tx_key = trade
                .self_party()
                .deposit_tx_key
                .clone()
                .or_else(|| trade.self_party().reserve_tx_key.clone())
                .unwrap_or_default();
            let request = crate::messages::DepositRequest {
                trade_id: trade.id.clone(),
                uid: uuid::Uuid::new_v4().to_string(),
                contract_signature: own_signature,
                deposit_tx_hex,
                deposit_tx_key,
            };
            self.send_to_arbitrator(trade, TradeMessage::DepositRequest(request)).await;
        }
        Ok(())
    }

    /// Arbitrator response after publishing the deposits. Trader seats only.
    pub async fn handle_deposit_response(
        &self,
        response: DepositResponse,
        sender: &NodeAddress,
    ) -> Result<()> {
        if self.role == TradeRole::Arbitrator {
            return Err(Error::ProtocolViolation(
                "arbitrator received DepositResponse".to_string(),
            ));
        }
        self.verify_trade_id(&response.trade_id)?;
        let mut trade = self.trade.lock().await;
        Self::verify_sender(&trade, sender, &[&trade.arbitrator.node_address])?;

        let result = self.process_deposit_response(&mut trade, &response).await;
        let (success, error_message) = ack_fields(&result);
        self.send_ack(&trade, sender, &response.uid, "DepositResponse", success, error_message)
            .await;
        self.ctx.persistence.request_persistence();
        result
    }

    async fn process_deposit_response(
        &self,
        trade: &mut Trade,
        response: &DepositResponse,
    ) -> Result<()> {
        if let Some(error) = &response.error_message {
            // The arbitrator could not publish; funds may or may not be
            // locked, so the trade is flagged rather than removed.
            warn!(trade_id = %trade.id, error = %error, "deposit publishing failed");
            trade.error_message = Some(error.clone());
            return Err(Error::ProtocolViolation(error.clone()));
        }
        self.apply_phase(trade, TradePhase::DepositsPublished)?;
        Ok(())
    }

    /// Payment account key handed out by the arbitrator. Trader seats only.
    pub async fn handle_payment_account_key_response(
        &self,
        response: PaymentAccountKeyResponse,
        sender: &NodeAddress,
    ) -> Result<()> {
        if self.role == TradeRole::Arbitrator {
            return Err(Error::ProtocolViolation(
                "arbitrator received PaymentAccountKeyResponse".to_string(),
            ));
        }
        self.verify_trade_id(&response.trade_id)?;
        let mut trade = self.trade.lock().await;
        Self::verify_sender(&trade, sender, &[&trade.arbitrator.node_address])?;

        let counterparty = match trade.role() {
            TradeRole::Maker => &mut trade.taker,
            _ => &mut trade.maker,
        };
        counterparty.payment_account_key = Some(response.payment_account_key.clone());
        self.ctx.persistence.request_persistence();
        Ok(())
    }

    /// Multisig state sync after a counterpart mutated the shared wallet.
    pub async fn handle_update_multisig_request(
        &self,
        request: UpdateMultisigRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        self.verify_trade_id(&request.trade_id)?;
        let mut trade = self.trade.lock().await;
        Self::verify_sender(
            &trade,
            sender,
            &[
                &trade.maker.node_address,
                &trade.taker.node_address,
                &trade.arbitrator.node_address,
            ],
        )?;

        let result = self.process_update_multisig(&mut trade, &request, sender).await;
        let (success, error_message) = ack_fields(&result);
        self.send_ack(&trade, sender, &request.uid, "UpdateMultisigRequest", success, error_message)
            .await;
        self.ctx.persistence.request_persistence();
        result
    }

    async fn process_update_multisig(
        &self,
        trade: &mut Trade,
        request: &UpdateMultisigRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        let wallet = self.ctx.wallet_service.get_multisig_wallet(&trade.id).await?;
        wallet.import_multisig_hex(&request.updated_multisig_hex).await?;
        let own_hex = wallet.get_multisig_hex().await?;
        self.ctx.wallet_service.close_multisig_wallet(&trade.id).await?;

        if let Some(party) = party_mut_by_address(trade, sender) {
            party.updated_multisig_hex = Some(request.updated_multisig_hex.clone());
        }

        let response = UpdateMultisigResponse {
            trade_id: trade.id.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
            updated_multisig_hex: own_hex,
        };
        if let Some(pub_key_ring) = Self::pub_key_ring_of(trade, sender) {
            self.ctx
                .messenger
                .send_direct_message(sender, &pub_key_ring, TradeMessage::UpdateMultisigResponse(response))
                .await?;
        }
        Ok(())
    }

    pub async fn handle_update_multisig_response(
        &self,
        response: UpdateMultisigResponse,
        sender: &NodeAddress,
    ) -> Result<()> {
        self.verify_trade_id(&response.trade_id)?;
        let trade = self.trade.lock().await;
        Self::verify_sender(
            &trade,
            sender,
            &[
                &trade.maker.node_address,
                &trade.taker.node_address,
                &trade.arbitrator.node_address,
            ],
        )?;
        drop(trade);

        let wallet = self.ctx.wallet_service.get_multisig_wallet(&self.trade.id).await?;
        wallet.import_multisig_hex(&response.updated_multisig_hex).await?;
        self.ctx.wallet_service.close_multisig_wallet(&self.trade.id).await?;
        self.ctx.persistence.request_persistence();
        Ok(())
    }

    // ========================================================================
    // Send helpers
    // ========================================================================

    /// Send `message` to every other party with a known address, optionally
    /// skipping one (usually the sender being answered separately).
    pub(crate) async fn send_to_other_parties(
        &self,
        trade: &Trade,
        message: TradeMessage,
        skip: Option<&NodeAddress>,
    ) {
        for party in [&trade.maker, &trade.taker, &trade.arbitrator] {
            let (Some(address), Some(pub_key_ring)) = (&party.node_address, &party.pub_key_ring)
            else {
                continue;
            };
            if address == &self.ctx.own_address || Some(address) == skip {
                continue;
            }
            if let Err(e) = self
                .ctx
                .messenger
                .send_direct_message(address, pub_key_ring, message.clone())
                .await
            {
                warn!(trade_id = %trade.id, peer = %address, error = %e, "failed to send {}", message.name());
            }
        }
    }

    pub(crate) async fn send_to_arbitrator(&self, trade: &Trade, message: TradeMessage) {
        let (Some(address), Some(pub_key_ring)) =
            (&trade.arbitrator.node_address, &trade.arbitrator.pub_key_ring)
        else {
            warn!(trade_id = %trade.id, "arbitrator address unknown, cannot send {}", message.name());
            return;
        };
        if let Err(e) = self
            .ctx
            .messenger
            .send_direct_message(address, pub_key_ring, message.clone())
            .await
        {
            warn!(trade_id = %trade.id, error = %e, "failed to send {} to arbitrator", message.name());
        }
    }
}

/// Success flag and error text for the ack of a processed message.
fn ack_fields(result: &Result<()>) -> (bool, Option<String>) {
    match result {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    }
}

pub(crate) fn party_mut_by_address<'a>(
    trade: &'a mut Trade,
    address: &NodeAddress,
) -> Option<&'a mut crate::trade::TradeParty> {
    if trade.maker.node_address.as_ref() == Some(address) {
        Some(&mut trade.maker)
    } else if trade.taker.node_address.as_ref() == Some(address) {
        Some(&mut trade.taker)
    } else if trade.arbitrator.node_address.as_ref() == Some(address) {
        Some(&mut trade.arbitrator)
    } else {
        None
    }
}

/// Assemble the contract once both traders' inputs are known.
fn build_contract(trade: &Trade, maker_hash: &str, taker_hash: &str) -> Result<Contract> {
    let maker_is_buyer = trade.offer.is_buy_offer();
    let (buyer, seller) = if maker_is_buyer {
        (&trade.maker, &trade.taker)
    } else {
        (&trade.taker, &trade.maker)
    };
    let missing = |what: &str| Error::ProtocolViolation(format!("{} missing for contract", what));
    Ok(Contract {
        offer_id: trade.offer.id.clone(),
        offer_direction: trade.offer.direction,
        currency_code: trade.offer.currency_code.clone(),
        trade_amount: trade.amount,
        trade_price: trade.price,
        buyer_security_deposit: trade.offer.buyer_security_deposit,
        seller_security_deposit: trade.offer.seller_security_deposit,
        buyer_node_address: buyer.node_address.clone().ok_or_else(|| missing("buyer address"))?,
        seller_node_address: seller.node_address.clone().ok_or_else(|| missing("seller address"))?,
        buyer_pub_key_ring: buyer.pub_key_ring.clone().ok_or_else(|| missing("buyer keys"))?,
        seller_pub_key_ring: seller.pub_key_ring.clone().ok_or_else(|| missing("seller keys"))?,
        buyer_payout_address: buyer
            .payout_address
            .clone()
            .ok_or_else(|| missing("buyer payout address"))?,
        seller_payout_address: seller
            .payout_address
            .clone()
            .ok_or_else(|| missing("seller payout address"))?,
        arbitrator_node_address: trade
            .arbitrator
            .node_address
            .clone()
            .ok_or_else(|| missing("arbitrator address"))?,
        maker_payment_account_payload_hash: maker_hash.to_string(),
        taker_payment_account_payload_hash: taker_hash.to_string(),
        use_market_based_price: trade.offer.use_market_based_price,
        market_price_margin_pct: trade.offer.market_price_margin_pct,
    })
}
