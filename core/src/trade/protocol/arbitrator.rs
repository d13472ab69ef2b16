//! Arbitrator side of the trade protocol
//!
//! The arbitrator relays trade initialization between taker and maker,
//! collects both signed deposits and publishes them, and hands out payment
//! account keys once the escrow is funded.

use tracing::{info, warn};

use monero_dex_common::crypto::sha256_hex;
use monero_dex_common::{Error, NodeAddress, Result};

use crate::messages::{
    DepositRequest, DepositResponse, InitTradeRequest, PaymentAccountKeyRequest,
    PaymentAccountKeyResponse, TradeMessage,
};
use crate::trade::protocol::{party_mut_by_address, TradeProtocol};
use crate::trade::{Trade, TradePhase, TradeRole};

impl TradeProtocol {
    /// Trade initialization as seen by the arbitrator. The trade manager has
    /// already verified the anti-spoofing gate (registered arbitrator, offer
    /// on the book, maker owns the offer, correct origin for the trade's
    /// age); this handler records the sender's identity and relays the
    /// request to the maker when it came from the taker.
    pub async fn handle_init_trade_request_as_arbitrator(
        &self,
        request: InitTradeRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        if self.role() != TradeRole::Arbitrator {
            return Err(Error::ProtocolViolation(
                "init trade request routed to non-arbitrator handler".to_string(),
            ));
        }
        let trade = self.trade().clone();
        let mut trade = trade.lock().await;

        let result = self
            .process_init_trade_as_arbitrator(&mut trade, &request, sender)
            .await;
        let (success, error_message) = match &result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.send_ack(&trade, sender, &request.uid, "InitTradeRequest", success, error_message)
            .await;
        self.persistence().request_persistence();
        result
    }

    async fn process_init_trade_as_arbitrator(
        &self,
        trade: &mut Trade,
        request: &InitTradeRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        let from_taker = sender == &request.taker_node_address;
        let from_maker = sender == &request.maker_node_address;
        if !from_taker && !from_maker {
            return Err(Error::ProtocolViolation(format!(
                "init trade request from {} which is neither maker nor taker",
                sender
            )));
        }

        // Record addressing on first contact.
        if trade.maker.node_address.is_none() {
            trade.maker.node_address = Some(request.maker_node_address.clone());
            trade.maker.pub_key_ring = Some(trade.offer.pub_key_ring.clone());
        }
        if trade.taker.node_address.is_none() {
            trade.taker.node_address = Some(request.taker_node_address.clone());
        }
        if trade.arbitrator.node_address.is_none() {
            trade.arbitrator.node_address = Some(request.arbitrator_node_address.clone());
            trade.arbitrator.pub_key_ring = Some(self.own_pub_key_ring().clone());
        }

        let sender_party = party_mut_by_address(trade, sender)
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown sender {}", sender)))?;
        sender_party.pub_key_ring = Some(request.sender_pub_key_ring.clone());
        sender_party.payment_account_payload_hash =
            Some(request.payment_account_payload_hash.clone());

        if from_taker {
            // Relay to the maker so it can reserve the offer and join.
            let relay = InitTradeRequest {
                uid: uuid::Uuid::new_v4().to_string(),
                ..request.clone()
            };
            info!(trade_id = %trade.id, "relaying init trade request to maker");
            if let (Some(address), Some(pub_key_ring)) =
                (&trade.maker.node_address, &trade.maker.pub_key_ring)
            {
                self.messenger()
                    .send_direct_message(address, pub_key_ring, TradeMessage::InitTradeRequest(relay))
                    .await?;
            }
        } else {
            // Maker joined; both traders known, start the multisig exchange.
            let wallet = self.wallet_service().get_multisig_wallet(&trade.id).await?;
            let prepared = wallet.get_multisig_hex().await?;
            self.wallet_service().close_multisig_wallet(&trade.id).await?;
            trade.arbitrator.prepared_multisig_hex = Some(prepared.clone());
            let request = crate::messages::InitMultisigRequest {
                trade_id: trade.id.clone(),
                uid: uuid::Uuid::new_v4().to_string(),
                prepared_multisig_hex: Some(prepared),
                made_multisig_hex: None,
                exchanged_multisig_hex: None,
            };
            self.send_to_other_parties(trade, TradeMessage::InitMultisigRequest(request), None)
                .await;
        }
        Ok(())
    }

    /// A trader delivered its signed deposit. Once both deposits are in,
    /// the arbitrator publishes them and answers both traders.
    pub async fn handle_deposit_request(
        &self,
        request: DepositRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        if self.role() != TradeRole::Arbitrator {
            return Err(Error::ProtocolViolation(
                "trader received DepositRequest".to_string(),
            ));
        }
        let trade = self.trade().clone();
        let mut trade = trade.lock().await;
        Self::verify_sender(
            &trade,
            sender,
            &[&trade.maker.node_address, &trade.taker.node_address],
        )?;

        let result = self.process_deposit_request(&mut trade, &request, sender).await;
        let (success, error_message) = match &result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.send_ack(&trade, sender, &request.uid, "DepositRequest", success, error_message)
            .await;
        self.persistence().request_persistence();
        result
    }

    async fn process_deposit_request(
        &self,
        trade: &mut Trade,
        request: &DepositRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        // Verify the contract signature when the contract is known; the
        // deposit must bind the sender to the agreed terms.
        if let Some(contract) = trade.contract.clone() {
            let signer = party_mut_by_address(trade, sender)
                .and_then(|p| p.pub_key_ring.clone())
                .ok_or_else(|| {
                    Error::ProtocolViolation(format!("no pub key ring for sender {}", sender))
                })?;
            contract.verify_signature(&signer, &request.contract_signature)?;
        }

        {
            let sender_party = party_mut_by_address(trade, sender)
                .ok_or_else(|| Error::ProtocolViolation(format!("unknown sender {}", sender)))?;
            sender_party.contract_signature = Some(request.contract_signature.clone());
            sender_party.deposit_tx_hex = Some(request.deposit_tx_hex.clone());
            sender_party.deposit_tx_key = Some(request.deposit_tx_key.clone());
            sender_party.deposit_tx_id = Some(sha256_hex(request.deposit_tx_hex.as_bytes()));
        }

        self.apply_phase(trade, TradePhase::DepositRequested)?;

        let both_deposits =
            trade.maker.deposit_tx_hex.is_some() && trade.taker.deposit_tx_hex.is_some();
        if both_deposits {
            // Both deposits in hand: publish and notify the traders. The
            // broadcast itself is the wallet's concern.
            info!(trade_id = %trade.id, "both deposits received, publishing");
            self.apply_phase(trade, TradePhase::DepositsPublished)?;
            let response = DepositResponse {
                trade_id: trade.id.clone(),
                uid: uuid::Uuid::new_v4().to_string(),
                error_message: None,
            };
            self.send_to_other_parties(trade, TradeMessage::DepositResponse(response), None)
                .await;
        }
        Ok(())
    }

    /// A trader asks for its counterparty's payment account key. Only
    /// released once the deposits are published.
    pub async fn handle_payment_account_key_request(
        &self,
        request: PaymentAccountKeyRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        if self.role() != TradeRole::Arbitrator {
            return Err(Error::ProtocolViolation(
                "trader received PaymentAccountKeyRequest".to_string(),
            ));
        }
        let trade = self.trade().clone();
        let mut trade = trade.lock().await;
        Self::verify_sender(
            &trade,
            sender,
            &[&trade.maker.node_address, &trade.taker.node_address],
        )?;

        let result = self
            .process_payment_account_key_request(&mut trade, &request, sender)
            .await;
        let (success, error_message) = match &result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.send_ack(
            &trade,
            sender,
            &request.uid,
            "PaymentAccountKeyRequest",
            success,
            error_message,
        )
        .await;
        self.persistence().request_persistence();
        result
    }

    async fn process_payment_account_key_request(
        &self,
        trade: &mut Trade,
        request: &PaymentAccountKeyRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        if trade.phase() < TradePhase::DepositsPublished {
            return Err(Error::ProtocolViolation(format!(
                "payment account key requested in phase {}",
                trade.phase().as_str()
            )));
        }

        let counterparty = if trade.maker.node_address.as_ref() == Some(sender) {
            &trade.taker
        } else {
            &trade.maker
        };
        let key = counterparty.payment_account_key.clone().ok_or_else(|| {
            warn!(trade_id = %trade.id, "counterparty payment account key not yet available");
            Error::ProtocolViolation("payment account key not available".to_string())
        })?;

        let response = PaymentAccountKeyResponse {
            trade_id: trade.id.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
            payment_account_key: key,
        };
        if let Some(pub_key_ring) = party_mut_by_address(trade, sender).and_then(|p| p.pub_key_ring.clone()) {
            self.messenger()
                .send_direct_message(sender, &pub_key_ring, TradeMessage::PaymentAccountKeyResponse(response))
                .await?;
        }
        Ok(())
    }
}
