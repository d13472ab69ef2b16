//! Taker side of the trade protocol
//!
//! The taker starts a trade: after the manager's availability round trip
//! succeeds, `on_take_offer` announces the taker to the arbitrator that
//! signed the offer. Everything after that is driven by inbound messages.

use tracing::info;

use monero_dex_common::{Error, Result};

use crate::messages::{InitTradeRequest, TradeMessage};
use crate::trade::protocol::TradeProtocol;
use crate::trade::TradeRole;

impl TradeProtocol {
    /// Kick off the protocol for a freshly constructed taker trade. Fails
    /// if the arbitrator is unreachable; the caller then removes the trade
    /// and reports the fault.
    pub async fn on_take_offer(&self, payment_account_payload_hash: String) -> Result<()> {
        if self.role() != TradeRole::Taker {
            return Err(Error::ProtocolViolation(
                "on_take_offer called on non-taker protocol".to_string(),
            ));
        }
        let trade = self.trade().clone();
        let mut trade = trade.lock().await;

        trade.taker.node_address = Some(self.ctx.own_address.clone());
        trade.taker.pub_key_ring = Some(self.own_pub_key_ring().clone());
        trade.taker.payment_account_payload_hash = Some(payment_account_payload_hash.clone());
        trade.maker.node_address = Some(trade.offer.owner_node_address.clone());
        trade.maker.pub_key_ring = Some(trade.offer.pub_key_ring.clone());

        let (Some(arbitrator_address), Some(arbitrator_pub_key_ring)) = (
            trade.arbitrator.node_address.clone(),
            trade.arbitrator.pub_key_ring.clone(),
        ) else {
            return Err(Error::Internal(
                "taker trade has no arbitrator assigned".to_string(),
            ));
        };

        let request = InitTradeRequest {
            trade_id: trade.id.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
            sender_pub_key_ring: self.own_pub_key_ring().clone(),
            trade_amount: trade.amount,
            trade_price: trade.price,
            maker_node_address: trade.offer.owner_node_address.clone(),
            taker_node_address: self.ctx.own_address.clone(),
            arbitrator_node_address: arbitrator_address.clone(),
            payment_account_payload_hash,
        };
        info!(trade_id = %trade.id, arbitrator = %arbitrator_address, "taking offer");
        self.ctx
            .messenger
            .send_direct_message(
                &arbitrator_address,
                &arbitrator_pub_key_ring,
                TradeMessage::InitTradeRequest(request),
            )
            .await?;
        self.persistence().request_persistence();
        Ok(())
    }
}
