//! Maker side of the trade protocol
//!
//! The maker only ever hears about a new trade from an arbitrator it
//! accepts. The open offer is reserved by the trade manager before this
//! handler runs; a failure here makes the manager roll the reservation
//! back.

use tracing::info;

use monero_dex_common::{Error, NodeAddress, Result};

use crate::messages::{InitTradeRequest, TradeMessage};
use crate::trade::protocol::TradeProtocol;
use crate::trade::{Trade, TradeRole};

impl TradeProtocol {
    /// Trade initialization as seen by the maker. `arbitrator_pub_key_ring`
    /// is the identity of the accepted arbitrator the manager matched the
    /// sender against.
    pub async fn handle_init_trade_request_as_maker(
        &self,
        request: InitTradeRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        if self.role() != TradeRole::Maker {
            return Err(Error::ProtocolViolation(
                "init trade request routed to non-maker handler".to_string(),
            ));
        }
        let trade = self.trade().clone();
        let mut trade = trade.lock().await;

        let result = self.process_init_trade_as_maker(&mut trade, &request, sender).await;
        let (success, error_message) = match &result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.send_ack(&trade, sender, &request.uid, "InitTradeRequest", success, error_message)
            .await;
        self.persistence().request_persistence();
        result
    }

    async fn process_init_trade_as_maker(
        &self,
        trade: &mut Trade,
        request: &InitTradeRequest,
        sender: &NodeAddress,
    ) -> Result<()> {
        // The request must come through the arbitrator the trade was set up
        // with (the manager stored it before handing over).
        if trade.arbitrator.node_address.as_ref() != Some(sender) {
            return Err(Error::ProtocolViolation(format!(
                "init trade request from {} instead of the accepted arbitrator",
                sender
            )));
        }
        if request.maker_node_address != self.ctx.own_address {
            return Err(Error::ProtocolViolation(
                "init trade request names a different maker".to_string(),
            ));
        }

        // Record the taker; its identity travels inside the relayed request.
        trade.taker.node_address = Some(request.taker_node_address.clone());
        trade.taker.pub_key_ring = Some(request.sender_pub_key_ring.clone());
        trade.taker.payment_account_payload_hash =
            Some(request.payment_account_payload_hash.clone());

        trade.maker.node_address = Some(self.ctx.own_address.clone());
        trade.maker.pub_key_ring = Some(self.own_pub_key_ring().clone());

        // Announce ourselves to the arbitrator so it has both traders'
        // identities on file.
        let own_request = InitTradeRequest {
            trade_id: trade.id.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
            sender_pub_key_ring: self.own_pub_key_ring().clone(),
            trade_amount: trade.amount,
            trade_price: trade.price,
            maker_node_address: request.maker_node_address.clone(),
            taker_node_address: request.taker_node_address.clone(),
            arbitrator_node_address: request.arbitrator_node_address.clone(),
            payment_account_payload_hash: trade
                .maker
                .payment_account_payload_hash
                .clone()
                .unwrap_or_default(),
        };
        info!(trade_id = %trade.id, "maker joining trade via arbitrator");
        self.send_to_arbitrator(trade, TradeMessage::InitTradeRequest(own_request)).await;
        Ok(())
    }
}
