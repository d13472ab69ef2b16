//! Trade registry and message dispatch
//!
//! Owns the list of open trades, the per-uid protocol cache and the
//! closed/failed sub-registries. Inbound direct messages are resolved to a
//! protocol instance here; the registry lock only guards membership, never
//! trade mutation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use monero_dex_common::{Error, KeyRing, NodeAddress, Result};
use monero_dex_wallet::{MultisigWalletService, OutputQuery};

use crate::config::ProtocolConfig;
use crate::mailbox::DirectMessenger;
use crate::messages::{InitTradeRequest, TradeMessage};
use crate::offer::{Offer, OfferBookService, OpenOfferManager, OpenOfferState};
use crate::services::{ArbitratorService, NotificationService, PersistenceRequester};
use crate::trade::protocol::{ProtocolContext, TradeProtocol};
use crate::trade::{
    Trade, TradeDisputeState, TradeHandle, TradePeriodState, TradePhase, TradeVariant,
};

/// Callback invoked when an inbound trade-initialization path fails after
/// the caller has already gone away.
pub type InitTradeErrorHandler = Box<dyn Fn(&str, &str) + Send + Sync>;

pub struct TradeManager {
    ctx: Arc<ProtocolContext>,
    offer_book: Arc<dyn OfferBookService>,
    open_offer_manager: Arc<dyn OpenOfferManager>,
    arbitrator_service: Arc<dyn ArbitratorService>,

    tradable_list: Mutex<Vec<Arc<TradeHandle>>>,
    closed_trades: Mutex<Vec<Arc<TradeHandle>>>,
    failed_trades: Mutex<Vec<Arc<TradeHandle>>>,
    protocol_by_uid: Mutex<HashMap<Uuid, Arc<TradeProtocol>>>,
    persisted_trades_initialized: AtomicBool,
    init_trade_error_handler: Mutex<Option<InitTradeErrorHandler>>,
}

impl TradeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key_ring: Arc<KeyRing>,
        own_address: NodeAddress,
        messenger: Arc<dyn DirectMessenger>,
        wallet_service: Arc<dyn MultisigWalletService>,
        persistence: Arc<dyn PersistenceRequester>,
        notifications: Arc<dyn NotificationService>,
        offer_book: Arc<dyn OfferBookService>,
        open_offer_manager: Arc<dyn OpenOfferManager>,
        arbitrator_service: Arc<dyn ArbitratorService>,
        config: ProtocolConfig,
    ) -> Self {
        let ctx = Arc::new(ProtocolContext {
            key_ring,
            own_address,
            messenger,
            wallet_service,
            persistence,
            notifications,
            config,
        });
        Self {
            ctx,
            offer_book,
            open_offer_manager,
            arbitrator_service,
            tradable_list: Mutex::new(Vec::new()),
            closed_trades: Mutex::new(Vec::new()),
            failed_trades: Mutex::new(Vec::new()),
            protocol_by_uid: Mutex::new(HashMap::new()),
            persisted_trades_initialized: AtomicBool::new(false),
            init_trade_error_handler: Mutex::new(None),
        }
    }

    pub fn request_persistence(&self) {
        self.ctx.persistence.request_persistence();
    }

    pub async fn set_init_trade_error_handler(&self, handler: InitTradeErrorHandler) {
        *self.init_trade_error_handler.lock().await = Some(handler);
    }

    async fn report_init_trade_error(&self, trade_id: &str, message: &str) {
        if let Some(handler) = self.init_trade_error_handler.lock().await.as_ref() {
            handler(trade_id, message);
        }
    }

    // ========================================================================
    // Protocol cache
    // ========================================================================

    /// The cached protocol for a trade, created on first use. Exactly one
    /// instance exists per trade uid for the process lifetime.
    pub async fn get_trade_protocol(&self, trade: &Arc<TradeHandle>) -> Arc<TradeProtocol> {
        let mut protocols = self.protocol_by_uid.lock().await;
        if let Some(existing) = protocols.get(&trade.uid) {
            return existing.clone();
        }
        let role = trade.lock().await.role();
        let protocol = Arc::new(TradeProtocol::new(role, trade.clone(), self.ctx.clone()));
        protocols.insert(trade.uid, protocol.clone());
        protocol
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Re-register persisted trades and open their multisig wallets in
    /// parallel, bounded to `min(init_pool_cap, n)` workers and an overall
    /// wait limit.
    pub async fn init_persisted_trades(&self, trades: Vec<Trade>) {
        let handles: Vec<Arc<TradeHandle>> = trades
            .into_iter()
            .map(|t| Arc::new(TradeHandle::new(t)))
            .collect();
        {
            let mut list = self.tradable_list.lock().await;
            list.extend(handles.iter().cloned());
        }

        if !handles.is_empty() {
            let cap = self.ctx.config.init_pool_cap.min(handles.len()).max(1);
            let semaphore = Arc::new(Semaphore::new(cap));
            let mut workers = Vec::with_capacity(handles.len());
            for handle in &handles {
                let handle = handle.clone();
                let semaphore = semaphore.clone();
                let wallet_service = self.ctx.wallet_service.clone();
                workers.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    let trade_id = handle.id.clone();
                    if let Err(e) = wallet_service.get_multisig_wallet(&trade_id).await {
                        warn!(trade_id = %trade_id, error = %e, "failed to open multisig wallet at startup");
                        return;
                    }
                    if let Err(e) = wallet_service.close_multisig_wallet(&trade_id).await {
                        warn!(trade_id = %trade_id, error = %e, "failed to close multisig wallet at startup");
                    }
                    handle.lock().await.is_initialized = true;
                }));
            }
            let join_all = async {
                for worker in workers {
                    let _ = worker.await;
                }
            };
            if tokio::time::timeout(self.ctx.config.init_wait(), join_all).await.is_err() {
                warn!("trade initialization did not finish within the wait bound");
            }
        }

        for handle in &handles {
            self.get_trade_protocol(handle).await;
        }
        self.persisted_trades_initialized.store(true, Ordering::SeqCst);
        self.request_persistence();

        // Repair any outputs left frozen by a crash.
        if let Err(e) = self.thaw_unreserved_outputs().await {
            warn!(error = %e, "startup output reconciliation failed");
        }
    }

    pub fn persisted_trades_initialized(&self) -> bool {
        self.persisted_trades_initialized.load(Ordering::SeqCst)
    }

    /// Thaw every frozen output that no open trade and no open offer still
    /// reserves. Repairs state after a crash between a reservation change
    /// and its persisted flush.
    pub async fn thaw_unreserved_outputs(&self) -> Result<()> {
        let mut reserved: HashSet<String> = HashSet::new();
        for handle in self.tradable_list.lock().await.iter() {
            let trade = handle.lock().await;
            reserved.extend(trade.self_party().reserve_tx_key_images.iter().cloned());
        }
        reserved.extend(self.open_offer_manager.reserved_key_images().await);

        let frozen = self
            .ctx
            .wallet_service
            .outputs(OutputQuery::frozen_unspent())
            .await?;
        for output in frozen {
            if !reserved.contains(&output.key_image) {
                info!(key_image = %output.key_image, "thawing output not reserved for any offer or trade");
                self.ctx.wallet_service.thaw_output(&output.key_image).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Message dispatch
    // ========================================================================

    /// Entry point for inbound direct messages, dispatched by concrete type.
    pub async fn on_direct_message(&self, message: TradeMessage, sender: NodeAddress) {
        let trade_id = message.trade_id().to_string();
        info!(
            message = message.name(),
            trade_id = %trade_id,
            uid = %message.uid(),
            peer = %sender,
            "received direct message"
        );

        if let TradeMessage::Ack(ack) = &message {
            info!(source_uid = %ack.source_uid, success = ack.success, "received ack");
            return;
        }

        if trade_id.trim().is_empty() {
            warn!(message = message.name(), "invalid message: empty trade id");
            return;
        }

        if let TradeMessage::InitTradeRequest(request) = message {
            self.handle_init_trade_request(request, sender).await;
            return;
        }

        let Some(trade) = self.get_open_trade(&trade_id).await else {
            // A multisig update without its trade means we lost track of a
            // funded wallet; everything else is droppable noise.
            if matches!(message, TradeMessage::UpdateMultisigRequest(_)) {
                error!(trade_id = %trade_id, "no trade for UpdateMultisigRequest");
            } else {
                warn!(trade_id = %trade_id, message = message.name(), "no trade with id");
            }
            return;
        };
        let protocol = self.get_trade_protocol(&trade).await;

        let result = match message {
            TradeMessage::InitMultisigRequest(m) => {
                protocol.handle_init_multisig_request(m, &sender).await
            }
            TradeMessage::SignContractRequest(m) => {
                protocol.handle_sign_contract_request(m, &sender).await
            }
            TradeMessage::SignContractResponse(m) => {
                protocol.handle_sign_contract_response(m, &sender).await
            }
            TradeMessage::DepositRequest(m) => protocol.handle_deposit_request(m, &sender).await,
            TradeMessage::DepositResponse(m) => protocol.handle_deposit_response(m, &sender).await,
            TradeMessage::PaymentAccountKeyRequest(m) => {
                protocol.handle_payment_account_key_request(m, &sender).await
            }
            TradeMessage::PaymentAccountKeyResponse(m) => {
                protocol.handle_payment_account_key_response(m, &sender).await
            }
            TradeMessage::UpdateMultisigRequest(m) => {
                protocol.handle_update_multisig_request(m, &sender).await
            }
            TradeMessage::UpdateMultisigResponse(m) => {
                protocol.handle_update_multisig_response(m, &sender).await
            }
            TradeMessage::InitTradeRequest(_) | TradeMessage::Ack(_) => Ok(()),
        };
        if let Err(e) = result {
            warn!(trade_id = %trade_id, error = %e, "message handling failed");
        }
    }

    /// Route an init-trade request: as arbitrator when the request names us
    /// as such, as maker otherwise. The origin checks here are the
    /// anti-spoofing gate keeping an unauthorized party from hijacking a
    /// trade id.
    async fn handle_init_trade_request(&self, request: InitTradeRequest, sender: NodeAddress) {
        if request.arbitrator_node_address == self.ctx.own_address {
            self.handle_init_trade_request_as_arbitrator(request, sender).await;
        } else {
            self.handle_init_trade_request_as_maker(request, sender).await;
        }
    }

    async fn handle_init_trade_request_as_arbitrator(
        &self,
        request: InitTradeRequest,
        sender: NodeAddress,
    ) {
        let trade_id = request.trade_id.clone();

        // We must be the registered arbitrator for this node.
        let registered = self.arbitrator_service.registered_arbitrator();
        if registered.map(|a| a.node_address) != Some(self.ctx.own_address.clone()) {
            warn!(trade_id = %trade_id, peer = %sender, "ignoring init trade request: we are not a registered arbitrator");
            return;
        }

        // The trade id must refer to an offer on the book.
        let Some(offer) = self.offer_book.offer(&trade_id).await else {
            warn!(trade_id = %trade_id, peer = %sender, "ignoring init trade request: no offer on the books");
            return;
        };

        // The claimed maker must own that offer.
        if offer.owner_node_address != request.maker_node_address {
            warn!(trade_id = %trade_id, peer = %sender, "ignoring init trade request: maker is not offer owner");
            return;
        }

        let trade = match self.get_open_trade(&trade_id).await {
            Some(existing) => {
                // Joining an existing trade is only valid for the maker.
                if sender != request.maker_node_address {
                    warn!(trade_id = %trade_id, peer = %sender, "trade is already taken");
                    return;
                }
                existing
            }
            None => {
                // A new trade must be started by the taker.
                if sender != request.taker_node_address {
                    warn!(trade_id = %trade_id, peer = %sender, "ignoring init trade request: new trade must come from taker");
                    return;
                }
                let mut trade = Trade::new(
                    offer.clone(),
                    TradeVariant::Arbitrator,
                    request.trade_amount,
                    request.trade_price,
                    offer.taker_fee,
                );
                if let Some(signed_offer) = self.open_offer_manager.signed_offer(&trade_id).await {
                    trade.maker.reserve_tx_hash = Some(signed_offer.reserve_tx_hash);
                }
                let handle = Arc::new(TradeHandle::new(trade));
                self.add_trade(handle.clone()).await;
                handle
            }
        };

        let protocol = self.get_trade_protocol(&trade).await;
        if let Err(e) = protocol
            .handle_init_trade_request_as_arbitrator(request, &sender)
            .await
        {
            warn!(trade_id = %trade_id, error = %e, "arbitrator error during trade initialization");
            self.maybe_remove_trade(&trade).await;
        }
        self.request_persistence();
    }

    async fn handle_init_trade_request_as_maker(
        &self,
        request: InitTradeRequest,
        sender: NodeAddress,
    ) {
        let trade_id = request.trade_id.clone();

        let Some(open_offer) = self.open_offer_manager.open_offer(&trade_id).await else {
            return;
        };
        if open_offer.state != OpenOfferState::Available {
            return;
        }

        // The request must come from an arbitrator this user accepts.
        let Some(arbitrator) = self.arbitrator_service.accepted_arbitrator_by_address(&sender)
        else {
            warn!(trade_id = %trade_id, peer = %sender, "ignoring init trade request: not from an accepted arbitrator");
            return;
        };

        if self.get_open_trade(&trade_id).await.is_some() {
            warn!(trade_id = %trade_id, "maker trade already exists, this should never happen");
            return;
        }

        // Take the offer off the book before the protocol continues.
        if let Err(e) = self.open_offer_manager.reserve_open_offer(&trade_id).await {
            warn!(trade_id = %trade_id, error = %e, "failed to reserve open offer");
            return;
        }

        let offer = open_offer.offer.clone();
        let variant = TradeVariant::maker_for(offer.is_buy_offer());
        let mut trade = Trade::new(offer.clone(), variant, offer.amount, offer.price, offer.maker_fee);
        trade.arbitrator.node_address = Some(sender.clone());
        trade.arbitrator.pub_key_ring = Some(arbitrator.pub_key_ring.clone());
        trade.maker.node_address = Some(self.ctx.own_address.clone());
        trade.maker.pub_key_ring = Some(self.ctx.key_ring.pub_key_ring().clone());
        trade.maker.reserve_tx_hash = open_offer.reserve_tx_hash.clone();
        trade.maker.reserve_tx_hex = open_offer.reserve_tx_hex.clone();
        trade.maker.reserve_tx_key = open_offer.reserve_tx_key.clone();
        trade.maker.reserve_tx_key_images = offer.reserve_tx_key_images.clone();
        let handle = Arc::new(TradeHandle::new(trade));
        self.add_trade(handle.clone()).await;

        let protocol = self.get_trade_protocol(&handle).await;
        if let Err(e) = protocol.handle_init_trade_request_as_maker(request, &sender).await {
            warn!(trade_id = %trade_id, error = %e, "maker error during trade initialization");
            // Roll the reservation back; the offer stays on the book.
            if let Err(e2) = self.open_offer_manager.unreserve_open_offer(&trade_id).await {
                warn!(trade_id = %trade_id, error = %e2, "failed to unreserve open offer");
            }
            self.maybe_remove_trade(&handle).await;
            self.report_init_trade_error(&trade_id, &e.to_string()).await;
        }
        self.request_persistence();
    }

    // ========================================================================
    // Take offer
    // ========================================================================

    /// Take an offer: availability round trip first, construct and register
    /// the trade only on success, then start the taker protocol. On a
    /// protocol fault the trade is removed again (no deposit can exist yet).
    pub async fn on_take_offer(
        &self,
        offer: Offer,
        payment_account_payload_hash: String,
        arbitrator_address: NodeAddress,
    ) -> Result<Arc<TradeHandle>> {
        if self.was_offer_already_used(&offer.id).await {
            return Err(Error::InvalidInput(format!(
                "offer {} was already used in a trade",
                offer.id
            )));
        }

        self.offer_book
            .check_offer_availability(&offer.id, &self.ctx.own_address)
            .await?;

        let Some(arbitrator) = self
            .arbitrator_service
            .accepted_arbitrator_by_address(&arbitrator_address)
        else {
            return Err(Error::InvalidInput(format!(
                "arbitrator {} is not accepted",
                arbitrator_address
            )));
        };

        let variant = TradeVariant::taker_for(offer.is_buy_offer());
        let mut trade = Trade::new(offer.clone(), variant, offer.amount, offer.price, offer.taker_fee);
        trade.arbitrator.node_address = Some(arbitrator.node_address.clone());
        trade.arbitrator.pub_key_ring = Some(arbitrator.pub_key_ring.clone());
        let handle = Arc::new(TradeHandle::new(trade));
        self.add_trade(handle.clone()).await;

        let protocol = self.get_trade_protocol(&handle).await;
        match protocol.on_take_offer(payment_account_payload_hash).await {
            Ok(()) => {
                self.request_persistence();
                Ok(handle)
            }
            Err(e) => {
                warn!(trade_id = %offer.id, error = %e, "taker error during trade initialization");
                self.maybe_remove_trade(&handle).await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn add_trade(&self, trade: Arc<TradeHandle>) {
        let mut list = self.tradable_list.lock().await;
        if !list.iter().any(|t| t.uid == trade.uid) {
            list.push(trade);
            self.request_persistence();
        }
    }

    /// Safe-deletion gate: a trade is only removed while no deposit can
    /// exist (phase < DepositRequested) or after the payout published.
    /// Anything in between may have funds locked in the multisig and is
    /// retained. Returns whether the trade was removed.
    pub async fn maybe_remove_trade(&self, trade: &Arc<TradeHandle>) -> bool {
        let mut list = self.tradable_list.lock().await;
        if !list.iter().any(|t| t.uid == trade.uid) {
            return false;
        }

        let guard = trade.lock().await;
        let phase = guard.phase();
        let deletable =
            phase < TradePhase::DepositRequested || phase >= TradePhase::PayoutPublished;
        if !deletable {
            warn!(
                trade_id = %trade.id,
                phase = phase.as_str(),
                "not deleting trade because its trade wallet might be funded"
            );
            return false;
        }

        list.retain(|t| t.uid != trade.uid);
        drop(list);

        // Thaw outputs the taker froze for this trade.
        if guard.role() == crate::trade::TradeRole::Taker {
            for key_image in &guard.self_party().reserve_tx_key_images {
                if let Err(e) = self.ctx.wallet_service.thaw_output(key_image).await {
                    warn!(trade_id = %trade.id, key_image = %key_image, error = %e, "failed to thaw output");
                }
            }
        }
        drop(guard);

        if self.ctx.wallet_service.multisig_wallet_exists(&trade.id).await {
            if let Err(e) = self.ctx.wallet_service.delete_multisig_wallet(&trade.id).await {
                warn!(trade_id = %trade.id, error = %e, "failed to delete multisig wallet");
            }
        } else {
            warn!(trade_id = %trade.id, "multisig wallet to delete does not exist");
        }

        self.protocol_by_uid.lock().await.remove(&trade.uid);
        self.request_persistence();
        true
    }

    /// Move a finished trade to the closed registry.
    pub async fn on_trade_completed(&self, trade: &Arc<TradeHandle>) {
        {
            let mut guard = trade.lock().await;
            guard.is_completed = true;
        }
        {
            let mut closed = self.closed_trades.lock().await;
            if !closed.iter().any(|t| t.uid == trade.uid) {
                closed.push(trade.clone());
            }
        }
        self.maybe_remove_trade(trade).await;
        self.request_persistence();
    }

    /// Completion entry point used by the dispute subsystem.
    pub async fn close_disputed_trade(&self, trade_id: &str, state: TradeDisputeState) {
        let Some(trade) = self.get_open_trade(trade_id).await else {
            return;
        };
        {
            let mut guard = trade.lock().await;
            guard.set_dispute_state(state);
        }
        self.on_trade_completed(&trade).await;
        self.request_persistence();
    }

    /// Quarantine a trade that failed after the point where funds may be
    /// locked. The trade is kept, flagged and moved aside; deleting it
    /// would mean losing track of a funded multisig.
    pub async fn on_move_invalid_trade_to_failed_trades(
        &self,
        trade: &Arc<TradeHandle>,
        reason: &str,
    ) {
        {
            let mut guard = trade.lock().await;
            guard.error_message = Some(reason.to_string());
        }
        {
            let mut list = self.tradable_list.lock().await;
            list.retain(|t| t.uid != trade.uid);
        }
        let mut failed = self.failed_trades.lock().await;
        if !failed.iter().any(|t| t.uid == trade.uid) {
            failed.push(trade.clone());
        }
        self.request_persistence();
    }

    /// Bring a failed trade with locked funds back into the pending list.
    pub async fn unfail_trade(&self, trade_id: &str) -> bool {
        let handle = {
            let failed = self.failed_trades.lock().await;
            failed.iter().find(|t| t.id == trade_id).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };
        {
            let mut failed = self.failed_trades.lock().await;
            failed.retain(|t| t.uid != handle.uid);
        }
        handle.lock().await.error_message = None;
        self.add_trade(handle).await;
        true
    }

    // ========================================================================
    // Trade period state
    // ========================================================================

    /// Advance each open trade's period state against the clock.
    pub async fn update_trade_period_state(&self) {
        let now = chrono::Utc::now();
        let trades: Vec<Arc<TradeHandle>> = self.tradable_list.lock().await.clone();
        for handle in trades {
            let mut trade = handle.lock().await;
            if trade.is_payout_published() {
                continue;
            }
            let (Some(max_date), Some(half_date)) =
                (trade.max_trade_period_date, trade.half_trade_period_date)
            else {
                continue;
            };
            let changed = if now > max_date {
                trade.set_period_state(TradePeriodState::TradePeriodOver)
            } else if now > half_date {
                trade.set_period_state(TradePeriodState::SecondHalf)
            } else {
                false
            };
            if changed {
                self.request_persistence();
            }
        }
    }

    /// Background clock watcher driving the period-state axis.
    pub fn spawn_period_state_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let tick = manager.ctx.config.period_tick();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                manager.update_trade_period_state().await;
            }
        })
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub async fn get_open_trade(&self, trade_id: &str) -> Option<Arc<TradeHandle>> {
        self.tradable_list
            .lock()
            .await
            .iter()
            .find(|t| t.id == trade_id)
            .cloned()
    }

    pub async fn get_closed_trade(&self, trade_id: &str) -> Option<Arc<TradeHandle>> {
        self.closed_trades
            .lock()
            .await
            .iter()
            .find(|t| t.id == trade_id)
            .cloned()
    }

    pub async fn get_failed_trade(&self, trade_id: &str) -> Option<Arc<TradeHandle>> {
        self.failed_trades
            .lock()
            .await
            .iter()
            .find(|t| t.id == trade_id)
            .cloned()
    }

    /// Open first, then closed; the dispute subsystem resolves trades here.
    pub async fn get_trade(&self, trade_id: &str) -> Option<Arc<TradeHandle>> {
        match self.get_open_trade(trade_id).await {
            Some(trade) => Some(trade),
            None => self.get_closed_trade(trade_id).await,
        }
    }

    pub async fn get_open_trades(&self) -> Vec<Arc<TradeHandle>> {
        self.tradable_list.lock().await.clone()
    }

    pub async fn num_pending_trades(&self) -> usize {
        self.tradable_list.lock().await.len()
    }

    /// An offer id is burned once any registry (open, failed, closed) has
    /// seen a trade for it.
    pub async fn was_offer_already_used(&self, offer_id: &str) -> bool {
        self.get_open_trade(offer_id).await.is_some()
            || self.get_failed_trade(offer_id).await.is_some()
            || self.get_closed_trade(offer_id).await.is_some()
    }

    /// Trades whose funds are currently locked in a multisig.
    pub async fn trades_with_funds_locked_in(&self) -> Vec<Arc<TradeHandle>> {
        let mut out = Vec::new();
        for handle in self.tradable_list.lock().await.iter() {
            if handle.lock().await.is_funds_locked_in() {
                out.push(handle.clone());
            }
        }
        out
    }
}
