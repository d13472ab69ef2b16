//! Mock infrastructure for offline e2e testing
//!
//! Recording fakes for the messaging, persistence, price-feed and offer
//! collaborators, plus fixtures building offers, trades and disputes.

pub mod test_fixtures;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use monero_dex_common::{Error, NodeAddress, PubKeyRing, Result};
use monero_dex_core::mailbox::{DirectMessenger, MailboxDelivery, MailboxService};
use monero_dex_core::messages::{SupportMessage, TradeMessage};
use monero_dex_core::offer::{
    Offer, OfferBookService, OpenOffer, OpenOfferManager, OpenOfferState, SignedOffer,
};
use monero_dex_core::services::{
    Arbitrator, ArbitratorService, NotificationService, PersistenceRequester, PriceFeedService,
};

// ============================================================================
// Messaging
// ============================================================================

/// Records direct messages instead of sending them.
#[derive(Default)]
pub struct MockMessenger {
    pub sent: Mutex<Vec<(NodeAddress, TradeMessage)>>,
    pub fail_sends: Mutex<bool>,
}

impl MockMessenger {
    pub fn sent_messages(&self) -> Vec<(NodeAddress, TradeMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap() = fail;
    }
}

#[async_trait]
impl DirectMessenger for MockMessenger {
    async fn send_direct_message(
        &self,
        to: &NodeAddress,
        _to_pub_key_ring: &PubKeyRing,
        message: TradeMessage,
    ) -> Result<()> {
        if *self.fail_sends.lock().unwrap() {
            return Err(Error::Internal("simulated send failure".to_string()));
        }
        self.sent.lock().unwrap().push((to.clone(), message));
        Ok(())
    }
}

/// Records mailbox messages and resolves them with a configurable terminal
/// delivery state.
pub struct MockMailbox {
    pub sent: Mutex<Vec<(NodeAddress, SupportMessage)>>,
    delivery: Mutex<MailboxDelivery>,
}

impl Default for MockMailbox {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            delivery: Mutex::new(MailboxDelivery::Arrived),
        }
    }
}

impl MockMailbox {
    pub fn sent_messages(&self) -> Vec<(NodeAddress, SupportMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_delivery(&self, delivery: MailboxDelivery) {
        *self.delivery.lock().unwrap() = delivery;
    }

    /// Count sent messages matching a predicate.
    pub fn count<F: Fn(&SupportMessage) -> bool>(&self, predicate: F) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| predicate(m))
            .count()
    }
}

#[async_trait]
impl MailboxService for MockMailbox {
    async fn send_encrypted_mailbox_message(
        &self,
        to: &NodeAddress,
        _to_pub_key_ring: &PubKeyRing,
        message: SupportMessage,
    ) -> MailboxDelivery {
        self.sent.lock().unwrap().push((to.clone(), message));
        self.delivery.lock().unwrap().clone()
    }
}

// ============================================================================
// Persistence / notifications / price feed
// ============================================================================

/// Counts coalesced persistence requests.
#[derive(Default)]
pub struct CountingPersistence {
    requests: AtomicUsize,
}

impl CountingPersistence {
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PersistenceRequester for CountingPersistence {
    fn request_persistence(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records fired notifications.
#[derive(Default)]
pub struct RecordingNotifications {
    pub notifications: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifications {
    pub fn titles_for(&self, trade_id: &str) -> Vec<String> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == trade_id)
            .map(|(_, title)| title.clone())
            .collect()
    }
}

impl NotificationService for RecordingNotifications {
    fn send_trade_notification(&self, trade_id: &str, title: &str, _message: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push((trade_id.to_string(), title.to_string()));
    }
}

/// Static price feed; empty until primed.
#[derive(Default)]
pub struct StaticPriceFeed {
    prices: Mutex<HashMap<String, u64>>,
}

impl StaticPriceFeed {
    pub fn set_price(&self, currency_code: &str, price: u64) {
        self.prices
            .lock()
            .unwrap()
            .insert(currency_code.to_string(), price);
    }

    pub fn clear(&self) {
        self.prices.lock().unwrap().clear();
    }
}

impl PriceFeedService for StaticPriceFeed {
    fn has_prices(&self) -> bool {
        !self.prices.lock().unwrap().is_empty()
    }

    fn market_price(&self, currency_code: &str) -> Option<u64> {
        self.prices.lock().unwrap().get(currency_code).copied()
    }
}

// ============================================================================
// Offer book
// ============================================================================

/// In-memory public offer book with scriptable availability answers.
#[derive(Default)]
pub struct MockOfferBook {
    offers: Mutex<HashMap<String, Offer>>,
    unavailable: Mutex<Vec<String>>,
}

impl MockOfferBook {
    pub fn add_offer(&self, offer: Offer) {
        self.offers.lock().unwrap().insert(offer.id.clone(), offer);
    }

    /// Make the availability round trip fail for an offer.
    pub fn set_unavailable(&self, offer_id: &str) {
        self.unavailable.lock().unwrap().push(offer_id.to_string());
    }
}

#[async_trait]
impl OfferBookService for MockOfferBook {
    async fn offer(&self, offer_id: &str) -> Option<Offer> {
        self.offers.lock().unwrap().get(offer_id).cloned()
    }

    async fn check_offer_availability(&self, offer_id: &str, _taker: &NodeAddress) -> Result<()> {
        if self.unavailable.lock().unwrap().iter().any(|id| id == offer_id) {
            return Err(Error::OfferNotAvailable(offer_id.to_string()));
        }
        if self.offers.lock().unwrap().contains_key(offer_id) {
            Ok(())
        } else {
            Err(Error::OfferNotAvailable(offer_id.to_string()))
        }
    }
}

/// In-memory open-offer manager tracking reservation state.
#[derive(Default)]
pub struct MockOpenOfferManager {
    open_offers: Mutex<HashMap<String, OpenOffer>>,
    signed_offers: Mutex<HashMap<String, SignedOffer>>,
}

impl MockOpenOfferManager {
    pub fn add_open_offer(&self, open_offer: OpenOffer) {
        self.open_offers
            .lock()
            .unwrap()
            .insert(open_offer.offer.id.clone(), open_offer);
    }

    pub fn add_signed_offer(&self, signed_offer: SignedOffer) {
        self.signed_offers
            .lock()
            .unwrap()
            .insert(signed_offer.offer_id.clone(), signed_offer);
    }

    pub fn state_of(&self, offer_id: &str) -> Option<OpenOfferState> {
        self.open_offers
            .lock()
            .unwrap()
            .get(offer_id)
            .map(|o| o.state)
    }
}

#[async_trait]
impl OpenOfferManager for MockOpenOfferManager {
    async fn open_offer(&self, offer_id: &str) -> Option<OpenOffer> {
        self.open_offers.lock().unwrap().get(offer_id).cloned()
    }

    async fn reserve_open_offer(&self, offer_id: &str) -> Result<()> {
        let mut offers = self.open_offers.lock().unwrap();
        match offers.get_mut(offer_id) {
            Some(open_offer) => {
                open_offer.state = OpenOfferState::Reserved;
                Ok(())
            }
            None => Err(Error::OfferNotAvailable(offer_id.to_string())),
        }
    }

    async fn unreserve_open_offer(&self, offer_id: &str) -> Result<()> {
        let mut offers = self.open_offers.lock().unwrap();
        match offers.get_mut(offer_id) {
            Some(open_offer) => {
                open_offer.state = OpenOfferState::Available;
                Ok(())
            }
            None => Err(Error::OfferNotAvailable(offer_id.to_string())),
        }
    }

    async fn signed_offer(&self, offer_id: &str) -> Option<SignedOffer> {
        self.signed_offers.lock().unwrap().get(offer_id).cloned()
    }

    async fn reserved_key_images(&self) -> Vec<String> {
        self.open_offers
            .lock()
            .unwrap()
            .values()
            .flat_map(|o| o.offer.reserve_tx_key_images.clone())
            .collect()
    }
}

// ============================================================================
// Arbitrator registry
// ============================================================================

#[derive(Default)]
pub struct MockArbitratorService {
    registered: Mutex<Option<Arbitrator>>,
    accepted: Mutex<Vec<Arbitrator>>,
}

impl MockArbitratorService {
    pub fn set_registered(&self, arbitrator: Arbitrator) {
        *self.registered.lock().unwrap() = Some(arbitrator);
    }

    pub fn add_accepted(&self, arbitrator: Arbitrator) {
        self.accepted.lock().unwrap().push(arbitrator);
    }
}

impl ArbitratorService for MockArbitratorService {
    fn registered_arbitrator(&self) -> Option<Arbitrator> {
        self.registered.lock().unwrap().clone()
    }

    fn accepted_arbitrator_by_address(&self, address: &NodeAddress) -> Option<Arbitrator> {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .find(|a| &a.node_address == address)
            .cloned()
    }
}
