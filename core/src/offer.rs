//! Offer book collaborators
//!
//! The trade core consumes the offer book through two narrow contracts: the
//! public book (what the arbitrator resolves trade ids against) and the
//! node's own open offers (the maker-side reservation gate). Both are
//! implemented elsewhere; only the lookup/reserve semantics matter here.

use async_trait::async_trait;
use monero_dex_common::{AtomicAmount, NodeAddress, PubKeyRing, Result};
use serde::{Deserialize, Serialize};

/// Direction of an offer from the maker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferDirection {
    Buy,
    Sell,
}

/// Published offer snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub direction: OfferDirection,
    pub amount: AtomicAmount,
    /// Price in the counter currency's smallest unit per XMR.
    pub price: u64,
    pub currency_code: String,
    pub maker_fee: AtomicAmount,
    pub taker_fee: AtomicAmount,
    pub buyer_security_deposit: AtomicAmount,
    pub seller_security_deposit: AtomicAmount,
    pub use_market_based_price: bool,
    pub market_price_margin_pct: f64,
    pub owner_node_address: NodeAddress,
    pub pub_key_ring: PubKeyRing,
    pub payment_method_id: String,
    /// Key images of the outputs the maker froze to back this offer.
    pub reserve_tx_key_images: Vec<String>,
    /// Trade period granted by this offer's payment method, seconds.
    pub max_trade_period_secs: u64,
}

impl Offer {
    pub fn is_buy_offer(&self) -> bool {
        self.direction == OfferDirection::Buy
    }

    /// Everything locked into escrow for a trade on this offer.
    pub fn total_escrow_amount(&self) -> AtomicAmount {
        self.amount + self.buyer_security_deposit + self.seller_security_deposit
    }
}

/// Availability state of one of our own offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenOfferState {
    Available,
    Reserved,
}

/// One of the node's own offers, with reservation state and the reserve
/// transaction backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOffer {
    pub offer: Offer,
    pub state: OpenOfferState,
    pub reserve_tx_hash: Option<String>,
    pub reserve_tx_hex: Option<String>,
    pub reserve_tx_key: Option<String>,
}

/// Arbitrator-side record of an offer it co-signed, carrying the maker's
/// reserve tx hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedOffer {
    pub offer_id: String,
    pub reserve_tx_hash: String,
}

/// The public offer book.
#[async_trait]
pub trait OfferBookService: Send + Sync {
    /// Look up an offer currently on the book.
    async fn offer(&self, offer_id: &str) -> Option<Offer>;

    /// Round trip to the offer owner checking the offer is still takeable.
    /// Asynchronous and fallible: the owner may be unreachable or the offer
    /// already taken.
    async fn check_offer_availability(&self, offer_id: &str, taker: &NodeAddress) -> Result<()>;
}

/// The node's own open offers.
#[async_trait]
pub trait OpenOfferManager: Send + Sync {
    async fn open_offer(&self, offer_id: &str) -> Option<OpenOffer>;

    /// Take the offer off the book while a trade initializes.
    async fn reserve_open_offer(&self, offer_id: &str) -> Result<()>;

    /// Roll a reservation back; the offer becomes available again.
    async fn unreserve_open_offer(&self, offer_id: &str) -> Result<()>;

    /// Arbitrator-side lookup of a co-signed offer.
    async fn signed_offer(&self, offer_id: &str) -> Option<SignedOffer>;

    /// Key images reserved by all open offers, for startup reconciliation.
    async fn reserved_key_images(&self) -> Vec<String>;
}
