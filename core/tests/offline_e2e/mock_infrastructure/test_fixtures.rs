//! Shared fixtures: one fully wired node (trade manager + dispute manager
//! over mocks), plus builders for offers, contracts and disputes.

use std::sync::Arc;

use chrono::{Duration, Utc};

use monero_dex_common::{KeyRing, NodeAddress, PubKeyRing};
use monero_dex_core::config::ProtocolConfig;
use monero_dex_core::contract::Contract;
use monero_dex_core::offer::{Offer, OfferDirection, OpenOffer, OpenOfferState};
use monero_dex_core::services::Arbitrator;
use monero_dex_core::support::chat::ChatMessage;
use monero_dex_core::support::dispute::{Dispute, SupportType};
use monero_dex_core::trade::manager::TradeManager;
use monero_dex_core::trade::{Trade, TradeVariant};
use monero_dex_core::DisputeManager;
use monero_dex_wallet::InMemoryWalletService;

use super::{
    CountingPersistence, MockArbitratorService, MockMailbox, MockMessenger, MockOfferBook,
    MockOpenOfferManager, RecordingNotifications, StaticPriceFeed,
};

/// One in-process node with its full manager stack over mocks.
pub struct TestNode {
    pub key_ring: Arc<KeyRing>,
    pub address: NodeAddress,
    pub messenger: Arc<MockMessenger>,
    pub mailbox: Arc<MockMailbox>,
    pub wallet: Arc<InMemoryWalletService>,
    pub persistence: Arc<CountingPersistence>,
    pub notifications: Arc<RecordingNotifications>,
    pub price_feed: Arc<StaticPriceFeed>,
    pub offer_book: Arc<MockOfferBook>,
    pub open_offers: Arc<MockOpenOfferManager>,
    pub arbitrators: Arc<MockArbitratorService>,
    pub trade_manager: Arc<TradeManager>,
    pub dispute_manager: Arc<DisputeManager>,
}

impl TestNode {
    pub fn pub_key_ring(&self) -> &PubKeyRing {
        self.key_ring.pub_key_ring()
    }

    pub fn as_arbitrator(&self) -> Arbitrator {
        Arbitrator {
            node_address: self.address.clone(),
            pub_key_ring: self.pub_key_ring().clone(),
        }
    }
}

/// Install the test log subscriber once; repeated calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Build a node with deterministic identity from `seed`.
pub fn test_node(seed: u8, host: &str) -> TestNode {
    init_logging();
    let key_ring = Arc::new(KeyRing::from_seed([seed; 32]));
    let address = NodeAddress::new(host, 9999);
    let messenger = Arc::new(MockMessenger::default());
    let mailbox = Arc::new(MockMailbox::default());
    let wallet = Arc::new(InMemoryWalletService::new());
    let persistence = Arc::new(CountingPersistence::default());
    let notifications = Arc::new(RecordingNotifications::default());
    let price_feed = Arc::new(StaticPriceFeed::default());
    price_feed.set_price("EUR", 150_00);
    let offer_book = Arc::new(MockOfferBook::default());
    let open_offers = Arc::new(MockOpenOfferManager::default());
    let arbitrators = Arc::new(MockArbitratorService::default());
    let config = ProtocolConfig::default();

    let trade_manager = Arc::new(TradeManager::new(
        key_ring.clone(),
        address.clone(),
        messenger.clone(),
        wallet.clone(),
        persistence.clone(),
        notifications.clone(),
        offer_book.clone(),
        open_offers.clone(),
        arbitrators.clone(),
        config.clone(),
    ));
    let dispute_manager = Arc::new(DisputeManager::new(
        key_ring.clone(),
        address.clone(),
        mailbox.clone(),
        wallet.clone(),
        persistence.clone(),
        price_feed.clone(),
        trade_manager.clone(),
        config,
        Vec::new(),
    ));

    TestNode {
        key_ring,
        address,
        messenger,
        mailbox,
        wallet,
        persistence,
        notifications,
        price_feed,
        offer_book,
        open_offers,
        arbitrators,
        trade_manager,
        dispute_manager,
    }
}

pub const TRADE_AMOUNT: u64 = 2_000_000_000_000;
pub const SECURITY_DEPOSIT: u64 = 200_000_000_000;
pub const TRADE_PRICE: u64 = 150_00;

/// A buy offer owned by `maker`, reserving one key image.
pub fn make_offer(id: &str, maker: &TestNode) -> Offer {
    Offer {
        id: id.to_string(),
        direction: OfferDirection::Buy,
        amount: TRADE_AMOUNT,
        price: TRADE_PRICE,
        currency_code: "EUR".into(),
        maker_fee: 0,
        taker_fee: 0,
        buyer_security_deposit: SECURITY_DEPOSIT,
        seller_security_deposit: SECURITY_DEPOSIT,
        use_market_based_price: false,
        market_price_margin_pct: 0.0,
        owner_node_address: maker.address.clone(),
        pub_key_ring: maker.pub_key_ring().clone(),
        payment_method_id: "SEPA".into(),
        reserve_tx_key_images: vec![format!("{}-maker-ki", id)],
        max_trade_period_secs: 86_400,
    }
}

pub fn make_open_offer(offer: Offer) -> OpenOffer {
    OpenOffer {
        offer,
        state: OpenOfferState::Available,
        reserve_tx_hash: Some("reserve-hash".into()),
        reserve_tx_hex: Some("reserve-hex".into()),
        reserve_tx_key: Some("reserve-key".into()),
    }
}

/// Contract for a trade on a buy offer: the maker buys, the taker sells.
pub fn make_contract(offer: &Offer, buyer: &TestNode, seller: &TestNode, arbitrator: &TestNode) -> Contract {
    Contract {
        offer_id: offer.id.clone(),
        offer_direction: offer.direction,
        currency_code: offer.currency_code.clone(),
        trade_amount: offer.amount,
        trade_price: offer.price,
        buyer_security_deposit: offer.buyer_security_deposit,
        seller_security_deposit: offer.seller_security_deposit,
        buyer_node_address: buyer.address.clone(),
        seller_node_address: seller.address.clone(),
        buyer_pub_key_ring: buyer.pub_key_ring().clone(),
        seller_pub_key_ring: seller.pub_key_ring().clone(),
        buyer_payout_address: "9buyerPayoutAddress".into(),
        seller_payout_address: "9sellerPayoutAddress".into(),
        arbitrator_node_address: arbitrator.address.clone(),
        maker_payment_account_payload_hash: "maker-payload-hash".into(),
        taker_payment_account_payload_hash: "taker-payload-hash".into(),
        use_market_based_price: offer.use_market_based_price,
        market_price_margin_pct: offer.market_price_margin_pct,
    }
}

/// Dispute opened by the buyer (who is also the maker on a buy offer),
/// carrying the opener's system chat message like a real open-request does.
pub fn make_opener_dispute(
    trade_id: &str,
    contract: Contract,
    opener: &TestNode,
    agent: &TestNode,
) -> Dispute {
    let hash = contract.hash().unwrap();
    let json = contract.to_canonical_json().unwrap();
    let mut dispute = Dispute::new(
        trade_id,
        opener.pub_key_ring().trader_id(),
        true,
        true,
        true,
        opener.pub_key_ring().clone(),
        agent.pub_key_ring().clone(),
        Utc::now() - Duration::hours(2),
        Utc::now() + Duration::hours(22),
        contract,
        hash,
        json,
        SupportType::Arbitration,
    );
    dispute.add_chat_message(ChatMessage::system(
        trade_id,
        dispute.trader_id,
        "System message: you opened a dispute.",
        opener.address.clone(),
    ));
    dispute
}

/// An arbitrator-seat trade for `offer`, with all three parties known, as
/// it looks after initialization.
pub fn make_arbitrator_trade(offer: Offer, maker: &TestNode, taker: &TestNode, arbitrator: &TestNode) -> Trade {
    let mut trade = Trade::new(
        offer.clone(),
        TradeVariant::Arbitrator,
        offer.amount,
        offer.price,
        offer.taker_fee,
    );
    trade.maker.node_address = Some(maker.address.clone());
    trade.maker.pub_key_ring = Some(maker.pub_key_ring().clone());
    trade.taker.node_address = Some(taker.address.clone());
    trade.taker.pub_key_ring = Some(taker.pub_key_ring().clone());
    trade.arbitrator.node_address = Some(arbitrator.address.clone());
    trade.arbitrator.pub_key_ring = Some(arbitrator.pub_key_ring().clone());
    let contract = make_contract(&offer, maker, taker, arbitrator);
    trade.contract_hash = Some(contract.hash().unwrap());
    trade.contract_as_json = Some(contract.to_canonical_json().unwrap());
    trade.contract = Some(contract);
    trade
}

/// A trader-seat trade (maker side) mirroring `make_arbitrator_trade`.
pub fn make_trader_trade(
    offer: Offer,
    variant: TradeVariant,
    maker: &TestNode,
    taker: &TestNode,
    arbitrator: &TestNode,
) -> Trade {
    let mut trade = make_arbitrator_trade(offer, maker, taker, arbitrator);
    trade.variant = variant;
    trade
}
