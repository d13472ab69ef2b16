//! Trade aggregate
//!
//! One `Trade` per taken offer attempt, progressing along three axes: the
//! monotonic phase sequence, the dispute state, and the wall-clock trade
//! period. All mutation happens while holding the trade's lock
//! (`TradeHandle`); the registry lock in the trade manager only guards
//! membership.

pub mod manager;
pub mod protocol;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use monero_dex_common::{AtomicAmount, Error, NodeAddress, PubKeyRing, Result};

use crate::contract::Contract;
use crate::offer::Offer;

/// Ordered trade progress marker. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TradePhase {
    Init,
    DepositRequested,
    DepositsPublished,
    DepositsConfirmed,
    DepositsUnlocked,
    PaymentSent,
    PaymentReceived,
    PayoutPublished,
    PayoutConfirmed,
}

impl TradePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradePhase::Init => "init",
            TradePhase::DepositRequested => "deposit_requested",
            TradePhase::DepositsPublished => "deposits_published",
            TradePhase::DepositsConfirmed => "deposits_confirmed",
            TradePhase::DepositsUnlocked => "deposits_unlocked",
            TradePhase::PaymentSent => "payment_sent",
            TradePhase::PaymentReceived => "payment_received",
            TradePhase::PayoutPublished => "payout_published",
            TradePhase::PayoutConfirmed => "payout_confirmed",
        }
    }

    pub const ALL: [TradePhase; 9] = [
        TradePhase::Init,
        TradePhase::DepositRequested,
        TradePhase::DepositsPublished,
        TradePhase::DepositsConfirmed,
        TradePhase::DepositsUnlocked,
        TradePhase::PaymentSent,
        TradePhase::PaymentReceived,
        TradePhase::PayoutPublished,
        TradePhase::PayoutConfirmed,
    ];
}

/// Dispute axis, parallel to the phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDisputeState {
    NoDispute,
    DisputeRequested,
    DisputeOpenedByPeer,
    DisputeClosed,
}

impl TradeDisputeState {
    fn rank(&self) -> u8 {
        match self {
            TradeDisputeState::NoDispute => 0,
            TradeDisputeState::DisputeRequested | TradeDisputeState::DisputeOpenedByPeer => 1,
            TradeDisputeState::DisputeClosed => 2,
        }
    }
}

/// Wall-clock axis against the max-trade-period deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TradePeriodState {
    FirstHalf,
    SecondHalf,
    TradePeriodOver,
}

/// Which seat this node occupies in the trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeRole {
    Maker,
    Taker,
    Arbitrator,
}

/// Role plus trade side, replacing the original's per-variant subclasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeVariant {
    BuyerAsMaker,
    SellerAsMaker,
    BuyerAsTaker,
    SellerAsTaker,
    Arbitrator,
}

impl TradeVariant {
    pub fn role(&self) -> TradeRole {
        match self {
            TradeVariant::BuyerAsMaker | TradeVariant::SellerAsMaker => TradeRole::Maker,
            TradeVariant::BuyerAsTaker | TradeVariant::SellerAsTaker => TradeRole::Taker,
            TradeVariant::Arbitrator => TradeRole::Arbitrator,
        }
    }

    /// Whether the local trader buys XMR in this trade. Meaningless for the
    /// arbitrator seat.
    pub fn is_buyer(&self) -> bool {
        matches!(self, TradeVariant::BuyerAsMaker | TradeVariant::BuyerAsTaker)
    }

    /// Maker variant for an offer: the maker of a buy offer buys.
    pub fn maker_for(offer_is_buy: bool) -> Self {
        if offer_is_buy {
            TradeVariant::BuyerAsMaker
        } else {
            TradeVariant::SellerAsMaker
        }
    }

    /// Taker variant for an offer: the taker takes the mirrored side.
    pub fn taker_for(offer_is_buy: bool) -> Self {
        if offer_is_buy {
            TradeVariant::SellerAsTaker
        } else {
            TradeVariant::BuyerAsTaker
        }
    }
}

/// Per-party sub-record owned by the trade: addressing, identity, contract
/// inputs and wallet references for one seat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeParty {
    pub node_address: Option<NodeAddress>,
    pub pub_key_ring: Option<PubKeyRing>,
    pub payment_account_payload_hash: Option<String>,
    pub payment_account_key: Option<String>,
    pub payout_address: Option<String>,
    pub contract_signature: Option<String>,
    pub reserve_tx_hash: Option<String>,
    pub reserve_tx_hex: Option<String>,
    pub reserve_tx_key: Option<String>,
    pub reserve_tx_key_images: Vec<String>,
    pub deposit_tx_id: Option<String>,
    pub deposit_tx_hex: Option<String>,
    pub deposit_tx_key: Option<String>,
    pub prepared_multisig_hex: Option<String>,
    pub made_multisig_hex: Option<String>,
    pub exchanged_multisig_hex: Option<String>,
    pub updated_multisig_hex: Option<String>,
}

/// Per-trade aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Trade id; equals the offer id.
    pub id: String,
    /// Per-attempt uid; a re-take of the same offer after failure gets a
    /// fresh uid.
    pub uid: Uuid,
    pub variant: TradeVariant,
    pub offer: Offer,
    pub amount: AtomicAmount,
    pub price: u64,
    pub taker_fee: AtomicAmount,
    pub trade_date: DateTime<Utc>,

    phase: TradePhase,
    dispute_state: TradeDisputeState,
    period_state: TradePeriodState,

    pub maker: TradeParty,
    pub taker: TradeParty,
    pub arbitrator: TradeParty,

    pub contract: Option<Contract>,
    pub contract_hash: Option<String>,
    pub contract_as_json: Option<String>,

    pub payout_tx_id: Option<String>,
    pub payout_tx_hex: Option<String>,

    pub max_trade_period_date: Option<DateTime<Utc>>,
    pub half_trade_period_date: Option<DateTime<Utc>>,

    /// Set when the trade failed after the point where funds may be locked;
    /// such trades are quarantined, never deleted.
    pub error_message: Option<String>,
    pub is_initialized: bool,
    pub is_completed: bool,
}

impl Trade {
    pub fn new(
        offer: Offer,
        variant: TradeVariant,
        amount: AtomicAmount,
        price: u64,
        taker_fee: AtomicAmount,
    ) -> Self {
        Self {
            id: offer.id.clone(),
            uid: Uuid::new_v4(),
            variant,
            offer,
            amount,
            price,
            taker_fee,
            trade_date: Utc::now(),
            phase: TradePhase::Init,
            dispute_state: TradeDisputeState::NoDispute,
            period_state: TradePeriodState::FirstHalf,
            maker: TradeParty::default(),
            taker: TradeParty::default(),
            arbitrator: TradeParty::default(),
            contract: None,
            contract_hash: None,
            contract_as_json: None,
            payout_tx_id: None,
            payout_tx_hex: None,
            max_trade_period_date: None,
            half_trade_period_date: None,
            error_message: None,
            is_initialized: false,
            is_completed: false,
        }
    }

    pub fn role(&self) -> TradeRole {
        self.variant.role()
    }

    pub fn phase(&self) -> TradePhase {
        self.phase
    }

    pub fn dispute_state(&self) -> TradeDisputeState {
        self.dispute_state
    }

    pub fn period_state(&self) -> TradePeriodState {
        self.period_state
    }

    /// Advance the phase. Returns `true` when the phase actually moved;
    /// setting the current phase again is a no-op. Moving backwards is a
    /// protocol error and leaves the trade untouched.
    pub fn set_phase(&mut self, phase: TradePhase) -> Result<bool> {
        if phase < self.phase {
            return Err(Error::PhaseRegression {
                current: self.phase.as_str().to_string(),
                requested: phase.as_str().to_string(),
            });
        }
        if phase == self.phase {
            return Ok(false);
        }
        self.phase = phase;
        Ok(true)
    }

    /// Advance the dispute axis. Regressions are dropped, not errors: a
    /// mirrored open arriving after a close must not reopen the trade.
    pub fn set_dispute_state(&mut self, state: TradeDisputeState) -> bool {
        if state.rank() < self.dispute_state.rank() {
            return false;
        }
        let changed = self.dispute_state != state;
        self.dispute_state = state;
        changed
    }

    /// Advance the period axis (forward only).
    pub fn set_period_state(&mut self, state: TradePeriodState) -> bool {
        if state <= self.period_state {
            return false;
        }
        self.period_state = state;
        true
    }

    /// Start the trade-period clock; called when deposits publish.
    pub fn start_trade_period(&mut self, now: DateTime<Utc>) {
        let period = Duration::seconds(self.offer.max_trade_period_secs as i64);
        self.max_trade_period_date = Some(now + period);
        self.half_trade_period_date = Some(now + period / 2);
    }

    /// The party record for this node's own seat.
    pub fn self_party(&self) -> &TradeParty {
        match self.role() {
            TradeRole::Maker => &self.maker,
            TradeRole::Taker => &self.taker,
            TradeRole::Arbitrator => &self.arbitrator,
        }
    }

    pub fn self_party_mut(&mut self) -> &mut TradeParty {
        match self.role() {
            TradeRole::Maker => &mut self.maker,
            TradeRole::Taker => &mut self.taker,
            TradeRole::Arbitrator => &mut self.arbitrator,
        }
    }

    /// The trading counterparty's record. For the arbitrator seat there is
    /// no single counterparty; callers pick maker/taker explicitly.
    pub fn counterparty(&self) -> Option<&TradeParty> {
        match self.role() {
            TradeRole::Maker => Some(&self.taker),
            TradeRole::Taker => Some(&self.maker),
            TradeRole::Arbitrator => None,
        }
    }

    pub fn is_deposit_requested(&self) -> bool {
        self.phase >= TradePhase::DepositRequested
    }

    pub fn is_payout_published(&self) -> bool {
        self.phase >= TradePhase::PayoutPublished
    }

    /// Funds may be locked in the multisig from the moment a deposit was
    /// requested until the payout publishes.
    pub fn is_funds_locked_in(&self) -> bool {
        self.is_deposit_requested() && !self.is_payout_published()
    }

    pub fn has_failed(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    /// Total funds escrowed for this trade.
    pub fn escrowed_amount(&self) -> AtomicAmount {
        self.amount + self.offer.buyer_security_deposit + self.offer.seller_security_deposit
    }
}

/// Lock wrapper making the trade its own mutual-exclusion boundary: two
/// concurrently arriving messages for the same trade serialize here.
#[derive(Debug)]
pub struct TradeHandle {
    pub id: String,
    pub uid: Uuid,
    trade: Mutex<Trade>,
}

impl TradeHandle {
    pub fn new(trade: Trade) -> Self {
        Self {
            id: trade.id.clone(),
            uid: trade.uid,
            trade: Mutex::new(trade),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Trade> {
        self.trade.lock().await
    }
}
