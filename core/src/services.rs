//! Small capability contracts consumed by the trade core
//!
//! Persistence, notifications, the price feed and the arbitrator registry
//! are all external collaborators; the core only depends on the contracts
//! below.

use monero_dex_common::{NodeAddress, PubKeyRing};
use serde::{Deserialize, Serialize};

/// Asynchronous, coalescing persistence trigger. Durability timing is not
/// guaranteed before the next event; protocol logic must tolerate a crash
/// between a state mutation and its flush (startup reconciliation repairs
/// the wallet side).
pub trait PersistenceRequester: Send + Sync {
    fn request_persistence(&self);
}

/// Fire-and-forget user notification sink.
pub trait NotificationService: Send + Sync {
    fn send_trade_notification(&self, trade_id: &str, title: &str, message: &str);
}

/// Market price source for the option-trade advisory. Purely best-effort;
/// may have no data at startup.
pub trait PriceFeedService: Send + Sync {
    fn has_prices(&self) -> bool;

    /// Most recent market price for one XMR in `currency_code`, in the
    /// currency's smallest unit.
    fn market_price(&self, currency_code: &str) -> Option<u64>;
}

/// A registered or accepted arbitrator identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arbitrator {
    pub node_address: NodeAddress,
    pub pub_key_ring: PubKeyRing,
}

/// The node's view of arbitrators: its own registration (when running as
/// one) and the set of arbitrators its user accepts.
pub trait ArbitratorService: Send + Sync {
    /// This node's own arbitrator registration, if it is one.
    fn registered_arbitrator(&self) -> Option<Arbitrator>;

    /// The accepted arbitrator at `address`, if any.
    fn accepted_arbitrator_by_address(&self, address: &NodeAddress) -> Option<Arbitrator>;
}
