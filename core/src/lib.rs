//! Trade-coordination core for a non-custodial Monero exchange
//!
//! Two counterparties (maker/taker) and a semi-trusted arbitrator jointly
//! fund a multisig escrow, execute a trade, and either release funds
//! cooperatively or resolve disagreement through arbitration. This crate
//! holds the message-driven trade protocol, the trade registry and the
//! dispute subsystem; wallet cryptography, networking transports and
//! persistence formats live behind capability traits.

pub mod config;
pub mod contract;
pub mod mailbox;
pub mod messages;
pub mod offer;
pub mod services;
pub mod support;
pub mod trade;

pub use config::ProtocolConfig;
pub use contract::Contract;
pub use trade::manager::TradeManager;
pub use trade::{Trade, TradeDisputeState, TradePeriodState, TradePhase, TradeRole};
pub use support::dispute::{Dispute, DisputeResult, DisputeState, SupportType};
pub use support::dispute_manager::DisputeManager;
