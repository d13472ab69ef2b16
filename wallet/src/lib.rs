//! Multisig wallet capability for the monero-dex trade core
//!
//! The trade and dispute protocols never run wallet cryptography themselves;
//! they talk to the traits in this crate. Wallet handles are opened and
//! explicitly closed around short-lived operations (import/export/sign)
//! rather than held for a trade's lifetime.

pub mod memory;
pub mod multisig;
pub mod outputs;

pub use memory::InMemoryWalletService;
pub use multisig::{MultisigWallet, MultisigWalletService, PayoutRequest, SignedPayoutTx};
pub use outputs::{OutputQuery, WalletOutput};
