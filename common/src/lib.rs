//! Shared building blocks for the monero-dex trade core
//!
//! This crate carries the pieces every other workspace member needs:
//! the error type, node addressing, monetary helpers and the per-party
//! signing/encryption identity (key ring).

pub mod crypto;
pub mod error;
pub mod types;

pub use crypto::{KeyRing, PubKeyRing};
pub use error::{Error, Result};
pub use types::{AtomicAmount, NodeAddress};
