//! Offline end-to-end tests for the trade and dispute subsystems
//!
//! Everything runs in-process against mock infrastructure: no network, no
//! wallet RPC, no persistence backend. Run with:
//! cargo test --package monero-dex-core --test offline_e2e

mod dispute_tests;
mod mock_infrastructure;
