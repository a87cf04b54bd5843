//! Custodian relay for virtual-bank multisig bridges
//!
//! Watches external chains for deposits to the custodian address, confirms
//! them to the home ledger, and turns home-ledger withdrawals, custodian
//! changes and contract upgrades into quorum-signed external transactions.

pub mod address_codec;
pub mod api;
pub mod bounded_cache;
pub mod chain;
pub mod config;
pub mod confirmation;
pub mod context;
pub mod contracts;
pub mod db;
pub mod error;
pub mod hash;
pub mod home;
pub mod metrics;
pub mod quorum;
pub mod rpc_fallback;
pub mod runtime;
pub mod types;
pub mod watchers;
pub mod writers;

#[cfg(feature = "testing")]
pub mod testing;
