//! Escrow marketplace service core
//!
//! The library behind the marketplace daemon: deal state machine, payout
//! builder and signature aggregator, escrow lifecycle and provisioning,
//! and the per-participant chat ledger.

pub mod chain;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod schema;
pub mod services;
