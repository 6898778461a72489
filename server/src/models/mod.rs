//! Database models and persisted payload schemas

pub mod deal;
pub mod escrow;
pub mod escrow_txn;
pub mod message;
pub mod storage;
pub mod wallet;
pub mod wallet_user;
