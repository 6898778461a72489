//! Common types and utilities for the escrow marketplace
//!
//! This crate contains the shared identifier types (DIDs, deal UIDs),
//! error definitions, and small utilities used across the marketplace
//! services.

pub mod error;
pub mod types;
pub mod utils;

pub use error::{Error, Result};
pub use types::*;

// ============================================
// CONSTANTS - Escrow Marketplace
// ============================================

/// Storage space used by the chat ledger
pub const CHAT_SPACE: &str = "chat";

/// Maximum size of a single chat attachment in bytes (50 MiB)
pub const MAX_ATTACHMENT_SIZE: i64 = 50 * 1024 * 1024;

/// DID method used for deal conversation identifiers
pub const DEAL_DID_METHOD: &str = "deal";

/// Number of signatures required by the standard escrow policy
pub const REQUIRED_SIGNATURES: u32 = 2;

/// Number of owners in the standard escrow policy
pub const TOTAL_OWNERS: usize = 3;
