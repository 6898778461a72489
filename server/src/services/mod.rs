//! Service layer: the subsystems of the escrow marketplace core

pub mod arbiter;
pub mod chat;
pub mod deals;
pub mod escrow;
pub mod provisioner;
