//! Custom error types for the service layer

use thiserror::Error;

use crate::chain::ChainError;

/// Main error type returned by the marketplace services
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(
        "Access denied: only the deal owner ({owner_did}) can edit deal {deal_uid}. Attempted by: {attempted_by}"
    )]
    DealAccessDenied {
        deal_uid: String,
        owner_did: String,
        attempted_by: String,
    },

    #[error("Invalid status transition: {0}")]
    Transition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{code}: {message}")]
    Escrow { code: String, message: String },

    #[error("Chain RPC error: {0}")]
    Chain(#[from] ChainError),

    #[error("Transaction failed on chain: {0}")]
    ChainExecution(String),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Blocking operation failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Identifier error: {0}")]
    Identifier(#[from] escrow_marketplace_common::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    /// Escrow-scoped error with a stable machine-readable code
    pub fn escrow(code: &str, message: impl Into<String>) -> Self {
        ServiceError::Escrow {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// Escrow error codes surfaced to callers
pub const ESCROW_NOT_ACTIVATED: &str = "ESCROW_NOT_ACTIVATED";
pub const PERMISSIONS_MISMATCH: &str = "PERMISSIONS_MISMATCH";
pub const INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const INVALID_TOKEN_CONTRACT: &str = "INVALID_TOKEN_CONTRACT";
pub const TRANSACTION_CREATION_FAILED: &str = "TRANSACTION_CREATION_FAILED";
pub const BLOCKCHAIN_ERROR: &str = "BLOCKCHAIN_ERROR";
pub const UNSUPPORTED_ESCROW_TYPE: &str = "UNSUPPORTED_ESCROW_TYPE";
