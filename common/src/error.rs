//! Error types shared across the escrow marketplace

use thiserror::Error;

/// Main error type for shared identifier handling
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid DID: {0}")]
    InvalidDid(String),

    #[error("Invalid deal uid: {0}")]
    InvalidDealUid(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the common Error
pub type Result<T> = std::result::Result<T, Error>;
