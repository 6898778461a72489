//! Runtime configuration loaded once at startup
//!
//! Every tunable of the service comes from the environment (a `.env` file
//! is honored in development). The process-wide secret wraps mnemonics at
//! rest and is read-only after bootstrap.

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};

/// Settings for the escrow marketplace service
#[derive(Debug, Clone)]
pub struct Settings {
    /// Postgres connection string
    pub database_url: String,
    /// Process-wide secret used to wrap mnemonics at rest
    pub secret: String,
    /// Blockchain family served by the configured chain client
    pub blockchain: String,
    /// Default network for new escrows
    pub network: String,
    /// Chain RPC base URL per network
    pub chain_endpoints: HashMap<String, String>,
    /// Optional API key sent with every chain RPC call
    pub chain_api_key: Option<String>,
    /// Timeout applied to each chain RPC call, in seconds
    pub rpc_timeout_secs: u64,
    /// Minimum native-coin balance an escrow account must hold before the
    /// multisig permission can be installed
    pub escrow_min_native_balance: f64,
    /// Default stablecoin contract used when a deal's requisites name none
    pub default_token_contract: String,
    /// Optional payout-executor contract; when set, token payouts are
    /// routed through `executePayoutAndFees` instead of a plain transfer
    pub payout_executor_address: Option<String>,
    /// Base URL prefix for attachment download links
    pub attachment_download_base: String,
    /// Block-explorer transaction URL prefix used in service messages
    pub explorer_tx_base: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL must be set in environment")?;
        let secret = env::var("APP_SECRET").context("APP_SECRET must be set in environment")?;

        let network = env::var("CHAIN_NETWORK").unwrap_or_else(|_| "mainnet".to_string());

        let mut chain_endpoints = HashMap::new();
        chain_endpoints.insert(
            "mainnet".to_string(),
            env::var("CHAIN_RPC_URL_MAINNET")
                .unwrap_or_else(|_| "https://api.trongrid.io".to_string()),
        );
        chain_endpoints.insert(
            "testnet".to_string(),
            env::var("CHAIN_RPC_URL_TESTNET")
                .unwrap_or_else(|_| "https://nile.trongrid.io".to_string()),
        );

        Ok(Settings {
            database_url,
            secret,
            blockchain: env::var("CHAIN_BLOCKCHAIN").unwrap_or_else(|_| "tron".to_string()),
            network,
            chain_endpoints,
            chain_api_key: env::var("CHAIN_API_KEY").ok().filter(|v| !v.is_empty()),
            rpc_timeout_secs: env_parse("CHAIN_RPC_TIMEOUT_SECS", 10),
            escrow_min_native_balance: env_parse("ESCROW_MIN_NATIVE_BALANCE", 40.0),
            default_token_contract: env::var("DEFAULT_TOKEN_CONTRACT")
                .unwrap_or_else(|_| "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string()),
            payout_executor_address: env::var("PAYOUT_EXECUTOR_ADDRESS")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            attachment_download_base: env::var("ATTACHMENT_DOWNLOAD_BASE")
                .unwrap_or_else(|_| "/chat/api/attachment".to_string()),
            explorer_tx_base: env::var("EXPLORER_TX_BASE")
                .unwrap_or_else(|_| "https://tronscan.org/#/transaction".to_string()),
        })
    }

    /// Base URL of the chain RPC endpoint for a network.
    pub fn chain_endpoint(&self, network: &str) -> Option<&str> {
        self.chain_endpoints.get(network).map(String::as_str)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_missing_or_garbage() {
        env::remove_var("NOT_SET_ANYWHERE_42");
        assert_eq!(env_parse("NOT_SET_ANYWHERE_42", 7u64), 7);
        env::set_var("GARBAGE_VALUE_42", "not-a-number");
        assert_eq!(env_parse("GARBAGE_VALUE_42", 2.5f64), 2.5);
        env::remove_var("GARBAGE_VALUE_42");
    }
}
