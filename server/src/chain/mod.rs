//! Blockchain RPC capability
//!
//! The core never talks to a node library directly; it depends on the
//! [`ChainClient`] trait and receives an implementation at bootstrap.
//! Transaction bundles stay opaque (`serde_json::Value`, exactly what the
//! node's broadcast endpoint consumes); only the fields the core inspects
//! (permissions, balances, receipts) get typed views.

pub mod http;
pub mod keys;
pub mod multisig;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Chain RPC error: {0}")]
    Rpc(String),

    #[error("Chain response decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

/// One key of an account permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionKey {
    pub address: String,
    pub weight: i64,
}

/// An installed account permission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permission {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_name: Option<String>,
    #[serde(default)]
    pub threshold: i64,
    #[serde(default)]
    pub keys: Vec<PermissionKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<String>,
}

impl Permission {
    pub fn key_addresses(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.address.as_str())
    }

    pub fn has_key(&self, address: &str) -> bool {
        self.keys.iter().any(|k| k.address == address)
    }

    pub fn weight_sum(&self) -> i64 {
        self.keys.iter().map(|k| k.weight).sum()
    }
}

/// On-chain account state, as returned by `get_account`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub address: Option<String>,
    /// Native balance in the chain's smallest unit
    #[serde(default)]
    pub balance: i64,
    #[serde(default)]
    pub owner_permission: Option<Permission>,
    #[serde(default)]
    pub active_permission: Vec<Permission>,
}

/// Receipt of an executed transaction
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiptInfo {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub result_message: Option<String>,
}

/// Result of `get_transaction_info`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "blockNumber")]
    pub block_number: Option<i64>,
    #[serde(default, alias = "blockTimeStamp", alias = "block_timestamp")]
    pub block_time_stamp: Option<i64>,
    #[serde(default)]
    pub receipt: Option<ReceiptInfo>,
    #[serde(default, alias = "contractResult")]
    pub contract_result: Vec<String>,
}

impl TransactionInfo {
    /// Receipt result string, if the node reported one.
    pub fn result(&self) -> Option<&str> {
        self.receipt.as_ref().and_then(|r| r.result.as_deref())
    }

    /// True when the transaction has been included in a block.
    pub fn in_block(&self) -> bool {
        self.block_number.unwrap_or(0) != 0 || self.block_time_stamp.unwrap_or(0) != 0
    }

    /// Human-readable failure text, preferring the contract result.
    pub fn failure_message(&self) -> String {
        if let Some(first) = self.contract_result.first().filter(|s| !s.is_empty()) {
            if let Ok(bytes) = hex::decode(first) {
                let text = String::from_utf8_lossy(&bytes);
                if text.chars().any(|c| !c.is_control()) {
                    return text.into_owned();
                }
            }
            return first.clone();
        }
        self.receipt
            .as_ref()
            .and_then(|r| r.result_message.clone())
            .unwrap_or_else(|| "Transaction failed".to_string())
    }
}

/// Outcome of broadcasting a signed transaction
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BroadcastResult {
    #[serde(default)]
    pub result: bool,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub txid: Option<String>,
}

impl BroadcastResult {
    pub fn error_text(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (Some(code), None) => code.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => "Broadcast failed".to_string(),
        }
    }
}

/// A smart-contract invocation request
#[derive(Debug, Clone, Serialize)]
pub struct ContractCall {
    pub owner_address: String,
    pub contract_address: String,
    pub function_selector: String,
    /// ABI-encoded parameters, hex without selector
    pub parameter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<i32>,
}

/// A permission specification submitted in an account-permission update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSpec {
    #[serde(rename = "type")]
    pub kind: i32,
    pub permission_name: String,
    pub threshold: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<String>,
    pub keys: Vec<PermissionKey>,
}

impl PermissionSpec {
    pub fn weight_sum(&self) -> i64 {
        self.keys.iter().map(|k| k.weight).sum()
    }
}

/// The full `AccountPermissionUpdate` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPermissionUpdate {
    pub owner: PermissionSpec,
    pub actives: Vec<PermissionSpec>,
}

/// Abstract chain RPC capability.
///
/// Every method takes the target `network`; implementations map networks to
/// endpoints. All calls carry their own timeout.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Fetch account state; `None` when the account does not exist on chain.
    async fn get_account(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Option<AccountInfo>, ChainError>;

    /// Native balance in whole coins.
    async fn get_balance(&self, network: &str, address: &str) -> Result<f64, ChainError>;

    /// Build an unsigned native-coin transfer.
    async fn create_transaction(
        &self,
        network: &str,
        from_address: &str,
        to_address: &str,
        amount_units: i64,
        permission_id: Option<i32>,
    ) -> Result<Value, ChainError>;

    /// Build an unsigned account-permission update.
    async fn update_account_permission(
        &self,
        network: &str,
        owner_address: &str,
        permission: &AccountPermissionUpdate,
    ) -> Result<Value, ChainError>;

    /// Build an unsigned smart-contract invocation. The raw response also
    /// carries `constant_result` for view calls.
    async fn trigger_smart_contract(
        &self,
        network: &str,
        call: &ContractCall,
    ) -> Result<Value, ChainError>;

    /// Submit a fully signed transaction.
    async fn broadcast_transaction(
        &self,
        network: &str,
        signed_tx: &Value,
    ) -> Result<BroadcastResult, ChainError>;

    /// Fetch the execution receipt of a transaction.
    async fn get_transaction_info(
        &self,
        network: &str,
        tx_id: &str,
    ) -> Result<TransactionInfo, ChainError>;
}
