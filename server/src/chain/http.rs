//! HTTP implementation of the chain RPC capability
//!
//! Talks to a Tron-style full-node HTTP API. The endpoint per network and
//! the optional API key come from [`Settings`](crate::config::Settings).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    AccountInfo, AccountPermissionUpdate, BroadcastResult, ChainClient, ChainError, ContractCall,
    TransactionInfo,
};

const SUN_PER_COIN: f64 = 1_000_000.0;

pub struct HttpChainClient {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
    api_key: Option<String>,
}

impl HttpChainClient {
    pub fn new(
        endpoints: HashMap<String, String>,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoints,
            api_key,
        })
    }

    fn endpoint(&self, network: &str) -> Result<&str, ChainError> {
        self.endpoints
            .get(network)
            .map(String::as_str)
            .ok_or_else(|| ChainError::UnknownNetwork(network.to_string()))
    }

    async fn post(&self, network: &str, path: &str, body: Value) -> Result<Value, ChainError> {
        let url = format!("{}{}", self.endpoint(network)?, path);
        debug!(%url, "chain rpc call");
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("TRON-PRO-API-KEY", key);
        }
        let response = request.send().await?;
        let value = response.json::<Value>().await?;
        if let Some(error) = value.get("Error").and_then(Value::as_str) {
            return Err(ChainError::Rpc(error.to_string()));
        }
        Ok(value)
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn get_account(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Option<AccountInfo>, ChainError> {
        let value = self
            .post(
                network,
                "/wallet/getaccount",
                json!({ "address": address, "visible": true }),
            )
            .await?;
        // An unknown account comes back as an empty object
        if value.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn get_balance(&self, network: &str, address: &str) -> Result<f64, ChainError> {
        let account = self.get_account(network, address).await?;
        Ok(account.map(|a| a.balance as f64 / SUN_PER_COIN).unwrap_or(0.0))
    }

    async fn create_transaction(
        &self,
        network: &str,
        from_address: &str,
        to_address: &str,
        amount_units: i64,
        permission_id: Option<i32>,
    ) -> Result<Value, ChainError> {
        let mut body = json!({
            "owner_address": from_address,
            "to_address": to_address,
            "amount": amount_units,
            "visible": true,
        });
        if let Some(id) = permission_id {
            body["Permission_id"] = json!(id);
        }
        self.post(network, "/wallet/createtransaction", body).await
    }

    async fn update_account_permission(
        &self,
        network: &str,
        owner_address: &str,
        permission: &AccountPermissionUpdate,
    ) -> Result<Value, ChainError> {
        let body = json!({
            "owner_address": owner_address,
            "owner": permission.owner,
            "actives": permission.actives,
            "visible": true,
        });
        self.post(network, "/wallet/accountpermissionupdate", body)
            .await
    }

    async fn trigger_smart_contract(
        &self,
        network: &str,
        call: &ContractCall,
    ) -> Result<Value, ChainError> {
        let mut body = serde_json::to_value(call)?;
        body["visible"] = json!(true);
        self.post(network, "/wallet/triggersmartcontract", body)
            .await
    }

    async fn broadcast_transaction(
        &self,
        network: &str,
        signed_tx: &Value,
    ) -> Result<BroadcastResult, ChainError> {
        let value = self
            .post(network, "/wallet/broadcasttransaction", signed_tx.clone())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn get_transaction_info(
        &self,
        network: &str,
        tx_id: &str,
    ) -> Result<TransactionInfo, ChainError> {
        let value = self
            .post(
                network,
                "/wallet/gettransactioninfobyid",
                json!({ "value": tx_id }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}
