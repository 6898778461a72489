//! Escrow lifecycle service
//!
//! Finds or creates the shared escrow account for a participant pair,
//! verifies the on-chain permission state against the stored record, and
//! builds unsigned payout transactions from the escrow address.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::chain::multisig::{
    self, address_to_hex, encode_execute_payout_and_fees, encode_transfer, MultisigConfig,
};
use crate::chain::{AccountInfo, ChainClient, ContractCall, Permission};
use crate::config::Settings;
use crate::crypto::encryption;
use crate::db::{with_conn, DbPool};
use crate::error::{
    ServiceError, ServiceResult, ESCROW_NOT_ACTIVATED, INSUFFICIENT_BALANCE,
    INVALID_TOKEN_CONTRACT, PERMISSIONS_MISMATCH, TRANSACTION_CREATION_FAILED,
    UNSUPPORTED_ESCROW_TYPE,
};
use crate::models::escrow::{Escrow, EscrowStatus, EscrowType, NewEscrow};

const PENDING_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TOKEN_DECIMALS_FACTOR: f64 = 1e6;
const SUN_PER_COIN: f64 = 1e6;
const TOKEN_FEE_LIMIT: i64 = 100_000_000;

/// What the payout builder needs from an unsigned payment transaction
#[derive(Debug, Clone)]
pub struct CreatePaymentResult {
    pub unsigned_tx: Value,
    pub required_signatures: u32,
    pub participants: Vec<String>,
    pub arbiter: String,
    pub owner_addresses: Option<Vec<String>>,
    pub token_contract: Option<String>,
}

/// Verdict of comparing the installed on-chain permission with the stored
/// escrow record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PermissionVerdict {
    /// Account does not exist on chain yet
    NoAccount,
    /// Account exists but carries no usable 2-of-3 permission
    NotInstalled,
    /// An expected participant is missing from the installed keys
    Mismatch(String),
    /// A valid 2-of-3 permission over both participants; the third key is
    /// the effective arbiter
    Verified { arbiter: String },
}

/// Classify the active permission installed at the escrow address.
///
/// Thresholds other than 2 and key counts other than 3 are ignored; the
/// last matching permission wins (the most recent update).
pub(crate) fn classify_active_permission(
    account: Option<&AccountInfo>,
    participant1: &str,
    participant2: &str,
) -> PermissionVerdict {
    let Some(account) = account else {
        return PermissionVerdict::NoAccount;
    };

    let multisig_perm: Option<&Permission> = account
        .active_permission
        .iter()
        .filter(|perm| perm.threshold == 2 && perm.keys.len() == 3)
        .last();

    let Some(perm) = multisig_perm else {
        return PermissionVerdict::NotInstalled;
    };

    if !perm.has_key(participant1) {
        return PermissionVerdict::Mismatch(participant1.to_string());
    }
    if !perm.has_key(participant2) {
        return PermissionVerdict::Mismatch(participant2.to_string());
    }

    let arbiter = perm
        .key_addresses()
        .find(|addr| *addr != participant1 && *addr != participant2)
        .unwrap_or(participant1)
        .to_string();

    PermissionVerdict::Verified { arbiter }
}

/// Escrow lifecycle operations for one owner DID
pub struct EscrowService {
    pool: DbPool,
    chain: Arc<dyn ChainClient>,
    settings: Arc<Settings>,
    owner_did: String,
    blockchain: String,
    network: String,
    escrow_type: EscrowType,
}

impl EscrowService {
    pub fn new(
        pool: DbPool,
        chain: Arc<dyn ChainClient>,
        settings: Arc<Settings>,
        owner_did: impl Into<String>,
    ) -> Self {
        let blockchain = settings.blockchain.clone();
        let network = settings.network.clone();
        Self {
            pool,
            chain,
            settings,
            owner_did: owner_did.into(),
            blockchain,
            network,
            escrow_type: EscrowType::Multisig,
        }
    }

    /// Ensure an escrow exists for the unordered participant pair under
    /// this owner's scope; create a pending one when none is live.
    pub async fn ensure_exists(
        &self,
        arbiter_address: &str,
        sender_address: &str,
        receiver_address: &str,
    ) -> ServiceResult<Escrow> {
        let (blockchain, network) = (self.blockchain.clone(), self.network.clone());
        let (owner_did, escrow_type) = (self.owner_did.clone(), self.escrow_type);
        let (arbiter, sender, receiver) = (
            arbiter_address.to_string(),
            sender_address.to_string(),
            receiver_address.to_string(),
        );
        let secret = self.settings.secret.clone();

        with_conn(&self.pool, move |conn| {
            if let Some(existing) = Escrow::find_live_for_owner(
                conn,
                &blockchain,
                &network,
                escrow_type,
                &owner_did,
                &sender,
                &receiver,
                &arbiter,
            )? {
                return Ok(existing);
            }
            create_pending_escrow(
                conn,
                &blockchain,
                &network,
                escrow_type,
                &owner_did,
                &sender,
                &receiver,
                &arbiter,
                &secret,
            )
        })
        .await
    }

    /// Find-or-create plus on-chain verification; the entry point used by
    /// deal creation.
    pub async fn initialize_escrow(
        &self,
        participant1: &str,
        participant2: &str,
        arbiter: &str,
    ) -> ServiceResult<Escrow> {
        let existing = self
            .check_existing_escrow(participant1, participant2, true, 30)
            .await?;

        if let Some(escrow) = existing {
            self.verify_and_update_escrow(escrow.id, participant1, participant2)
                .await?;
            let refreshed = self.get_escrow_by_id(escrow.id).await?;
            return Ok(refreshed);
        }

        let (blockchain, network) = (self.blockchain.clone(), self.network.clone());
        let (owner_did, escrow_type) = (self.owner_did.clone(), self.escrow_type);
        let (p1, p2, arb) = (
            participant1.to_string(),
            participant2.to_string(),
            arbiter.to_string(),
        );
        let secret = self.settings.secret.clone();
        with_conn(&self.pool, move |conn| {
            create_pending_escrow(
                conn, &blockchain, &network, escrow_type, &owner_did, &p1, &p2, &arb, &secret,
            )
        })
        .await
    }

    /// Find a live escrow for the pair, optionally waiting out a pending
    /// provisioning run. On timeout the pending escrow is retired and the
    /// caller creates a fresh one.
    pub async fn check_existing_escrow(
        &self,
        participant1: &str,
        participant2: &str,
        wait_if_pending: bool,
        timeout_seconds: u64,
    ) -> ServiceResult<Option<Escrow>> {
        let started = tokio::time::Instant::now();
        loop {
            let (blockchain, network) = (self.blockchain.clone(), self.network.clone());
            let (p1, p2) = (participant1.to_string(), participant2.to_string());
            let found = with_conn(&self.pool, move |conn| {
                Escrow::find_live_for_pair(conn, &blockchain, &network, &p1, &p2)
                    .map_err(ServiceError::from)
            })
            .await?;

            let Some(escrow) = found else {
                return Ok(None);
            };

            if escrow.status()? != EscrowStatus::Pending || !wait_if_pending {
                return Ok(Some(escrow));
            }

            if started.elapsed() > Duration::from_secs(timeout_seconds) {
                warn!(escrow_id = escrow.id, "pending escrow timed out, marking inactive");
                let escrow_id = escrow.id;
                with_conn(&self.pool, move |conn| {
                    Escrow::set_status(conn, escrow_id, EscrowStatus::Inactive)
                        .map_err(ServiceError::from)
                })
                .await?;
                return Ok(None);
            }

            tokio::time::sleep(PENDING_POLL_INTERVAL).await;
        }
    }

    /// Verify the stored escrow against the permission installed on chain.
    ///
    /// A different third key becomes the new arbiter; a missing expected
    /// participant fails with `PERMISSIONS_MISMATCH`; a confirmed
    /// permission promotes the escrow to active.
    pub async fn verify_and_update_escrow(
        &self,
        escrow_id: i32,
        participant1: &str,
        participant2: &str,
    ) -> ServiceResult<()> {
        let escrow = self.get_escrow_by_id(escrow_id).await?;

        let account = self
            .chain
            .get_account(&escrow.network, &escrow.escrow_address)
            .await?;

        match classify_active_permission(account.as_ref(), participant1, participant2) {
            // Not on chain yet or nothing installed: the provisioner owns it
            PermissionVerdict::NoAccount | PermissionVerdict::NotInstalled => Ok(()),
            PermissionVerdict::Mismatch(missing) => Err(ServiceError::escrow(
                PERMISSIONS_MISMATCH,
                format!("Participant {missing} not found in blockchain permissions"),
            )),
            PermissionVerdict::Verified { arbiter } => {
                let (p1, p2) = (participant1.to_string(), participant2.to_string());
                with_conn(&self.pool, move |conn| {
                    let Some(current) = Escrow::find_by_id(conn, escrow_id)? else {
                        return Err(ServiceError::NotFound(format!("Escrow {escrow_id}")));
                    };

                    if arbiter != current.arbiter_address {
                        info!(
                            escrow_id,
                            new_arbiter = %arbiter,
                            "on-chain permission names a different arbiter, updating"
                        );
                        let mut roles: BTreeMap<String, String> =
                            serde_json::from_value(current.address_roles.clone())
                                .unwrap_or_default();
                        roles.insert(arbiter.clone(), "arbiter".to_string());
                        let roles_value = serde_json::to_value(&roles)
                            .map_err(|e| ServiceError::Validation(e.to_string()))?;

                        let mut config = current.config()?;
                        config.owner_addresses = vec![p1.clone(), p2.clone(), arbiter.clone()];
                        let config_value = serde_json::to_value(&config)
                            .map_err(|e| ServiceError::Validation(e.to_string()))?;

                        Escrow::set_arbiter(conn, escrow_id, &arbiter, &roles_value, &config_value)?;
                    }

                    if current.status()? != EscrowStatus::Active {
                        Escrow::set_status(conn, escrow_id, EscrowStatus::Active)?;
                    }
                    Ok(())
                })
                .await
            }
        }
    }

    pub async fn get_escrow_by_id(&self, escrow_id: i32) -> ServiceResult<Escrow> {
        with_conn(&self.pool, move |conn| {
            Escrow::find_by_id(conn, escrow_id)?
                .ok_or_else(|| ServiceError::NotFound(format!("Escrow {escrow_id}")))
        })
        .await
    }

    /// Native balance at the escrow address, in whole coins.
    pub async fn get_escrow_balance(&self, escrow_id: i32) -> ServiceResult<f64> {
        let escrow = self.get_escrow_by_id(escrow_id).await?;
        Ok(self
            .chain
            .get_balance(&escrow.network, &escrow.escrow_address)
            .await?)
    }

    /// Build the unsigned outbound payment from the escrow address.
    ///
    /// Token payouts go through the configured payout-executor contract
    /// when one is set, a plain token transfer otherwise; a `None` token
    /// contract builds a native-coin transfer.
    pub async fn create_payment_transaction(
        &self,
        escrow_id: i32,
        to_address: &str,
        amount: f64,
        token_contract: Option<&str>,
    ) -> ServiceResult<CreatePaymentResult> {
        let escrow = self.get_escrow_by_id(escrow_id).await?;

        if escrow.escrow_type()? != EscrowType::Multisig {
            return Err(ServiceError::escrow(
                UNSUPPORTED_ESCROW_TYPE,
                "Payments from contract-type escrows are not implemented",
            ));
        }

        let account = self
            .chain
            .get_account(&escrow.network, &escrow.escrow_address)
            .await?
            .ok_or_else(|| {
                ServiceError::escrow(
                    ESCROW_NOT_ACTIVATED,
                    format!("Escrow account {} not activated", escrow.escrow_address),
                )
            })?;

        // Last 2-of-N permission id wins: the most recent permission update
        let permission_id = account
            .active_permission
            .iter()
            .filter(|perm| perm.threshold == 2)
            .last()
            .and_then(|perm| perm.id);

        let unsigned_tx = match token_contract {
            Some(contract) => {
                self.build_token_payment(&escrow, contract, to_address, amount, permission_id)
                    .await?
            }
            None => {
                self.build_native_payment(&escrow, to_address, amount, permission_id)
                    .await?
            }
        };

        if unsigned_tx.get("txID").and_then(Value::as_str).is_none() {
            return Err(ServiceError::escrow(
                TRANSACTION_CREATION_FAILED,
                format!("Failed to create transaction: {unsigned_tx}"),
            ));
        }

        let config: MultisigConfig = escrow.config()?;
        Ok(CreatePaymentResult {
            unsigned_tx,
            required_signatures: config.required_signatures,
            participants: escrow.participant_addresses(),
            arbiter: escrow.arbiter_address.clone(),
            owner_addresses: Some(config.owner_addresses),
            token_contract: token_contract.map(str::to_string),
        })
    }

    async fn build_native_payment(
        &self,
        escrow: &Escrow,
        to_address: &str,
        amount: f64,
        permission_id: Option<i32>,
    ) -> ServiceResult<Value> {
        let balance = self
            .chain
            .get_balance(&escrow.network, &escrow.escrow_address)
            .await?;
        if balance < amount {
            return Err(ServiceError::escrow(
                INSUFFICIENT_BALANCE,
                format!("Insufficient balance: {balance} < {amount}"),
            ));
        }

        Ok(self
            .chain
            .create_transaction(
                &escrow.network,
                &escrow.escrow_address,
                to_address,
                (amount * SUN_PER_COIN) as i64,
                permission_id,
            )
            .await?)
    }

    async fn build_token_payment(
        &self,
        escrow: &Escrow,
        token_contract: &str,
        to_address: &str,
        amount: f64,
        permission_id: Option<i32>,
    ) -> ServiceResult<Value> {
        if !token_contract.starts_with('T') || token_contract.len() != 34 {
            return Err(ServiceError::escrow(
                INVALID_TOKEN_CONTRACT,
                format!("Invalid token contract address: {token_contract}"),
            ));
        }

        let amount_units = (amount * TOKEN_DECIMALS_FACTOR) as u128;
        let to_hex = address_to_hex(to_address)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let call = match &self.settings.payout_executor_address {
            Some(executor) => {
                let token_hex = address_to_hex(token_contract)
                    .map_err(|e| ServiceError::Validation(e.to_string()))?;
                let nonce = self.read_executor_nonce(escrow, executor).await?;
                let parameter = encode_execute_payout_and_fees(
                    &token_hex,
                    nonce,
                    &to_hex,
                    amount_units,
                    &[],
                    &[],
                )
                .map_err(|e| ServiceError::Validation(e.to_string()))?;
                ContractCall {
                    owner_address: escrow.escrow_address.clone(),
                    contract_address: executor.clone(),
                    function_selector:
                        "executePayoutAndFees(address,uint256,address,uint256,address[],uint256[])"
                            .to_string(),
                    parameter,
                    fee_limit: Some(TOKEN_FEE_LIMIT),
                    call_value: None,
                    permission_id,
                }
            }
            None => ContractCall {
                owner_address: escrow.escrow_address.clone(),
                contract_address: token_contract.to_string(),
                function_selector: "transfer(address,uint256)".to_string(),
                parameter: encode_transfer(&to_hex, amount_units),
                fee_limit: Some(TOKEN_FEE_LIMIT),
                call_value: None,
                permission_id,
            },
        };

        let response = self.chain.trigger_smart_contract(&escrow.network, &call).await?;
        // The node wraps contract builds as { result, transaction }
        let unsigned_tx = response
            .get("transaction")
            .filter(|tx| tx.is_object())
            .cloned()
            .unwrap_or(response);
        Ok(unsigned_tx)
    }

    /// Read `nonces(escrow_address)` from the payout-executor contract.
    async fn read_executor_nonce(&self, escrow: &Escrow, executor: &str) -> ServiceResult<u128> {
        let escrow_hex = address_to_hex(&escrow.escrow_address)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        let call = ContractCall {
            owner_address: escrow.escrow_address.clone(),
            contract_address: executor.to_string(),
            function_selector: "nonces(address)".to_string(),
            parameter: multisig::abi_address_word(&escrow_hex),
            fee_limit: None,
            call_value: None,
            permission_id: None,
        };
        let response = self.chain.trigger_smart_contract(&escrow.network, &call).await?;
        let nonce = response
            .get("constant_result")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(Value::as_str)
            .and_then(|hex_value| u128::from_str_radix(hex_value, 16).ok())
            .unwrap_or(0);
        Ok(nonce)
    }

    /// Replace the escrow's arbiter, rewriting roles and owner list.
    pub async fn update_arbiter(&self, escrow_id: i32, new_arbiter: &str) -> ServiceResult<Escrow> {
        let new_arbiter = new_arbiter.to_string();
        with_conn(&self.pool, move |conn| {
            let Some(escrow) = Escrow::find_by_id(conn, escrow_id)? else {
                return Err(ServiceError::NotFound(format!("Escrow {escrow_id}")));
            };

            let mut roles: BTreeMap<String, String> =
                serde_json::from_value(escrow.address_roles.clone()).unwrap_or_default();
            let old_arbiter = roles
                .iter()
                .find(|(_, role)| role.as_str() == "arbiter")
                .map(|(addr, _)| addr.clone());
            if let Some(old) = &old_arbiter {
                roles.remove(old);
            }
            roles.insert(new_arbiter.clone(), "arbiter".to_string());
            let roles_value = serde_json::to_value(&roles)
                .map_err(|e| ServiceError::Validation(e.to_string()))?;

            let mut config = escrow.config()?;
            match old_arbiter {
                Some(old) if config.owner_addresses.contains(&old) => {
                    for addr in &mut config.owner_addresses {
                        if *addr == old {
                            *addr = new_arbiter.clone();
                        }
                    }
                }
                _ => config.owner_addresses.push(new_arbiter.clone()),
            }
            let config_value = serde_json::to_value(&config)
                .map_err(|e| ServiceError::Validation(e.to_string()))?;

            Escrow::set_arbiter(conn, escrow_id, &new_arbiter, &roles_value, &config_value)?;
            Escrow::find_by_id(conn, escrow_id)?
                .ok_or_else(|| ServiceError::NotFound(format!("Escrow {escrow_id}")))
        })
        .await
    }

    pub async fn update_escrow_status(
        &self,
        escrow_id: i32,
        status: EscrowStatus,
    ) -> ServiceResult<()> {
        with_conn(&self.pool, move |conn| {
            Escrow::set_status(conn, escrow_id, status).map_err(ServiceError::from)
        })
        .await
    }
}

/// Insert a fresh pending escrow with its own encrypted key.
#[allow(clippy::too_many_arguments)]
fn create_pending_escrow(
    conn: &mut diesel::PgConnection,
    blockchain: &str,
    network: &str,
    escrow_type: EscrowType,
    owner_did: &str,
    participant1: &str,
    participant2: &str,
    arbiter: &str,
    secret: &str,
) -> ServiceResult<Escrow> {
    if escrow_type == EscrowType::Contract {
        return Err(ServiceError::escrow(
            UNSUPPORTED_ESCROW_TYPE,
            "Contract-type escrows are not provisioned by this service",
        ));
    }

    let config = MultisigConfig::new(
        escrow_marketplace_common::REQUIRED_SIGNATURES,
        vec![
            participant1.to_string(),
            participant2.to_string(),
            arbiter.to_string(),
        ],
    );
    config
        .validate()
        .map_err(|e| ServiceError::Validation(e.to_string()))?;

    let mut roles = serde_json::Map::new();
    roles.insert(participant1.to_string(), json!("participant"));
    roles.insert(participant2.to_string(), json!("participant"));
    roles.insert(arbiter.to_string(), json!("arbiter"));
    let address_roles = Value::Object(roles);

    // The escrow's own key: used exactly once, to install the permission
    let mnemonic = crate::chain::keys::generate_mnemonic()
        .map_err(|e| ServiceError::Validation(e.to_string()))?;
    let encrypted_mnemonic = encryption::encrypt_data(&mnemonic, secret)
        .map_err(|e| ServiceError::Validation(e.to_string()))?;

    let escrow = Escrow::create(
        conn,
        NewEscrow {
            blockchain: blockchain.to_string(),
            network: network.to_string(),
            escrow_type: escrow_type.as_str().to_string(),
            // On creation the escrow account is the arbiter's address;
            // verification may move it if the chain says otherwise
            escrow_address: arbiter.to_string(),
            owner_did: owner_did.to_string(),
            participant1_address: participant1.to_string(),
            participant2_address: participant2.to_string(),
            arbiter_address: arbiter.to_string(),
            multisig_config: serde_json::to_value(&config)
                .map_err(|e| ServiceError::Validation(e.to_string()))?,
            address_roles,
            encrypted_mnemonic: Some(encrypted_mnemonic),
            status: EscrowStatus::Pending.as_str().to_string(),
        },
    )?;

    info!(escrow_id = escrow.id, %owner_did, "created pending escrow");
    Ok(escrow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PermissionKey;

    fn account_with(perms: Vec<Permission>) -> AccountInfo {
        AccountInfo {
            address: Some("TArb".into()),
            balance: 0,
            owner_permission: None,
            active_permission: perms,
        }
    }

    fn perm(threshold: i64, addresses: &[&str]) -> Permission {
        Permission {
            id: Some(2),
            permission_name: Some("multisig_2_of_3".into()),
            threshold,
            keys: addresses
                .iter()
                .map(|a| PermissionKey {
                    address: a.to_string(),
                    weight: 1,
                })
                .collect(),
            operations: None,
        }
    }

    #[test]
    fn no_account_is_left_to_the_provisioner() {
        assert_eq!(
            classify_active_permission(None, "TP1", "TP2"),
            PermissionVerdict::NoAccount
        );
    }

    #[test]
    fn account_without_permission_is_not_installed() {
        let account = account_with(vec![]);
        assert_eq!(
            classify_active_permission(Some(&account), "TP1", "TP2"),
            PermissionVerdict::NotInstalled
        );
    }

    #[test]
    fn wrong_threshold_or_key_count_is_ignored() {
        let account = account_with(vec![perm(1, &["TP1", "TP2", "TArb"])]);
        assert_eq!(
            classify_active_permission(Some(&account), "TP1", "TP2"),
            PermissionVerdict::NotInstalled
        );

        let account = account_with(vec![perm(2, &["TP1", "TP2"])]);
        assert_eq!(
            classify_active_permission(Some(&account), "TP1", "TP2"),
            PermissionVerdict::NotInstalled
        );
    }

    #[test]
    fn different_third_key_becomes_the_arbiter() {
        let account = account_with(vec![perm(2, &["TP1", "TP2", "TOther"])]);
        assert_eq!(
            classify_active_permission(Some(&account), "TP1", "TP2"),
            PermissionVerdict::Verified {
                arbiter: "TOther".into()
            }
        );
    }

    #[test]
    fn missing_participant_is_a_mismatch() {
        let account = account_with(vec![perm(2, &["TP1", "TX", "TArb"])]);
        assert_eq!(
            classify_active_permission(Some(&account), "TP1", "TP2"),
            PermissionVerdict::Mismatch("TP2".into())
        );
    }

    #[test]
    fn last_matching_permission_wins() {
        let account = account_with(vec![
            perm(2, &["TP1", "TP2", "TOld"]),
            perm(2, &["TP1", "TP2", "TNew"]),
        ]);
        assert_eq!(
            classify_active_permission(Some(&account), "TP1", "TP2"),
            PermissionVerdict::Verified {
                arbiter: "TNew".into()
            }
        );
    }
}
