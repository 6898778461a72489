//! Escrow provisioning reconciliation loop
//!
//! Advances pending escrows to `active`: verifies whether the 2-of-3
//! permission is already installed, tops the account up to the minimum
//! native balance from the active arbiter wallet, then installs the
//! multisig permission with the escrow's own key. Row locks with
//! skip-locked semantics keep competing workers on disjoint escrows.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use diesel::prelude::*;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::chain::multisig::{permission_update_2_of_3, sign_tx_id, signed_transaction};
use crate::chain::{keys, AccountInfo, ChainClient};
use crate::config::Settings;
use crate::crypto::encryption;
use crate::db::DbPool;
use crate::error::ServiceResult;
use crate::models::escrow::{Escrow, EscrowStatus};
use crate::models::escrow_txn::{EscrowTxn, TXN_TYPE_EVENT, TXN_TYPE_TXN};
use crate::services::arbiter::ArbiterService;

const SUN_PER_COIN: f64 = 1e6;

/// Classified provisioning failures recorded in the escrow journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionErrorCode {
    ArbiterMnemonicNotConfigured,
    ArbiterAddressNotSet,
    TrxTransferFailed,
    EscrowMnemonicNotConfigured,
    PermissionUpdateFailed,
    ProcessingError,
}

impl ProvisionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionErrorCode::ArbiterMnemonicNotConfigured => "ARBITER_MNEMONIC_NOT_CONFIGURED",
            ProvisionErrorCode::ArbiterAddressNotSet => "ARBITER_ADDRESS_NOT_SET",
            ProvisionErrorCode::TrxTransferFailed => "TRX_TRANSFER_FAILED",
            ProvisionErrorCode::EscrowMnemonicNotConfigured => "ESCROW_MNEMONIC_NOT_CONFIGURED",
            ProvisionErrorCode::PermissionUpdateFailed => "PERMISSION_UPDATE_FAILED",
            ProvisionErrorCode::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

/// Tuning for the reconciliation loop
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Seconds between reconciliation ticks
    pub poll_interval_secs: u64,
    /// Rows locked per batch; locks release at the batch commit
    pub batch_size: i64,
    /// Page cap per tick, so one worker yields to other tasks
    pub max_pages: i64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            batch_size: 10,
            max_pages: 100,
        }
    }
}

/// Background reconciliation worker
pub struct EscrowProvisioner {
    pool: DbPool,
    chain: Arc<dyn ChainClient>,
    settings: Arc<Settings>,
    config: ProvisionerConfig,
}

impl EscrowProvisioner {
    pub fn new(
        pool: DbPool,
        chain: Arc<dyn ChainClient>,
        settings: Arc<Settings>,
        config: ProvisionerConfig,
    ) -> Self {
        info!(
            poll_interval_secs = config.poll_interval_secs,
            batch_size = config.batch_size,
            "EscrowProvisioner initialized"
        );
        Self {
            pool,
            chain,
            settings,
            config,
        }
    }

    /// Run the reconciliation loop forever.
    pub async fn run(self: Arc<Self>) {
        let mut timer = interval(Duration::from_secs(self.config.poll_interval_secs));
        info!("Starting escrow provisioning loop");
        loop {
            timer.tick().await;
            match self.tick().await {
                Ok(0) => {}
                Ok(processed) => info!(processed, "provisioner tick complete"),
                Err(e) => error!("provisioner tick failed: {e:#}"),
            }
        }
    }

    /// Process every pending escrow reachable this tick.
    ///
    /// Each batch runs in its own transaction on a blocking-pool thread;
    /// chain futures are driven with `Handle::block_on` so the row locks
    /// are held for exactly one batch.
    pub async fn tick(&self) -> ServiceResult<usize> {
        let pool = self.pool.clone();
        let chain = self.chain.clone();
        let settings = self.settings.clone();
        let config = self.config.clone();
        let handle = Handle::current();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let mut page = 0;
            let mut total = 0usize;

            loop {
                let processed = conn.transaction::<usize, anyhow::Error, _>(|conn| {
                    let escrows = Escrow::lock_pending_batch(conn, page, config.batch_size)?;
                    let count = escrows.len();
                    for escrow in escrows {
                        if let Err(e) =
                            process_escrow(conn, &handle, chain.as_ref(), &settings, &escrow)
                        {
                            error!(escrow_id = escrow.id, "failed to process escrow: {e:#}");
                            record_processing_error(conn, escrow.id, &format!("{e:#}"));
                        }
                    }
                    Ok(count)
                })?;

                total += processed;
                if (processed as i64) < config.batch_size {
                    break;
                }
                page += 1;
                if page >= config.max_pages {
                    break;
                }
            }
            Ok(total)
        })
        .await?
        .map_err(crate::error::ServiceError::Other)
    }
}

/// True when the installed permission already satisfies the 2-of-3 policy
/// for this escrow's participants.
pub(crate) fn permission_satisfied(account: Option<&AccountInfo>, escrow: &Escrow) -> bool {
    let Some(account) = account else {
        return false;
    };
    account.active_permission.iter().any(|perm| {
        perm.threshold == 2
            && perm.keys.len() == 3
            && perm.has_key(&escrow.participant1_address)
            && perm.has_key(&escrow.participant2_address)
            && (perm.has_key(&escrow.arbiter_address) || perm.has_key(&escrow.escrow_address))
    })
}

/// Reconcile one locked escrow row.
fn process_escrow(
    conn: &mut PgConnection,
    handle: &Handle,
    chain: &dyn ChainClient,
    settings: &Settings,
    escrow: &Escrow,
) -> Result<()> {
    info!(
        escrow_id = escrow.id,
        status = %escrow.status,
        blockchain = %escrow.blockchain,
        network = %escrow.network,
        address = %escrow.escrow_address,
        "processing escrow"
    );

    let mut journal = EscrowTxn::get_or_create(conn, escrow.id)?;

    // Step 1: already initialized?
    let account = handle
        .block_on(chain.get_account(&escrow.network, &escrow.escrow_address))
        .context("get_account failed")?;
    if account.is_none() {
        info!(
            escrow_id = escrow.id,
            "account not activated on chain yet, will top up native balance"
        );
    }

    if permission_satisfied(account.as_ref(), escrow) {
        info!(escrow_id = escrow.id, "permissions already set, promoting to active");
        Escrow::set_status(conn, escrow.id, EscrowStatus::Active)?;
        journal.record(
            conn,
            TXN_TYPE_EVENT,
            "Escrow already initialized: permissions set, status updated to active",
            Some(json!({ "type": "already_initialized", "status": "active" })),
            None,
            None,
            false,
        )?;
        return Ok(());
    }

    // Step 2: fund if short
    let balance = handle
        .block_on(chain.get_balance(&escrow.network, &escrow.escrow_address))
        .context("get_balance failed")?;
    let min_balance = settings.escrow_min_native_balance;
    info!(
        escrow_id = escrow.id,
        balance, min_balance, "checked escrow native balance"
    );

    if balance < min_balance {
        let amount_needed = min_balance - balance;
        return fund_escrow(conn, handle, chain, settings, escrow, &mut journal, amount_needed);
    }

    // Step 3: install the 2-of-3 permission
    install_permissions(conn, handle, chain, settings, escrow, &mut journal)
}

/// Transfer the missing native balance from the active arbiter wallet.
fn fund_escrow(
    conn: &mut PgConnection,
    handle: &Handle,
    chain: &dyn ChainClient,
    settings: &Settings,
    escrow: &Escrow,
    journal: &mut EscrowTxn,
    amount: f64,
) -> Result<()> {
    info!(escrow_id = escrow.id, amount, "escrow needs native coin top-up");

    let arbiter = match ArbiterService::active_signing_key(conn, &settings.secret) {
        Ok(Some(found)) => found,
        Ok(None) | Err(_) => {
            let message = "Active arbiter wallet not found or mnemonic not configured";
            record_error(
                conn,
                journal,
                ProvisionErrorCode::ArbiterMnemonicNotConfigured,
                message,
            )?;
            return Ok(());
        }
    };
    let (arbiter_wallet, arbiter_key) = arbiter;

    if escrow.arbiter_address.trim().is_empty() {
        record_error(
            conn,
            journal,
            ProvisionErrorCode::ArbiterAddressNotSet,
            "Arbiter address not set in escrow",
        )?;
        return Ok(());
    }

    let outcome = (|| -> Result<String> {
        let unsigned = handle.block_on(chain.create_transaction(
            &escrow.network,
            &arbiter_wallet.address,
            &escrow.escrow_address,
            (amount * SUN_PER_COIN) as i64,
            None,
        ))?;
        let tx_id = unsigned
            .get("txID")
            .and_then(serde_json::Value::as_str)
            .context("Failed to create transaction: no txID in response")?
            .to_string();

        // Single-signature transfer from the arbiter wallet
        let signature = sign_tx_id(&tx_id, &arbiter_key)?;
        let signed = signed_transaction(&unsigned, vec![signature]);

        let broadcast = handle.block_on(chain.broadcast_transaction(&escrow.network, &signed))?;
        if !broadcast.result {
            anyhow::bail!("Broadcast failed: {}", broadcast.error_text());
        }
        Ok(tx_id)
    })();

    match outcome {
        Ok(tx_id) => {
            info!(escrow_id = escrow.id, %tx_id, "native transfer broadcast");
            journal.record(
                conn,
                TXN_TYPE_TXN,
                &format!(
                    "Native transfer: {:.6} to {}",
                    amount, escrow.escrow_address
                ),
                Some(json!({ "tx_id": tx_id, "amount": amount, "type": "trx_transfer" })),
                None,
                None,
                false,
            )?;
        }
        Err(e) => {
            warn!(escrow_id = escrow.id, "native transfer failed: {e:#}");
            record_error(
                conn,
                journal,
                ProvisionErrorCode::TrxTransferFailed,
                &format!("{e:#}"),
            )?;
        }
    }
    Ok(())
}

/// Install the 2-of-3 owner and active permissions with the escrow's key.
fn install_permissions(
    conn: &mut PgConnection,
    handle: &Handle,
    chain: &dyn ChainClient,
    settings: &Settings,
    escrow: &Escrow,
    journal: &mut EscrowTxn,
) -> Result<()> {
    info!(escrow_id = escrow.id, "installing 2-of-3 multisig permission");

    let Some(encrypted) = escrow.encrypted_mnemonic.clone() else {
        record_error(
            conn,
            journal,
            ProvisionErrorCode::EscrowMnemonicNotConfigured,
            "Escrow encrypted mnemonic not found or not configured",
        )?;
        return Ok(());
    };
    let escrow_key = match encryption::decrypt_data(&encrypted, &settings.secret)
        .and_then(|mnemonic| keys::private_key_from_mnemonic(&mnemonic))
    {
        Ok(key) => key,
        Err(e) => {
            record_error(
                conn,
                journal,
                ProvisionErrorCode::EscrowMnemonicNotConfigured,
                &format!("Escrow mnemonic unusable: {e:#}"),
            )?;
            return Ok(());
        }
    };

    let outcome = (|| -> Result<String> {
        // Weight-sum guard lives inside the permission builder
        let update = permission_update_2_of_3(
            &escrow.participant1_address,
            &escrow.participant2_address,
            &escrow.arbiter_address,
        )?;

        let unsigned = handle.block_on(chain.update_account_permission(
            &escrow.network,
            &escrow.escrow_address,
            &update,
        ))?;
        let tx_id = unsigned
            .get("txID")
            .and_then(serde_json::Value::as_str)
            .context("Failed to create update permission transaction: no txID")?
            .to_string();

        // The escrow key is still the sole owner of its address
        let signature = sign_tx_id(&tx_id, &escrow_key)?;
        let signed = signed_transaction(&unsigned, vec![signature]);

        let broadcast = handle.block_on(chain.broadcast_transaction(&escrow.network, &signed))?;
        if !broadcast.result {
            anyhow::bail!("Broadcast failed: {}", broadcast.error_text());
        }
        Ok(tx_id)
    })();

    match outcome {
        Ok(tx_id) => {
            info!(escrow_id = escrow.id, %tx_id, "permission update broadcast");
            journal.record(
                conn,
                TXN_TYPE_TXN,
                "Permissions updated: multisig 2/3",
                Some(json!({ "tx_id": tx_id, "type": "permission_update" })),
                None,
                None,
                false,
            )?;

            Escrow::set_status(conn, escrow.id, EscrowStatus::Active)?;
            journal.record(
                conn,
                TXN_TYPE_EVENT,
                "Escrow initialized: permissions set, status updated to active",
                Some(json!({ "type": "initialization_complete", "status": "active" })),
                None,
                None,
                false,
            )?;
        }
        Err(e) => {
            warn!(escrow_id = escrow.id, "permission update failed: {e:#}");
            record_error(
                conn,
                journal,
                ProvisionErrorCode::PermissionUpdateFailed,
                &format!("{e:#}"),
            )?;
        }
    }
    Ok(())
}

/// Record a classified error, coalescing repeats into the counter.
fn record_error(
    conn: &mut PgConnection,
    journal: &mut EscrowTxn,
    code: ProvisionErrorCode,
    message: &str,
) -> Result<()> {
    let is_duplicate = journal.is_same_error(code.as_str(), message);
    journal.record(
        conn,
        TXN_TYPE_EVENT,
        &format!("Error: {message}"),
        None,
        Some(code.as_str()),
        Some(message),
        is_duplicate,
    )
}

/// Best-effort journal write for an unexpected processing failure.
fn record_processing_error(conn: &mut PgConnection, escrow_id: i32, message: &str) {
    let result = EscrowTxn::get_or_create(conn, escrow_id).and_then(|mut journal| {
        record_error(conn, &mut journal, ProvisionErrorCode::ProcessingError, message)
    });
    if let Err(e) = result {
        error!(escrow_id, "failed to record processing error: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Permission, PermissionKey};
    use chrono::Utc;
    use serde_json::json;

    fn escrow() -> Escrow {
        Escrow {
            id: 7,
            blockchain: "tron".into(),
            network: "mainnet".into(),
            escrow_type: "multisig".into(),
            escrow_address: "TEsc".into(),
            owner_did: "did:tron:towner".into(),
            participant1_address: "TP1".into(),
            participant2_address: "TP2".into(),
            arbiter_address: "TArb".into(),
            multisig_config: json!({
                "required_signatures": 2,
                "total_owners": 3,
                "owner_addresses": ["TP1", "TP2", "TArb"],
            }),
            address_roles: json!({"TP1": "participant", "TP2": "participant", "TArb": "arbiter"}),
            encrypted_mnemonic: None,
            status: "pending".into(),
            created_at: Utc::now().naive_utc(),
            updated_at: Utc::now().naive_utc(),
        }
    }

    fn account(perms: Vec<Permission>) -> AccountInfo {
        AccountInfo {
            address: Some("TEsc".into()),
            balance: 0,
            owner_permission: None,
            active_permission: perms,
        }
    }

    fn perm(threshold: i64, addresses: &[&str]) -> Permission {
        Permission {
            id: None,
            permission_name: None,
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
    fn missing_account_is_not_satisfied() {
        assert!(!permission_satisfied(None, &escrow()));
    }

    #[test]
    fn matching_permission_is_satisfied() {
        let info = account(vec![perm(2, &["TP1", "TP2", "TArb"])]);
        assert!(permission_satisfied(Some(&info), &escrow()));
    }

    #[test]
    fn escrow_address_may_stand_in_for_the_arbiter() {
        let info = account(vec![perm(2, &["TP1", "TP2", "TEsc"])]);
        assert!(permission_satisfied(Some(&info), &escrow()));
    }

    #[test]
    fn wrong_threshold_or_members_are_rejected() {
        let info = account(vec![perm(1, &["TP1", "TP2", "TArb"])]);
        assert!(!permission_satisfied(Some(&info), &escrow()));

        let info = account(vec![perm(2, &["TP1", "TX", "TArb"])]);
        assert!(!permission_satisfied(Some(&info), &escrow()));

        let info = account(vec![perm(2, &["TP1", "TP2"])]);
        assert!(!permission_satisfied(Some(&info), &escrow()));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            ProvisionErrorCode::ArbiterMnemonicNotConfigured.as_str(),
            "ARBITER_MNEMONIC_NOT_CONFIGURED"
        );
        assert_eq!(
            ProvisionErrorCode::TrxTransferFailed.as_str(),
            "TRX_TRANSFER_FAILED"
        );
        assert_eq!(
            ProvisionErrorCode::PermissionUpdateFailed.as_str(),
            "PERMISSION_UPDATE_FAILED"
        );
    }
}
