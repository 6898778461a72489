//! Administrative arbiter wallet management
//!
//! One wallet row carries `role = 'arbiter'` at any time; promoting a new
//! wallet demotes the previous one to `arbiter-backup` inside the same
//! transaction, so the provisioner always resolves exactly one funder.

use diesel::prelude::*;
use secp256k1::SecretKey;
use tracing::info;

use crate::chain::keys;
use crate::crypto::encryption;
use crate::db::{with_conn, DbPool};
use crate::error::{ServiceError, ServiceResult};
use crate::models::wallet::{NewWallet, Wallet, ROLE_ARBITER, ROLE_ARBITER_BACKUP};

pub struct ArbiterService;

impl ArbiterService {
    /// The active arbiter wallet, if one is configured.
    pub fn active_wallet(conn: &mut PgConnection) -> ServiceResult<Option<Wallet>> {
        Ok(Wallet::find_active_arbiter(conn)?)
    }

    /// Decrypt the active arbiter's signing key.
    ///
    /// Returns `None` when no active wallet exists or it carries no
    /// mnemonic; the provisioner classifies that as a configuration error.
    pub fn active_signing_key(
        conn: &mut PgConnection,
        secret: &str,
    ) -> ServiceResult<Option<(Wallet, SecretKey)>> {
        let Some(wallet) = Wallet::find_active_arbiter(conn)? else {
            return Ok(None);
        };
        let Some(encrypted) = wallet.encrypted_mnemonic.clone() else {
            return Ok(None);
        };
        let mnemonic = encryption::decrypt_data(&encrypted, secret)
            .map_err(|e| ServiceError::Validation(format!("arbiter mnemonic: {e}")))?;
        let key = keys::private_key_from_mnemonic(&mnemonic)
            .map_err(|e| ServiceError::Validation(format!("arbiter key: {e}")))?;
        Ok(Some((wallet, key)))
    }

    /// Register a new arbiter wallet from a mnemonic and make it active.
    ///
    /// The previous active wallet (if any) is demoted in the same
    /// transaction: a two-row swap, never zero or two active arbiters.
    pub async fn create_arbiter_wallet(
        pool: &DbPool,
        mnemonic: String,
        name: String,
        secret: String,
    ) -> ServiceResult<Wallet> {
        let key = keys::private_key_from_mnemonic(&mnemonic)
            .map_err(|e| ServiceError::Validation(format!("Invalid mnemonic: {e}")))?;
        let address = keys::tron_address_from_key(&key);

        with_conn(pool, move |conn| {
            conn.transaction(|conn| {
                if Wallet::find_by_address(conn, &address)?.is_some() {
                    return Err(ServiceError::Validation(format!(
                        "Wallet address already registered: {address}"
                    )));
                }

                if let Some(active) = Wallet::find_active_arbiter(conn)? {
                    Wallet::set_role(conn, active.id, ROLE_ARBITER_BACKUP)?;
                    info!(
                        wallet_id = active.id,
                        name = %active.name,
                        "demoted previous arbiter wallet to backup"
                    );
                }

                let encrypted = encryption::encrypt_data(&mnemonic, &secret)
                    .map_err(|e| ServiceError::Validation(e.to_string()))?;

                let wallet = Wallet::create(
                    conn,
                    NewWallet {
                        name,
                        encrypted_mnemonic: Some(encrypted),
                        address,
                        role: ROLE_ARBITER.to_string(),
                    },
                )?;
                info!(wallet_id = wallet.id, address = %wallet.address, "activated arbiter wallet");
                Ok(wallet)
            })
        })
        .await
    }

    /// Promote an existing backup wallet to active, demoting the current
    /// arbiter in the same transaction.
    pub async fn promote_backup(pool: &DbPool, wallet_id: i32) -> ServiceResult<Wallet> {
        with_conn(pool, move |conn| {
            conn.transaction(|conn| {
                let backups = Wallet::list_by_role(conn, ROLE_ARBITER_BACKUP)?;
                let Some(backup) = backups.into_iter().find(|w| w.id == wallet_id) else {
                    return Err(ServiceError::NotFound(format!(
                        "Backup arbiter wallet {wallet_id}"
                    )));
                };

                if let Some(active) = Wallet::find_active_arbiter(conn)? {
                    Wallet::set_role(conn, active.id, ROLE_ARBITER_BACKUP)?;
                }
                Wallet::set_role(conn, backup.id, ROLE_ARBITER)?;

                Wallet::find_active_arbiter(conn)?
                    .ok_or_else(|| ServiceError::NotFound("active arbiter wallet".into()))
            })
        })
        .await
    }
}
