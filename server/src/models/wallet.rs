//! Administrative signing wallets
//!
//! The provisioner funds new escrow accounts from the single active
//! arbiter wallet (`role = 'arbiter'`); retired arbiters keep their rows
//! as `arbiter-backup`.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::wallets;

pub const ROLE_ARBITER: &str = "arbiter";
pub const ROLE_ARBITER_BACKUP: &str = "arbiter-backup";

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = wallets)]
pub struct Wallet {
    pub id: i32,
    pub name: String,
    pub encrypted_mnemonic: Option<String>,
    pub address: String,
    pub role: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = wallets)]
pub struct NewWallet {
    pub name: String,
    pub encrypted_mnemonic: Option<String>,
    pub address: String,
    pub role: String,
}

impl Wallet {
    pub fn create(conn: &mut PgConnection, new_wallet: NewWallet) -> Result<Wallet> {
        diesel::insert_into(wallets::table)
            .values(&new_wallet)
            .get_result(conn)
            .context("Failed to insert wallet")
    }

    /// The globally unique active arbiter wallet, if configured.
    pub fn find_active_arbiter(conn: &mut PgConnection) -> Result<Option<Wallet>> {
        wallets::table
            .filter(wallets::role.eq(ROLE_ARBITER))
            .first(conn)
            .optional()
            .context("Failed to load active arbiter wallet")
    }

    pub fn find_by_address(conn: &mut PgConnection, address: &str) -> Result<Option<Wallet>> {
        wallets::table
            .filter(wallets::address.eq(address))
            .first(conn)
            .optional()
            .with_context(|| format!("Failed to load wallet {address}"))
    }

    pub fn list_by_role(conn: &mut PgConnection, role: &str) -> Result<Vec<Wallet>> {
        wallets::table
            .filter(wallets::role.eq(role))
            .order(wallets::id)
            .load(conn)
            .with_context(|| format!("Failed to load wallets with role {role}"))
    }

    pub fn set_role(conn: &mut PgConnection, wallet_id: i32, role: &str) -> Result<()> {
        diesel::update(wallets::table.find(wallet_id))
            .set(wallets::role.eq(role))
            .execute(conn)
            .with_context(|| format!("Failed to update role for wallet {wallet_id}"))?;
        Ok(())
    }
}
