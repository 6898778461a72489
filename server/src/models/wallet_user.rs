//! End-user wallet directory
//!
//! One row per `(wallet_address, blockchain)`; the derived DID is globally
//! unique and is how deals and chat records name their participants.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::wallet_users;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = wallet_users)]
pub struct WalletUser {
    pub id: i32,
    pub wallet_address: String,
    pub blockchain: String,
    pub did: String,
    pub nickname: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = wallet_users)]
pub struct NewWalletUser {
    pub wallet_address: String,
    pub blockchain: String,
    pub did: String,
    pub nickname: Option<String>,
}

impl WalletUser {
    pub fn create(conn: &mut PgConnection, new_user: NewWalletUser) -> Result<WalletUser> {
        diesel::insert_into(wallet_users::table)
            .values(&new_user)
            .get_result(conn)
            .context("Failed to insert wallet user")
    }

    pub fn find_by_did(conn: &mut PgConnection, did: &str) -> Result<Option<WalletUser>> {
        wallet_users::table
            .filter(wallet_users::did.eq(did))
            .first(conn)
            .optional()
            .with_context(|| format!("Failed to load wallet user {did}"))
    }

    /// Resolve a participant DID to their on-chain address.
    pub fn address_by_did(conn: &mut PgConnection, did: &str) -> Result<Option<String>> {
        Ok(Self::find_by_did(conn, did)?.map(|user| user.wallet_address))
    }

    /// Display name used in service chat messages.
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.did)
    }

    /// Nickname for a DID, falling back to the DID itself.
    pub fn nickname_for(conn: &mut PgConnection, did: &str) -> Result<String> {
        Ok(Self::find_by_did(conn, did)?
            .map(|user| user.display_name().to_string())
            .unwrap_or_else(|| did.to_string()))
    }
}
