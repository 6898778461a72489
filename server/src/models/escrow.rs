//! Escrow model and related database operations

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::chain::multisig::MultisigConfig;
use crate::schema::escrows;

/// Escrow provisioning status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    /// Created, waiting for the provisioner to fund and install permissions
    Pending,
    /// 2-of-3 permission installed and verified
    Active,
    /// Retired; treated as non-existent by lookups
    Inactive,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Active => "active",
            EscrowStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for EscrowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EscrowStatus::Pending),
            "active" => Ok(EscrowStatus::Active),
            "inactive" => Ok(EscrowStatus::Inactive),
            _ => anyhow::bail!("Invalid escrow status: {}", s),
        }
    }
}

/// How the escrow account is controlled on chain.
///
/// `Multisig` installs an account permission; `Contract` is the planned
/// deploy/init flow and branches at provisioning and payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowType {
    Multisig,
    Contract,
}

impl EscrowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowType::Multisig => "multisig",
            EscrowType::Contract => "contract",
        }
    }
}

impl FromStr for EscrowType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multisig" => Ok(EscrowType::Multisig),
            "contract" => Ok(EscrowType::Contract),
            _ => anyhow::bail!("Invalid escrow type: {}", s),
        }
    }
}

/// Escrow database model
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = escrows)]
pub struct Escrow {
    pub id: i32,
    pub blockchain: String,
    pub network: String,
    pub escrow_type: String,
    pub escrow_address: String,
    pub owner_did: String,
    pub participant1_address: String,
    pub participant2_address: String,
    pub arbiter_address: String,
    pub multisig_config: Value,
    pub address_roles: Value,
    pub encrypted_mnemonic: Option<String>,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// New escrow for insertion
#[derive(Debug, Insertable)]
#[diesel(table_name = escrows)]
pub struct NewEscrow {
    pub blockchain: String,
    pub network: String,
    pub escrow_type: String,
    pub escrow_address: String,
    pub owner_did: String,
    pub participant1_address: String,
    pub participant2_address: String,
    pub arbiter_address: String,
    pub multisig_config: Value,
    pub address_roles: Value,
    pub encrypted_mnemonic: Option<String>,
    pub status: String,
}

impl Escrow {
    pub fn status(&self) -> Result<EscrowStatus> {
        self.status.parse()
    }

    pub fn escrow_type(&self) -> Result<EscrowType> {
        self.escrow_type.parse()
    }

    /// The stored multisig config snapshot.
    pub fn config(&self) -> Result<MultisigConfig> {
        serde_json::from_value(self.multisig_config.clone())
            .context("Escrow multisig_config is malformed")
    }

    /// Addresses mapped to the `participant` role, in stored order.
    pub fn participant_addresses(&self) -> Vec<String> {
        let roles: BTreeMap<String, String> =
            serde_json::from_value(self.address_roles.clone()).unwrap_or_default();
        roles
            .into_iter()
            .filter(|(_, role)| role == "participant")
            .map(|(addr, _)| addr)
            .collect()
    }

    /// Create a new escrow in the database
    pub fn create(conn: &mut PgConnection, new_escrow: NewEscrow) -> Result<Escrow> {
        diesel::insert_into(escrows::table)
            .values(&new_escrow)
            .get_result(conn)
            .context("Failed to insert escrow")
    }

    /// Find escrow by ID
    pub fn find_by_id(conn: &mut PgConnection, escrow_id: i32) -> Result<Option<Escrow>> {
        escrows::table
            .find(escrow_id)
            .first(conn)
            .optional()
            .with_context(|| format!("Failed to load escrow {escrow_id}"))
    }

    /// Find a non-inactive escrow for an unordered participant pair.
    pub fn find_live_for_pair(
        conn: &mut PgConnection,
        blockchain: &str,
        network: &str,
        participant1: &str,
        participant2: &str,
    ) -> Result<Option<Escrow>> {
        escrows::table
            .filter(escrows::blockchain.eq(blockchain))
            .filter(escrows::network.eq(network))
            .filter(escrows::status.ne(EscrowStatus::Inactive.as_str()))
            .filter(
                escrows::participant1_address
                    .eq(participant1)
                    .and(escrows::participant2_address.eq(participant2))
                    .or(escrows::participant1_address
                        .eq(participant2)
                        .and(escrows::participant2_address.eq(participant1))),
            )
            .first(conn)
            .optional()
            .context("Failed to look up escrow by participants")
    }

    /// Find a non-inactive escrow for an owner's deduplication scope:
    /// same chain/network/type/owner, unordered participant pair, arbiter.
    #[allow(clippy::too_many_arguments)]
    pub fn find_live_for_owner(
        conn: &mut PgConnection,
        blockchain: &str,
        network: &str,
        escrow_type: EscrowType,
        owner_did: &str,
        participant1: &str,
        participant2: &str,
        arbiter: &str,
    ) -> Result<Option<Escrow>> {
        escrows::table
            .filter(escrows::blockchain.eq(blockchain))
            .filter(escrows::network.eq(network))
            .filter(escrows::escrow_type.eq(escrow_type.as_str()))
            .filter(escrows::owner_did.eq(owner_did))
            .filter(escrows::status.ne(EscrowStatus::Inactive.as_str()))
            .filter(
                escrows::participant1_address
                    .eq(participant1)
                    .and(escrows::participant2_address.eq(participant2))
                    .or(escrows::participant1_address
                        .eq(participant2)
                        .and(escrows::participant2_address.eq(participant1))),
            )
            .filter(escrows::arbiter_address.eq(arbiter))
            .first(conn)
            .optional()
            .context("Failed to look up escrow for owner")
    }

    /// Lock the next page of pending escrows for the provisioner.
    ///
    /// `FOR UPDATE SKIP LOCKED`: competing workers never see each other's
    /// rows; the locks drop at the enclosing transaction's commit.
    pub fn lock_pending_batch(
        conn: &mut PgConnection,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<Escrow>> {
        escrows::table
            .filter(escrows::status.eq(EscrowStatus::Pending.as_str()))
            .order(escrows::id)
            .offset(page * page_size)
            .limit(page_size)
            .for_update()
            .skip_locked()
            .load(conn)
            .context("Failed to lock pending escrow batch")
    }

    /// Update escrow status
    pub fn set_status(conn: &mut PgConnection, escrow_id: i32, status: EscrowStatus) -> Result<()> {
        diesel::update(escrows::table.find(escrow_id))
            .set((
                escrows::status.eq(status.as_str()),
                escrows::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update status for escrow {escrow_id}"))?;
        Ok(())
    }

    /// Replace the arbiter and the derived role/config fields together.
    pub fn set_arbiter(
        conn: &mut PgConnection,
        escrow_id: i32,
        arbiter_address: &str,
        address_roles: &Value,
        multisig_config: &Value,
    ) -> Result<()> {
        diesel::update(escrows::table.find(escrow_id))
            .set((
                escrows::arbiter_address.eq(arbiter_address),
                escrows::address_roles.eq(address_roles),
                escrows::multisig_config.eq(multisig_config),
                escrows::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update arbiter for escrow {escrow_id}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(roles: Value) -> Escrow {
        Escrow {
            id: 1,
            blockchain: "tron".into(),
            network: "mainnet".into(),
            escrow_type: "multisig".into(),
            escrow_address: "TArb".into(),
            owner_did: "did:tron:towner".into(),
            participant1_address: "TP1".into(),
            participant2_address: "TP2".into(),
            arbiter_address: "TArb".into(),
            multisig_config: json!({
                "required_signatures": 2,
                "total_owners": 3,
                "owner_addresses": ["TP1", "TP2", "TArb"],
            }),
            address_roles: roles,
            encrypted_mnemonic: None,
            status: "pending".into(),
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn parses_config_and_roles() {
        let escrow = sample(json!({
            "TP1": "participant",
            "TP2": "participant",
            "TArb": "arbiter",
        }));
        let config = escrow.config().unwrap();
        assert_eq!(config.required_signatures, 2);
        assert_eq!(config.owner_addresses.len(), 3);

        let participants = escrow.participant_addresses();
        assert_eq!(participants, vec!["TP1".to_string(), "TP2".to_string()]);
    }

    #[test]
    fn status_and_type_round_trip() {
        assert_eq!("pending".parse::<EscrowStatus>().unwrap(), EscrowStatus::Pending);
        assert_eq!(EscrowStatus::Inactive.as_str(), "inactive");
        assert!("limbo".parse::<EscrowStatus>().is_err());

        assert_eq!("multisig".parse::<EscrowType>().unwrap(), EscrowType::Multisig);
        assert_eq!("contract".parse::<EscrowType>().unwrap(), EscrowType::Contract);
        assert!("subclass".parse::<EscrowType>().is_err());
    }
}
