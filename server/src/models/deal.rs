//! Deal model and related database operations

use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::schema::deals;

/// Deal status enum tracking the settlement lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    /// Deal created, awaiting the sender's deposit into the escrow
    WaitDeposit,
    /// Deposit observed on chain, payout awaiting signatures
    Processing,
    /// A party filed an appeal, awaiting the arbiter
    WaitArbiter,
    /// Appeal registered
    Appeal,
    /// Arbiter declined the resolution and sent it back
    ReclineAppeal,
    /// Arbiter directed the payout back to the sender
    ResolvingSender,
    /// Arbiter directed the payout to the receiver
    ResolvingReceiver,
    /// Payout to the receiver confirmed on chain
    Success,
    /// Refund to the sender confirmed on chain
    ResolvedSender,
    /// Arbiter-directed payout to the receiver confirmed on chain
    ResolvedReceiver,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::WaitDeposit => "wait_deposit",
            DealStatus::Processing => "processing",
            DealStatus::WaitArbiter => "wait_arbiter",
            DealStatus::Appeal => "appeal",
            DealStatus::ReclineAppeal => "recline_appeal",
            DealStatus::ResolvingSender => "resolving_sender",
            DealStatus::ResolvingReceiver => "resolving_receiver",
            DealStatus::Success => "success",
            DealStatus::ResolvedSender => "resolved_sender",
            DealStatus::ResolvedReceiver => "resolved_receiver",
        }
    }

    /// Statuses under arbiter control after an appeal was filed
    pub fn is_appeal(&self) -> bool {
        matches!(
            self,
            DealStatus::WaitArbiter
                | DealStatus::Appeal
                | DealStatus::ReclineAppeal
                | DealStatus::ResolvingSender
                | DealStatus::ResolvingReceiver
        )
    }

    /// Terminal statuses (until explicit arbiter intervention)
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            DealStatus::Success | DealStatus::ResolvedSender | DealStatus::ResolvedReceiver
        )
    }
}

impl FromStr for DealStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait_deposit" => Ok(DealStatus::WaitDeposit),
            "processing" => Ok(DealStatus::Processing),
            "wait_arbiter" => Ok(DealStatus::WaitArbiter),
            "appeal" => Ok(DealStatus::Appeal),
            "recline_appeal" => Ok(DealStatus::ReclineAppeal),
            "resolving_sender" => Ok(DealStatus::ResolvingSender),
            "resolving_receiver" => Ok(DealStatus::ResolvingReceiver),
            "success" => Ok(DealStatus::Success),
            "resolved_sender" => Ok(DealStatus::ResolvedSender),
            "resolved_receiver" => Ok(DealStatus::ResolvedReceiver),
            _ => anyhow::bail!("Invalid deal status: {}", s),
        }
    }
}

/// One collected signature inside a payout payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutSignature {
    pub signer_address: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_index: Option<u32>,
}

/// The persisted payout bundle on `deal.payout_txn`:
/// the unsigned transaction, the multisig config snapshot and the
/// signatures collected so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutPayload {
    pub blockchain: String,
    pub network: String,
    pub escrow_id: i32,
    pub to_address: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_contract: Option<String>,
    pub unsigned_tx: Value,
    #[serde(default)]
    pub contract_data: Value,
    #[serde(default = "default_required_signatures")]
    pub required_signatures: u32,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub arbiter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_addresses: Option<Vec<String>>,
    pub contract_type: String,
    #[serde(default)]
    pub signatures: Vec<PayoutSignature>,
}

fn default_required_signatures() -> u32 {
    escrow_marketplace_common::REQUIRED_SIGNATURES
}

impl PayoutPayload {
    pub fn from_value(value: &Value) -> Option<PayoutPayload> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("payout payload serializes")
    }

    /// Transaction id of the embedded unsigned transaction, if present.
    pub fn tx_id(&self) -> Option<String> {
        self.unsigned_tx
            .get("txID")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Deal database model
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = deals)]
pub struct Deal {
    pub id: i64,
    pub uid: String,
    pub sender_did: String,
    pub receiver_did: String,
    pub arbiter_did: String,
    pub label: String,
    pub description: Option<String>,
    pub amount: Option<BigDecimal>,
    pub need_receiver_approve: bool,
    pub status: String,
    pub escrow_id: Option<i32>,
    pub requisites: Option<Value>,
    pub attachments: Option<Value>,
    pub payout_txn: Option<Value>,
    pub deposit_txn_hash: Option<String>,
    pub payout_txn_hash: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// New deal for insertion
#[derive(Debug, Insertable)]
#[diesel(table_name = deals)]
pub struct NewDeal {
    pub uid: String,
    pub sender_did: String,
    pub receiver_did: String,
    pub arbiter_did: String,
    pub label: String,
    pub description: Option<String>,
    pub amount: Option<BigDecimal>,
    pub need_receiver_approve: bool,
    pub status: String,
    pub escrow_id: Option<i32>,
    pub requisites: Option<Value>,
}

impl Deal {
    pub fn status(&self) -> Result<DealStatus> {
        self.status.parse()
    }

    /// The parsed payout bundle, when one is stored.
    pub fn payout_payload(&self) -> Option<PayoutPayload> {
        self.payout_txn.as_ref().and_then(PayoutPayload::from_value)
    }

    pub fn is_participant(&self, did: &str) -> bool {
        did == self.sender_did || did == self.receiver_did || did == self.arbiter_did
    }

    /// Create a new deal in the database
    pub fn create(conn: &mut PgConnection, new_deal: NewDeal) -> Result<Deal> {
        diesel::insert_into(deals::table)
            .values(&new_deal)
            .get_result(conn)
            .context("Failed to insert deal")
    }

    /// Find deal by its base58 uid
    pub fn find_by_uid(conn: &mut PgConnection, uid: &str) -> Result<Option<Deal>> {
        deals::table
            .filter(deals::uid.eq(uid))
            .first(conn)
            .optional()
            .with_context(|| format!("Failed to load deal {uid}"))
    }

    /// List deals where the DID is a participant, newest first
    pub fn list_for_participant(
        conn: &mut PgConnection,
        did: &str,
        order_by_updated: bool,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Deal>, i64)> {
        let filter = deals::sender_did
            .eq(did)
            .or(deals::receiver_did.eq(did))
            .or(deals::arbiter_did.eq(did));

        let total = deals::table
            .filter(filter)
            .count()
            .get_result(conn)
            .context("Failed to count deals")?;

        let query = deals::table.filter(filter).offset(offset).limit(limit);
        let page = if order_by_updated {
            query.order(deals::updated_at.desc()).load(conn)
        } else {
            query.order(deals::created_at.desc()).load(conn)
        }
        .context("Failed to load deals")?;

        Ok((page, total))
    }

    /// Update the deal status
    pub fn set_status(conn: &mut PgConnection, uid: &str, status: DealStatus) -> Result<()> {
        diesel::update(deals::table.filter(deals::uid.eq(uid)))
            .set((
                deals::status.eq(status.as_str()),
                deals::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update status for deal {uid}"))?;
        Ok(())
    }

    /// Replace (or clear) the stored payout bundle
    pub fn set_payout_txn(
        conn: &mut PgConnection,
        uid: &str,
        payout: Option<&Value>,
    ) -> Result<()> {
        diesel::update(deals::table.filter(deals::uid.eq(uid)))
            .set((
                deals::payout_txn.eq(payout),
                deals::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update payout_txn for deal {uid}"))?;
        Ok(())
    }

    /// Record the confirmed payout transaction id (terminal states only)
    pub fn set_payout_txn_hash(conn: &mut PgConnection, uid: &str, tx_hash: &str) -> Result<()> {
        diesel::update(deals::table.filter(deals::uid.eq(uid)))
            .set((
                deals::payout_txn_hash.eq(tx_hash),
                deals::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update payout_txn_hash for deal {uid}"))?;
        Ok(())
    }

    /// Record the sender's deposit transaction id
    pub fn set_deposit_txn_hash(conn: &mut PgConnection, uid: &str, tx_hash: &str) -> Result<()> {
        diesel::update(deals::table.filter(deals::uid.eq(uid)))
            .set((
                deals::deposit_txn_hash.eq(tx_hash),
                deals::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update deposit_txn_hash for deal {uid}"))?;
        Ok(())
    }

    /// Flip the receiver-approval flag after the sender accepts terms
    pub fn set_need_receiver_approve(
        conn: &mut PgConnection,
        uid: &str,
        value: bool,
    ) -> Result<()> {
        diesel::update(deals::table.filter(deals::uid.eq(uid)))
            .set((
                deals::need_receiver_approve.eq(value),
                deals::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update approval flag for deal {uid}"))?;
        Ok(())
    }

    /// Replace the payment requisites
    pub fn set_requisites(conn: &mut PgConnection, uid: &str, requisites: &Value) -> Result<()> {
        diesel::update(deals::table.filter(deals::uid.eq(uid)))
            .set((
                deals::requisites.eq(Some(requisites)),
                deals::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update requisites for deal {uid}"))?;
        Ok(())
    }

    /// Replace the attachment reference list
    pub fn set_attachments(conn: &mut PgConnection, uid: &str, attachments: &Value) -> Result<()> {
        diesel::update(deals::table.filter(deals::uid.eq(uid)))
            .set((
                deals::attachments.eq(Some(attachments)),
                deals::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update attachments for deal {uid}"))?;
        Ok(())
    }

    pub fn delete(conn: &mut PgConnection, uid: &str) -> Result<bool> {
        let deleted = diesel::delete(deals::table.filter(deals::uid.eq(uid)))
            .execute(conn)
            .with_context(|| format!("Failed to delete deal {uid}"))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            "wait_deposit",
            "processing",
            "wait_arbiter",
            "appeal",
            "recline_appeal",
            "resolving_sender",
            "resolving_receiver",
            "success",
            "resolved_sender",
            "resolved_receiver",
        ] {
            let status: DealStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("shipped".parse::<DealStatus>().is_err());
    }

    #[test]
    fn status_classes() {
        assert!(DealStatus::Success.is_final());
        assert!(DealStatus::ResolvedSender.is_final());
        assert!(!DealStatus::Processing.is_final());
        assert!(DealStatus::WaitArbiter.is_appeal());
        assert!(DealStatus::ResolvingReceiver.is_appeal());
        assert!(!DealStatus::WaitDeposit.is_appeal());
    }

    #[test]
    fn payout_payload_tx_id() {
        let payload = PayoutPayload {
            blockchain: "tron".into(),
            network: "mainnet".into(),
            escrow_id: 1,
            to_address: "T1".into(),
            amount: 10.0,
            token_contract: None,
            unsigned_tx: serde_json::json!({"txID": "  abcd  "}),
            contract_data: Value::Null,
            required_signatures: 2,
            participants: vec![],
            arbiter: String::new(),
            owner_addresses: None,
            contract_type: "TransferContract".into(),
            signatures: vec![],
        };
        assert_eq!(payload.tx_id().as_deref(), Some("abcd"));

        let mut no_id = payload.clone();
        no_id.unsigned_tx = serde_json::json!({"txID": ""});
        assert_eq!(no_id.tx_id(), None);
    }
}
