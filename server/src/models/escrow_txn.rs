//! Per-escrow provisioning journal
//!
//! One row per escrow. Each provisioning side effect overwrites the row;
//! a repeat of the same error bumps `counter` instead of appending, so
//! retry loops do not grow the journal.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::schema::escrow_txns;

/// Journal record kinds
pub const TXN_TYPE_EVENT: &str = "event";
pub const TXN_TYPE_TXN: &str = "txn";

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = escrow_txns)]
pub struct EscrowTxn {
    pub id: i32,
    pub escrow_id: i32,
    pub type_: String,
    pub comment: String,
    pub txn: Option<Value>,
    pub counter: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = escrow_txns)]
struct NewEscrowTxn<'a> {
    escrow_id: i32,
    type_: &'a str,
    comment: &'a str,
    txn: Option<&'a Value>,
}

impl EscrowTxn {
    /// Fetch the journal row for an escrow, creating it on first use.
    pub fn get_or_create(conn: &mut PgConnection, escrow_id: i32) -> Result<EscrowTxn> {
        let existing: Option<EscrowTxn> = escrow_txns::table
            .filter(escrow_txns::escrow_id.eq(escrow_id))
            .first(conn)
            .optional()
            .with_context(|| format!("Failed to load escrow_txn for escrow {escrow_id}"))?;

        if let Some(row) = existing {
            return Ok(row);
        }

        diesel::insert_into(escrow_txns::table)
            .values(&NewEscrowTxn {
                escrow_id,
                type_: TXN_TYPE_EVENT,
                comment: "",
                txn: None,
            })
            .get_result(conn)
            .with_context(|| format!("Failed to create escrow_txn for escrow {escrow_id}"))
    }

    /// Overwrite the journal row with a new event or transaction record.
    ///
    /// `is_duplicate` bumps the repeat counter for a coalesced error.
    pub fn record(
        &mut self,
        conn: &mut PgConnection,
        txn_type: &str,
        comment: &str,
        txn_data: Option<Value>,
        error_code: Option<&str>,
        error_message: Option<&str>,
        is_duplicate: bool,
    ) -> Result<()> {
        let mut txn_json = match txn_data {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => json!({ "data": other }),
            None => json!({}),
        };
        if let Some(code) = error_code {
            txn_json["error_code"] = json!(code);
        }
        if let Some(message) = error_message {
            txn_json["error_message"] = json!(message);
        }
        let txn_value = if txn_json.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            None
        } else {
            Some(txn_json)
        };

        let counter = if is_duplicate { self.counter.max(1) + 1 } else { self.counter };

        let updated: EscrowTxn = diesel::update(escrow_txns::table.find(self.id))
            .set((
                escrow_txns::type_.eq(txn_type),
                escrow_txns::comment.eq(comment),
                escrow_txns::txn.eq(txn_value),
                escrow_txns::counter.eq(counter),
                escrow_txns::updated_at.eq(diesel::dsl::now),
            ))
            .get_result(conn)
            .with_context(|| format!("Failed to update escrow_txn {}", self.id))?;

        *self = updated;
        Ok(())
    }

    /// True when the given error repeats the last recorded one.
    pub fn is_same_error(&self, error_code: &str, error_message: &str) -> bool {
        let Some(txn) = &self.txn else {
            return false;
        };
        txn.get("error_code").and_then(Value::as_str) == Some(error_code)
            && txn.get("error_message").and_then(Value::as_str) == Some(error_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(txn: Option<Value>) -> EscrowTxn {
        EscrowTxn {
            id: 1,
            escrow_id: 1,
            type_: TXN_TYPE_EVENT.into(),
            comment: String::new(),
            txn,
            counter: 1,
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn detects_repeated_errors() {
        let journal = row(Some(json!({
            "error_code": "TRX_TRANSFER_FAILED",
            "error_message": "insufficient funds",
        })));
        assert!(journal.is_same_error("TRX_TRANSFER_FAILED", "insufficient funds"));
        assert!(!journal.is_same_error("TRX_TRANSFER_FAILED", "other message"));
        assert!(!journal.is_same_error("PERMISSION_UPDATE_FAILED", "insufficient funds"));
    }

    #[test]
    fn fresh_journal_never_matches() {
        let journal = row(None);
        assert!(!journal.is_same_error("PROCESSING_ERROR", "boom"));
    }
}
