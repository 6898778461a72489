//! Append-only storage records backing the chat ledger
//!
//! One record per participant DID per message; the payload is the full
//! serialized chat message. Records are never mutated after insert, and
//! the monotonically increasing primary key orders pagination.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Text};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::storage;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = storage)]
pub struct StorageRecord {
    pub id: i64,
    pub space: String,
    pub owner_did: String,
    pub conversation_id: Option<String>,
    pub deal_uid: Option<String>,
    pub payload: Value,
    pub schema_ver: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = storage)]
pub struct NewStorageRecord {
    pub space: String,
    pub owner_did: String,
    pub conversation_id: Option<String>,
    pub deal_uid: Option<String>,
    pub payload: Value,
    pub schema_ver: String,
}

impl StorageRecord {
    pub fn insert(conn: &mut PgConnection, record: NewStorageRecord) -> Result<StorageRecord> {
        diesel::insert_into(storage::table)
            .values(&record)
            .get_result(conn)
            .context("Failed to insert storage record")
    }

    /// Find the owner's record for a message uuid, optionally scoped to a
    /// conversation (a `None` scope means the null-conversation bucket).
    pub fn find_by_message_uuid(
        conn: &mut PgConnection,
        space: &str,
        owner_did: &str,
        message_uuid: &str,
        conversation_scope: Option<Option<&str>>,
    ) -> Result<Option<StorageRecord>> {
        let mut query = storage::table
            .filter(storage::space.eq(space))
            .filter(storage::owner_did.eq(owner_did))
            .filter(
                sql::<Bool>("payload->>'uuid' = ")
                    .bind::<Text, _>(message_uuid.to_string()),
            )
            .into_boxed();

        if let Some(scope) = conversation_scope {
            query = match scope {
                Some(conversation_id) => {
                    query.filter(storage::conversation_id.eq(conversation_id.to_string()))
                }
                None => query.filter(storage::conversation_id.is_null()),
            };
        }

        query
            .order(storage::id.desc())
            .first(conn)
            .optional()
            .with_context(|| format!("Failed to look up message {message_uuid}"))
    }

    /// True when a service message with this txn hash already exists for
    /// the deal; used to deduplicate state-machine side effects.
    pub fn service_message_exists(
        conn: &mut PgConnection,
        space: &str,
        deal_uid: &str,
        txn_hash: &str,
    ) -> Result<bool> {
        let found: Option<i64> = storage::table
            .select(storage::id)
            .filter(storage::space.eq(space))
            .filter(storage::deal_uid.eq(deal_uid))
            .filter(sql::<Bool>("payload->>'message_type' = 'service'"))
            .filter(sql::<Bool>("payload->>'txn_hash' = ").bind::<Text, _>(txn_hash.to_string()))
            .first(conn)
            .optional()
            .context("Failed to check for existing service message")?;
        Ok(found.is_some())
    }
}
