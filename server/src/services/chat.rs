//! Chat ledger service
//!
//! Fans each message out into one storage record per participant DID so
//! every participant's read path is a plain owner-scoped scan. All records
//! of one message share a single transaction.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use tracing::warn;

use escrow_marketplace_common::{deal_did, utils, CHAT_SPACE};

use crate::db::{with_conn, DbPool};
use crate::error::{ServiceError, ServiceResult};
use crate::models::deal::Deal;
use crate::models::message::{AttachmentType, ChatMessage, NewChatMessage};
use crate::models::storage::{NewStorageRecord, StorageRecord};
use crate::schema::storage;

/// A page of chat history
#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
    pub exclude_file_data: bool,
}

/// One conversation summary from `get_last_sessions`
#[derive(Debug, Serialize)]
pub struct ChatSession {
    pub conversation_id: Option<String>,
    pub last_message_time: NaiveDateTime,
    pub message_count: i64,
    pub last_message: ChatMessage,
}

/// Chat ledger scoped to one owner DID
pub struct ChatService {
    pool: DbPool,
    owner_did: String,
    download_base: String,
}

impl ChatService {
    pub fn new(pool: DbPool, owner_did: impl Into<String>, download_base: impl Into<String>) -> Self {
        Self {
            pool,
            owner_did: owner_did.into(),
            download_base: download_base.into(),
        }
    }

    /// Add a message, fanning it out to every recipient atomically.
    ///
    /// Returns the message shaped for the calling owner.
    pub async fn add_message(
        &self,
        message: NewChatMessage,
        deal_uid: Option<String>,
    ) -> ServiceResult<ChatMessage> {
        let owner_did = self.owner_did.clone();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| add_message_on(conn, &owner_did, message, deal_uid.as_deref()))
        })
        .await
    }

    /// Read a page of the owner's history, newest first.
    pub async fn get_history(
        &self,
        conversation_id: Option<String>,
        page: i64,
        page_size: i64,
        exclude_file_data: bool,
        after_message_uid: Option<String>,
        before_message_uid: Option<String>,
    ) -> ServiceResult<HistoryPage> {
        let owner_did = self.owner_did.clone();
        let download_base = self.download_base.clone();
        with_conn(&self.pool, move |conn| {
            let page = page.max(1);
            let page_size = page_size.max(1);
            let scope = conversation_id.as_deref();

            let after_id = match &after_message_uid {
                Some(uuid) => Some(resolve_reference(conn, &owner_did, uuid, Some(scope))?),
                None => None,
            };
            let before_id = match &before_message_uid {
                Some(uuid) => Some(resolve_reference(conn, &owner_did, uuid, Some(scope))?),
                None => None,
            };

            let filtered = |mut query: storage::BoxedQuery<'static, diesel::pg::Pg>| {
                query = query
                    .filter(storage::space.eq(CHAT_SPACE))
                    .filter(storage::owner_did.eq(owner_did.clone()));
                query = match &conversation_id {
                    Some(id) => query.filter(storage::conversation_id.eq(id.clone())),
                    None => query.filter(storage::conversation_id.is_null()),
                };
                if let Some(id) = after_id {
                    query = query.filter(storage::id.gt(id));
                }
                if let Some(id) = before_id {
                    query = query.filter(storage::id.lt(id));
                }
                query
            };

            let total: i64 = filtered(storage::table.into_boxed())
                .count()
                .get_result(conn)
                .map_err(ServiceError::Database)?;

            let mut query = filtered(storage::table.into_boxed()).order(storage::id.desc());
            if before_id.is_none() {
                query = query.offset((page - 1) * page_size);
            }
            let records: Vec<StorageRecord> =
                query.limit(page_size).load(conn).map_err(ServiceError::Database)?;

            let mut messages = Vec::with_capacity(records.len());
            for record in records {
                match serde_json::from_value::<ChatMessage>(record.payload.clone()) {
                    Ok(mut message) => {
                        if exclude_file_data {
                            strip_file_data(&mut message, &download_base);
                        }
                        messages.push(message);
                    }
                    Err(e) => {
                        warn!(record_id = record.id, "skipping unparseable chat payload: {e}");
                    }
                }
            }

            Ok(HistoryPage {
                messages,
                total,
                page,
                page_size,
                total_pages: if total > 0 { (total + page_size - 1) / page_size } else { 0 },
                exclude_file_data,
            })
        })
        .await
    }

    /// Fetch one attachment with its data, owner-scoped.
    pub async fn get_attachment(
        &self,
        message_uuid: String,
        attachment_id: String,
    ) -> ServiceResult<Option<crate::models::message::FileAttachment>> {
        let owner_did = self.owner_did.clone();
        with_conn(&self.pool, move |conn| {
            let record = StorageRecord::find_by_message_uuid(
                conn,
                CHAT_SPACE,
                &owner_did,
                &message_uuid,
                None,
            )?;
            let Some(record) = record else {
                return Ok(None);
            };
            let message: ChatMessage = match serde_json::from_value(record.payload) {
                Ok(message) => message,
                Err(_) => return Ok(None),
            };
            Ok(message
                .attachments
                .into_iter()
                .flatten()
                .find(|a| a.id == attachment_id))
        })
        .await
    }

    /// List the owner's conversations, most recently active first.
    pub async fn get_last_sessions(
        &self,
        limit: i64,
        after_message_uid: Option<String>,
    ) -> ServiceResult<Vec<ChatSession>> {
        let owner_did = self.owner_did.clone();
        with_conn(&self.pool, move |conn| {
            let after_id = match &after_message_uid {
                Some(uuid) => Some(resolve_reference(conn, &owner_did, uuid, None)?),
                None => None,
            };

            // Newest record id per conversation
            let mut groups_query = storage::table
                .group_by(storage::conversation_id)
                .select((storage::conversation_id, diesel::dsl::max(storage::id)))
                .filter(storage::space.eq(CHAT_SPACE))
                .filter(storage::owner_did.eq(owner_did.clone()))
                .into_boxed();
            if let Some(id) = after_id {
                groups_query = groups_query.filter(storage::id.gt(id));
            }
            let groups: Vec<(Option<String>, Option<i64>)> =
                groups_query.load(conn).map_err(ServiceError::Database)?;

            let last_ids: Vec<i64> = groups.into_iter().filter_map(|(_, id)| id).collect();
            let records: Vec<StorageRecord> = storage::table
                .filter(storage::id.eq_any(last_ids))
                .order(storage::created_at.desc())
                .limit(limit)
                .load(conn)
                .map_err(ServiceError::Database)?;

            let mut sessions = Vec::with_capacity(records.len());
            for record in records {
                let message: ChatMessage = match serde_json::from_value(record.payload.clone()) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(record_id = record.id, "skipping unparseable session payload: {e}");
                        continue;
                    }
                };

                let mut count_query = storage::table
                    .filter(storage::space.eq(CHAT_SPACE))
                    .filter(storage::owner_did.eq(owner_did.clone()))
                    .into_boxed();
                count_query = match &record.conversation_id {
                    Some(id) => count_query.filter(storage::conversation_id.eq(id.clone())),
                    None => count_query.filter(storage::conversation_id.is_null()),
                };
                if let Some(id) = after_id {
                    count_query = count_query.filter(storage::id.gt(id));
                }
                let message_count: i64 =
                    count_query.count().get_result(conn).map_err(ServiceError::Database)?;

                sessions.push(ChatSession {
                    conversation_id: record.conversation_id,
                    last_message_time: record.created_at,
                    message_count,
                    last_message: message,
                });
            }
            Ok(sessions)
        })
        .await
    }
}

/// Synchronous fan-out core, callable from inside an enclosing transaction
/// (state-machine side effects commit together with the status change).
pub(crate) fn add_message_on(
    conn: &mut PgConnection,
    caller_did: &str,
    mut message: NewChatMessage,
    deal_uid: Option<&str>,
) -> ServiceResult<ChatMessage> {
    message.validate()?;
    fill_image_dimensions(&mut message);

    let deal = match deal_uid {
        Some(uid) => Deal::find_by_uid(conn, uid)?,
        None => None,
    };
    let recipients = recipients_for(&message, deal.as_ref());

    let stored = message.into_message(Utc::now());
    let mut caller_message: Option<ChatMessage> = None;

    for owner in &recipients {
        let conversation_id = conversation_id_for(owner, &stored, deal_uid);
        let mut owned = stored.clone();
        owned.conversation_id = Some(conversation_id.clone());

        StorageRecord::insert(
            conn,
            NewStorageRecord {
                space: CHAT_SPACE.to_string(),
                owner_did: owner.clone(),
                conversation_id: Some(conversation_id),
                deal_uid: deal_uid.map(str::to_string),
                payload: serde_json::to_value(&owned)
                    .map_err(|e| ServiceError::Validation(e.to_string()))?,
                schema_ver: "1".to_string(),
            },
        )?;

        if owner == caller_did {
            caller_message = Some(owned);
        }
    }

    caller_message.ok_or_else(|| {
        ServiceError::Validation(format!("Message was not created for owner_did: {caller_did}"))
    })
}

/// The deduplicated set of owner DIDs a message fans out to.
pub(crate) fn recipients_for(message: &NewChatMessage, deal: Option<&Deal>) -> Vec<String> {
    let candidates: Vec<&str> = match deal {
        Some(deal) => vec![&deal.sender_did, &deal.receiver_did, &deal.arbiter_did],
        None => vec![&message.sender_id, &message.receiver_id],
    };
    let mut recipients: Vec<String> = Vec::with_capacity(candidates.len());
    for did in candidates {
        if !recipients.iter().any(|existing| existing == did) {
            recipients.push(did.to_string());
        }
    }
    recipients
}

/// Conversation id for one owner's copy: the deal thread when the message
/// belongs to a deal, the counterparty DID otherwise.
pub(crate) fn conversation_id_for(
    owner_did: &str,
    message: &ChatMessage,
    deal_uid: Option<&str>,
) -> String {
    match deal_uid {
        Some(uid) => deal_did(uid),
        None => {
            if owner_did == message.sender_id {
                message.receiver_id.clone()
            } else {
                message.sender_id.clone()
            }
        }
    }
}

/// Replace attachment payloads with download links.
pub(crate) fn strip_file_data(message: &mut ChatMessage, base_url: &str) {
    if let Some(attachments) = &mut message.attachments {
        for attachment in attachments {
            attachment.data = None;
            attachment.download_url =
                Some(format!("{}/{}/{}", base_url, message.uuid, attachment.id));
        }
    }
}

/// Compute intrinsic dimensions for image attachments that lack them.
///
/// Only photo attachments whose decoded content actually sniffs as an
/// image are touched; everything else passes through unchanged.
fn fill_image_dimensions(message: &mut NewChatMessage) {
    let Some(attachments) = &mut message.attachments else {
        return;
    };
    for attachment in attachments {
        if attachment.kind != AttachmentType::Photo {
            continue;
        }
        if attachment.width.is_some() && attachment.height.is_some() {
            continue;
        }
        let Some(data) = &attachment.data else {
            continue;
        };
        let Ok(bytes) = utils::decode_base64(data) else {
            continue;
        };
        if !infer::is_image(&bytes) {
            continue;
        }
        if let Some((width, height)) = utils::image_dimensions_from_bytes(&bytes) {
            attachment.width = Some(width);
            attachment.height = Some(height);
        }
    }
}

/// Look up the storage id of a reference message by uuid, failing with
/// not-found when it does not exist for this owner.
fn resolve_reference(
    conn: &mut PgConnection,
    owner_did: &str,
    message_uuid: &str,
    conversation_scope: Option<Option<&str>>,
) -> ServiceResult<i64> {
    StorageRecord::find_by_message_uuid(conn, CHAT_SPACE, owner_did, message_uuid, conversation_scope)?
        .map(|record| record.id)
        .ok_or_else(|| ServiceError::NotFound(format!("Message with uuid {message_uuid} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::{MessageStatus, MessageType};
    use bigdecimal::BigDecimal;
    use chrono::Utc;

    fn new_message(sender: &str, receiver: &str) -> NewChatMessage {
        NewChatMessage {
            uuid: "m-1".into(),
            message_type: MessageType::Text,
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            deal_uid: None,
            deal_label: None,
            text: Some("hello".into()),
            attachments: None,
            reply_to_message_uuid: None,
            metadata: None,
            signature: None,
            txn_hash: None,
        }
    }

    fn deal(sender: &str, receiver: &str, arbiter: &str) -> Deal {
        Deal {
            id: 1,
            uid: "3mJr7AoUXx2Wqd".into(),
            sender_did: sender.into(),
            receiver_did: receiver.into(),
            arbiter_did: arbiter.into(),
            label: "Invoice".into(),
            description: None,
            amount: Some(BigDecimal::from(100)),
            need_receiver_approve: false,
            status: "processing".into(),
            escrow_id: Some(1),
            requisites: None,
            attachments: None,
            payout_txn: None,
            deposit_txn_hash: None,
            payout_txn_hash: None,
            created_at: Utc::now().naive_utc(),
            updated_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn direct_message_fans_out_to_both_parties() {
        let message = new_message("did:tron:ta", "did:tron:tb");
        let recipients = recipients_for(&message, None);
        assert_eq!(recipients, vec!["did:tron:ta", "did:tron:tb"]);
    }

    #[test]
    fn deal_message_fans_out_to_three_participants() {
        let message = new_message("did:tron:ta", "did:tron:tb");
        let deal = deal("did:tron:ta", "did:tron:tb", "did:tron:tc");
        let recipients = recipients_for(&message, Some(&deal));
        assert_eq!(
            recipients,
            vec!["did:tron:ta", "did:tron:tb", "did:tron:tc"]
        );
    }

    #[test]
    fn duplicate_recipients_collapse() {
        let message = new_message("did:tron:ta", "did:tron:ta");
        assert_eq!(recipients_for(&message, None).len(), 1);

        let deal = deal("did:tron:ta", "did:tron:tb", "did:tron:ta");
        assert_eq!(recipients_for(&message, Some(&deal)).len(), 2);
    }

    #[test]
    fn conversation_ids_per_owner() {
        let stored = new_message("did:tron:ta", "did:tron:tb").into_message(Utc::now());
        // Deal thread: both owners share the deal conversation
        assert_eq!(
            conversation_id_for("did:tron:ta", &stored, Some("3mJr7AoUXx2Wqd")),
            "did:deal:3mJr7AoUXx2Wqd"
        );
        // Direct thread: each owner's conversation is the counterparty
        assert_eq!(
            conversation_id_for("did:tron:ta", &stored, None),
            "did:tron:tb"
        );
        assert_eq!(
            conversation_id_for("did:tron:tb", &stored, None),
            "did:tron:ta"
        );
        // The arbiter's copy of a non-deal message groups under the sender
        assert_eq!(
            conversation_id_for("did:tron:tc", &stored, None),
            "did:tron:ta"
        );
    }

    #[test]
    fn strip_replaces_data_with_download_url() {
        use crate::models::message::{AttachmentType, FileAttachment};
        let mut message = new_message("did:tron:ta", "did:tron:tb").into_message(Utc::now());
        message.attachments = Some(vec![FileAttachment {
            id: "a-9".into(),
            kind: AttachmentType::Document,
            name: "contract.pdf".into(),
            size: 4,
            mime_type: "application/pdf".into(),
            data: Some("AAAA".into()),
            thumbnail: None,
            width: None,
            height: None,
            download_url: None,
        }]);
        strip_file_data(&mut message, "/chat/api/attachment");
        let attachment = &message.attachments.as_ref().unwrap()[0];
        assert!(attachment.data.is_none());
        assert_eq!(
            attachment.download_url.as_deref(),
            Some("/chat/api/attachment/m-1/a-9")
        );
        assert_eq!(message.status, MessageStatus::Sent);
    }
}
