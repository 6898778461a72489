//! Deals service: state machine, payout builder, signature aggregator
//!
//! The authoritative status transitions with role-based authorization, the
//! deterministic (re)construction of the unsigned multisig payout for the
//! current status, and the collection and assembly of off-chain signatures
//! into a broadcast-ready payload. Every transition commits its status
//! update, payout clearing and audit chat message in one transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::{BigDecimal, ToPrimitive};
use diesel::prelude::*;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use escrow_marketplace_common::{utils, validate_did, CHAT_SPACE};

use crate::chain::multisig::normalize_signature;
use crate::chain::ChainClient;
use crate::config::Settings;
use crate::db::{with_conn, DbPool};
use crate::error::{ServiceError, ServiceResult};
use crate::models::deal::{Deal, DealStatus, NewDeal, PayoutPayload, PayoutSignature};
use crate::models::escrow::Escrow;
use crate::models::message::{FileAttachment, MessageType, NewChatMessage};
use crate::models::storage::StorageRecord;
use crate::models::wallet_user::WalletUser;
use crate::services::chat;
use crate::services::escrow::EscrowService;

const DEPOSIT_CHECK_TTL: Duration = Duration::from_secs(10);
const PAYOUT_CHECK_INTERVAL: Duration = Duration::from_millis(2_500);
const PAYOUT_CHECK_ATTEMPTS: u32 = 5; // ~10 s of polling

// Deposit confirmation cache: deal uid -> (checked at, confirmed)
static DEPOSIT_CHECKS: Lazy<std::sync::Mutex<HashMap<String, (Instant, bool)>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

/// A participant's role within one deal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
    Arbiter,
}

/// Audit chat message emitted alongside a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceNote {
    AppealFiled,
    ArbiterRecalled,
    ReclineAppeal,
    ReturnedToWork,
}

/// Planned effect of a requested status change
#[derive(Debug, PartialEq)]
pub(crate) struct TransitionPlan {
    pub next: DealStatus,
    pub clear_payout: bool,
    pub note: Option<ServiceNote>,
}

/// Decide whether `requested` is allowed for this actor from this status.
///
/// Encodes the authorization matrix: appeals from `processing` belong to
/// the parties, everything inside an appeal or after a terminal status
/// belongs to the arbiter, and any other transition is rejected.
pub(crate) fn plan_transition(
    role: Role,
    current: DealStatus,
    requested: &str,
) -> ServiceResult<TransitionPlan> {
    if (current.is_appeal() || current.is_final()) && role != Role::Arbiter {
        return Err(ServiceError::Transition(
            "Only the arbiter can change status during an appeal or from a final status".into(),
        ));
    }

    match requested {
        "appeal" => match role {
            Role::Sender | Role::Receiver => {
                if current != DealStatus::Processing {
                    return Err(ServiceError::Transition(
                        "An appeal can only be filed while the deal is in processing".into(),
                    ));
                }
                Ok(TransitionPlan {
                    next: DealStatus::WaitArbiter,
                    clear_payout: true,
                    note: Some(ServiceNote::AppealFiled),
                })
            }
            Role::Arbiter => {
                if !current.is_final() {
                    return Err(ServiceError::Transition(
                        "The arbiter can reopen an appeal only from a final status".into(),
                    ));
                }
                Ok(TransitionPlan {
                    next: DealStatus::WaitArbiter,
                    clear_payout: true,
                    note: Some(ServiceNote::ArbiterRecalled),
                })
            }
        },
        "resolving_sender" | "resolving_receiver" => {
            if !matches!(
                current,
                DealStatus::WaitArbiter | DealStatus::Appeal | DealStatus::ReclineAppeal
            ) {
                return Err(ServiceError::Transition(
                    "Resolving is only reachable from wait_arbiter, appeal or recline_appeal"
                        .into(),
                ));
            }
            let next = if requested == "resolving_sender" {
                DealStatus::ResolvingSender
            } else {
                DealStatus::ResolvingReceiver
            };
            Ok(TransitionPlan {
                next,
                clear_payout: false,
                note: None,
            })
        }
        "recline_appeal" => {
            if !matches!(
                current,
                DealStatus::ResolvingSender | DealStatus::ResolvingReceiver
            ) {
                return Err(ServiceError::Transition(
                    "Recline is only reachable from resolving_sender or resolving_receiver".into(),
                ));
            }
            Ok(TransitionPlan {
                next: DealStatus::ReclineAppeal,
                clear_payout: true,
                note: Some(ServiceNote::ReclineAppeal),
            })
        }
        "processing" => {
            if role != Role::Arbiter {
                return Err(ServiceError::Transition(
                    "Only the arbiter can return a deal to work".into(),
                ));
            }
            if !current.is_appeal() && !current.is_final() {
                return Err(ServiceError::Transition(
                    "Return to work is only reachable from an appeal or final status".into(),
                ));
            }
            Ok(TransitionPlan {
                next: DealStatus::Processing,
                clear_payout: true,
                note: Some(ServiceNote::ReturnedToWork),
            })
        }
        other => Err(ServiceError::Transition(format!(
            "Transition to '{other}' is not allowed"
        ))),
    }
}

/// Where the payout for a status goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayoutTarget {
    /// Waiting for the deposit observation
    AwaitDeposit,
    /// No payout is applicable; the stored payload is cleared
    Clear,
    Recipient(Role),
}

/// Maps a deal status to the rightful payout recipient.
pub(crate) fn payout_target(status: DealStatus) -> PayoutTarget {
    match status {
        DealStatus::WaitDeposit => PayoutTarget::AwaitDeposit,
        DealStatus::Processing | DealStatus::Success => PayoutTarget::Recipient(Role::Receiver),
        DealStatus::ResolvingSender | DealStatus::ResolvedSender => {
            PayoutTarget::Recipient(Role::Sender)
        }
        DealStatus::ResolvingReceiver | DealStatus::ResolvedReceiver => {
            PayoutTarget::Recipient(Role::Receiver)
        }
        DealStatus::Appeal | DealStatus::WaitArbiter | DealStatus::ReclineAppeal => {
            PayoutTarget::Clear
        }
    }
}

/// An existing payload is reused verbatim iff it targets the same
/// recipient, amount and token; this preserves collected signatures.
pub(crate) fn payload_matches(
    payload: &PayoutPayload,
    to_address: &str,
    amount: f64,
    token_contract: Option<&str>,
) -> bool {
    payload.to_address == to_address
        && payload.amount == amount
        && payload.token_contract.as_deref() == token_contract
}

/// Signatures needed before assembly can succeed.
pub(crate) fn effective_required(payload: &PayoutPayload) -> usize {
    if payload.required_signatures > 0 {
        payload.required_signatures as usize
    } else {
        payload.participants.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignatureOutcome {
    Added,
    Duplicate,
}

/// Apply one signature to the payload.
///
/// The signer must be a multisig owner; a duplicate signer is a no-op; an
/// `unsigned_tx` replacement (expiry extension) is only allowed while no
/// signatures have been collected.
pub(crate) fn apply_signature(
    payload: &mut PayoutPayload,
    signer_address: &str,
    signature: &str,
    signature_index: Option<u32>,
    unsigned_tx: Option<Value>,
) -> ServiceResult<SignatureOutcome> {
    let allowed: Vec<&str> = match &payload.owner_addresses {
        Some(owners) => owners.iter().map(String::as_str).collect(),
        None => {
            let mut list: Vec<&str> = payload.participants.iter().map(String::as_str).collect();
            if !payload.arbiter.is_empty() {
                list.push(payload.arbiter.as_str());
            }
            list
        }
    };
    if !allowed.contains(&signer_address) {
        return Err(ServiceError::Validation(format!(
            "Signer {signer_address} is not among the multisig owners"
        )));
    }

    if payload
        .signatures
        .iter()
        .any(|s| s.signer_address == signer_address)
    {
        return Ok(SignatureOutcome::Duplicate);
    }

    if let Some(replacement) = unsigned_tx {
        if !payload.signatures.is_empty() {
            return Err(ServiceError::Validation(
                "Cannot replace the transaction: signatures already exist. Sign the current transaction.".into(),
            ));
        }
        if let Some(raw_data) = replacement.get("raw_data") {
            payload.contract_data = raw_data.clone();
        }
        payload.unsigned_tx = replacement;
    }

    payload.signatures.push(PayoutSignature {
        signer_address: signer_address.to_string(),
        signature: signature.to_string(),
        signature_index,
    });
    Ok(SignatureOutcome::Added)
}

/// Assemble the broadcast payload once enough signatures are collected.
///
/// With `owner_addresses`, any `required` of the owners suffice, ordered
/// by owner index; without them every participant must sign, ordered by
/// participant index. Returns `None` while the threshold is unmet.
pub fn assemble_signed_tx(payload: &PayoutPayload) -> Option<Value> {
    if !payload.unsigned_tx.is_object() {
        return None;
    }

    let by_address: HashMap<String, String> = payload
        .signatures
        .iter()
        .map(|s| {
            (
                s.signer_address.trim().to_lowercase(),
                normalize_signature(&s.signature),
            )
        })
        .collect();

    let required = effective_required(payload);

    let owners: Option<Vec<String>> = match &payload.owner_addresses {
        Some(owners) => Some(owners.clone()),
        None if !payload.arbiter.is_empty() => {
            let mut list = payload.participants.clone();
            list.push(payload.arbiter.clone());
            Some(list)
        }
        None => None,
    };

    let ordered: Vec<String> = match owners {
        Some(owners) => {
            let mut indexed: Vec<(usize, String)> = owners
                .iter()
                .enumerate()
                .filter_map(|(index, address)| {
                    by_address
                        .get(&address.trim().to_lowercase())
                        .map(|sig| (index, sig.clone()))
                })
                .collect();
            if indexed.len() < required {
                return None;
            }
            indexed.sort_by_key(|(index, _)| *index);
            indexed.into_iter().map(|(_, sig)| sig).take(required).collect()
        }
        None => {
            // Degenerate config: every participant must sign, in order
            if payload.signatures.len() < required {
                return None;
            }
            let mut list = Vec::with_capacity(payload.participants.len());
            for address in &payload.participants {
                let sig = by_address.get(&address.trim().to_lowercase())?;
                list.push(sig.clone());
            }
            list
        }
    };

    let mut signed = payload.unsigned_tx.clone();
    signed["signature"] = json!(ordered);
    Some(signed)
}

/// Parameters for creating a deal
#[derive(Debug, Clone)]
pub struct CreateDeal {
    pub sender_did: String,
    pub receiver_did: String,
    pub arbiter_did: String,
    pub label: String,
    pub description: Option<String>,
    pub amount: Option<BigDecimal>,
    pub need_receiver_approve: bool,
    pub escrow_id: Option<i32>,
}

/// Optional fields of a deal update
#[derive(Debug, Clone, Default)]
pub struct UpdateDeal {
    pub label: Option<String>,
    pub sender_did: Option<String>,
    pub receiver_did: Option<String>,
    pub arbiter_did: Option<String>,
    pub escrow_id: Option<i32>,
}

/// One page of the owner's deals
#[derive(Debug)]
pub struct DealPage {
    pub deals: Vec<Deal>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// Deals service scoped to one owner DID.
///
/// Every read is participant-scoped; edits require deal ownership
/// (the sender); disputed transitions require the arbiter.
pub struct DealsService {
    pool: DbPool,
    chain: Arc<dyn ChainClient>,
    settings: Arc<Settings>,
    owner_did: String,
}

impl DealsService {
    pub fn new(
        pool: DbPool,
        chain: Arc<dyn ChainClient>,
        settings: Arc<Settings>,
        owner_did: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            chain,
            settings,
            owner_did: owner_did.into(),
        }
    }

    fn actor_role(&self, deal: &Deal) -> Option<Role> {
        if self.owner_did == deal.sender_did {
            Some(Role::Sender)
        } else if self.owner_did == deal.receiver_did {
            Some(Role::Receiver)
        } else if self.owner_did == deal.arbiter_did {
            Some(Role::Arbiter)
        } else {
            None
        }
    }

    fn check_deal_ownership(&self, deal: &Deal) -> ServiceResult<()> {
        if deal.sender_did != self.owner_did {
            return Err(ServiceError::DealAccessDenied {
                deal_uid: deal.uid.clone(),
                owner_did: deal.sender_did.clone(),
                attempted_by: self.owner_did.clone(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    /// Create a new deal; the caller must be one of its participants.
    pub async fn create_deal(&self, params: CreateDeal) -> ServiceResult<Deal> {
        for (field, did) in [
            ("sender_did", &params.sender_did),
            ("receiver_did", &params.receiver_did),
            ("arbiter_did", &params.arbiter_did),
        ] {
            validate_did(did).map_err(|e| ServiceError::Validation(format!("{field}: {e}")))?;
        }
        if params.sender_did == params.receiver_did
            || params.sender_did == params.arbiter_did
            || params.receiver_did == params.arbiter_did
        {
            return Err(ServiceError::Validation(
                "sender_did, receiver_did and arbiter_did must be pairwise distinct".into(),
            ));
        }
        if let Some(amount) = &params.amount {
            if amount < &BigDecimal::from(0) {
                return Err(ServiceError::Validation("amount must be >= 0".into()));
            }
        }
        if self.owner_did != params.sender_did
            && self.owner_did != params.receiver_did
            && self.owner_did != params.arbiter_did
        {
            return Err(ServiceError::Validation(format!(
                "owner_did ({}) must be a participant (sender, receiver or arbiter)",
                self.owner_did
            )));
        }

        let uid = utils::generate_base58_uid();
        let new_deal = NewDeal {
            uid: uid.clone(),
            sender_did: params.sender_did,
            receiver_did: params.receiver_did,
            arbiter_did: params.arbiter_did,
            label: params.label,
            description: params.description,
            amount: params.amount,
            need_receiver_approve: params.need_receiver_approve,
            status: DealStatus::WaitDeposit.as_str().to_string(),
            escrow_id: params.escrow_id,
            requisites: None,
        };
        let deal = with_conn(&self.pool, move |conn| {
            Deal::create(conn, new_deal).map_err(ServiceError::from)
        })
        .await?;
        info!(deal_uid = %deal.uid, "created deal");
        Ok(deal)
    }

    /// Fetch a deal the owner participates in.
    pub async fn get_deal(&self, deal_uid: &str) -> ServiceResult<Option<Deal>> {
        let uid = deal_uid.to_string();
        let owner = self.owner_did.clone();
        with_conn(&self.pool, move |conn| {
            let deal = Deal::find_by_uid(conn, &uid)?;
            Ok(deal.filter(|d| d.is_participant(&owner)))
        })
        .await
    }

    /// Fetch a deal without the participant check.
    pub async fn get_deal_public(&self, deal_uid: &str) -> ServiceResult<Option<Deal>> {
        let uid = deal_uid.to_string();
        with_conn(&self.pool, move |conn| {
            Deal::find_by_uid(conn, &uid).map_err(ServiceError::from)
        })
        .await
    }

    /// List the owner's deals, newest first.
    pub async fn list_deals(
        &self,
        page: i64,
        page_size: i64,
        order_by: &str,
    ) -> ServiceResult<DealPage> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let owner = self.owner_did.clone();
        let by_updated = order_by == "updated_at";
        let (deals, total) = with_conn(&self.pool, move |conn| {
            Deal::list_for_participant(conn, &owner, by_updated, (page - 1) * page_size, page_size)
                .map_err(ServiceError::from)
        })
        .await?;
        Ok(DealPage {
            deals,
            total,
            page,
            page_size,
        })
    }

    /// Update deal fields; only the deal owner (the sender) may edit.
    pub async fn update_deal(&self, deal_uid: &str, update: UpdateDeal) -> ServiceResult<Option<Deal>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        self.check_deal_ownership(&deal)?;

        if let Some(sender) = &update.sender_did {
            if sender != &self.owner_did {
                return Err(ServiceError::Validation(format!(
                    "sender_did ({sender}) must match owner_did ({})",
                    self.owner_did
                )));
            }
        }

        let uid = deal_uid.to_string();
        with_conn(&self.pool, move |conn| {
            use crate::schema::deals;
            conn.transaction(|conn| {
                if let Some(label) = &update.label {
                    diesel::update(deals::table.filter(deals::uid.eq(&uid)))
                        .set(deals::label.eq(label))
                        .execute(conn)?;
                }
                if let Some(receiver) = &update.receiver_did {
                    diesel::update(deals::table.filter(deals::uid.eq(&uid)))
                        .set(deals::receiver_did.eq(receiver))
                        .execute(conn)?;
                }
                if let Some(arbiter) = &update.arbiter_did {
                    diesel::update(deals::table.filter(deals::uid.eq(&uid)))
                        .set(deals::arbiter_did.eq(arbiter))
                        .execute(conn)?;
                }
                if let Some(escrow_id) = update.escrow_id {
                    diesel::update(deals::table.filter(deals::uid.eq(&uid)))
                        .set(deals::escrow_id.eq(escrow_id))
                        .execute(conn)?;
                }
                diesel::update(deals::table.filter(deals::uid.eq(&uid)))
                    .set(deals::updated_at.eq(diesel::dsl::now))
                    .execute(conn)?;
                Ok(Deal::find_by_uid(conn, &uid)?)
            })
        })
        .await
    }

    /// Delete a deal; owner only. Chat history is not cascaded.
    pub async fn delete_deal(&self, deal_uid: &str) -> ServiceResult<bool> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(false);
        };
        self.check_deal_ownership(&deal)?;
        let uid = deal_uid.to_string();
        with_conn(&self.pool, move |conn| {
            Deal::delete(conn, &uid).map_err(ServiceError::from)
        })
        .await
    }

    // ========================================================================
    // Requisites and attachments (owner-only edits with audit messages)
    // ========================================================================

    pub async fn get_requisites(&self, deal_uid: &str) -> ServiceResult<Option<Value>> {
        Ok(self
            .get_deal(deal_uid)
            .await?
            .map(|deal| deal.requisites.unwrap_or_else(|| json!({}))))
    }

    /// Replace the payment requisites, appending a deal-type audit message.
    pub async fn update_requisites(
        &self,
        deal_uid: &str,
        requisites: Value,
    ) -> ServiceResult<Option<Value>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        self.check_deal_ownership(&deal)?;

        let owner = self.owner_did.clone();
        let uid = deal_uid.to_string();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let old_requisites = deal.requisites.clone().unwrap_or_else(|| json!({}));
                Deal::set_requisites(conn, &uid, &requisites)?;

                let message = NewChatMessage {
                    uuid: Uuid::new_v4().to_string(),
                    message_type: MessageType::Deal,
                    sender_id: owner.clone(),
                    receiver_id: deal.receiver_did.clone(),
                    deal_uid: Some(uid.clone()),
                    deal_label: Some(deal.label.clone()),
                    text: Some("Deal requisites updated".into()),
                    attachments: None,
                    reply_to_message_uuid: None,
                    metadata: Some(json!({
                        "action": "update_requisites",
                        "old_requisites": old_requisites,
                        "new_requisites": requisites.clone(),
                        "changed_by": owner.clone(),
                    })),
                    signature: None,
                    txn_hash: None,
                };
                chat::add_message_on(conn, &owner, message, Some(&uid))?;

                Ok(Some(requisites))
            })
        })
        .await
    }

    pub async fn get_attachments(&self, deal_uid: &str) -> ServiceResult<Option<Vec<Value>>> {
        Ok(self.get_deal(deal_uid).await?.map(|deal| {
            deal.attachments
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default()
        }))
    }

    /// Store a file through the chat ledger and reference it on the deal.
    pub async fn add_attachment(
        &self,
        deal_uid: &str,
        attachment: FileAttachment,
    ) -> ServiceResult<Option<Vec<Value>>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        self.check_deal_ownership(&deal)?;

        let owner = self.owner_did.clone();
        let uid = deal_uid.to_string();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let message_uuid = Uuid::new_v4().to_string();
                let message = NewChatMessage {
                    uuid: message_uuid.clone(),
                    message_type: MessageType::File,
                    sender_id: owner.clone(),
                    receiver_id: deal.receiver_did.clone(),
                    deal_uid: Some(uid.clone()),
                    deal_label: Some(deal.label.clone()),
                    text: None,
                    attachments: Some(vec![attachment]),
                    reply_to_message_uuid: None,
                    metadata: None,
                    signature: None,
                    txn_hash: None,
                };
                let stored = chat::add_message_on(conn, &owner, message, Some(&uid))?;
                let saved = stored
                    .attachments
                    .as_ref()
                    .and_then(|list| list.first())
                    .ok_or_else(|| ServiceError::Validation("Failed to save attachment".into()))?;

                // Reference by (message_uuid, attachment_id); the ledger
                // owns the payload
                let mut attachments: Vec<Value> = deal
                    .attachments
                    .clone()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                attachments.push(json!({
                    "message_uuid": message_uuid,
                    "attachment_id": saved.id.clone(),
                    "name": saved.name.clone(),
                    "type": saved.kind,
                    "mime_type": saved.mime_type.clone(),
                    "size": saved.size,
                    "width": saved.width,
                    "height": saved.height,
                    "added_at": chrono::Utc::now().to_rfc3339(),
                    "added_by": owner,
                }));
                Deal::set_attachments(conn, &uid, &json!(attachments))?;
                Ok(Some(attachments))
            })
        })
        .await
    }

    /// Remove an attachment reference, appending an audit message.
    pub async fn remove_attachment(
        &self,
        deal_uid: &str,
        attachment_uuid: &str,
    ) -> ServiceResult<Option<Vec<Value>>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        self.check_deal_ownership(&deal)?;

        let owner = self.owner_did.clone();
        let uid = deal_uid.to_string();
        let needle = attachment_uuid.to_string();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let current: Vec<Value> = deal
                    .attachments
                    .clone()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();

                let mut removed: Option<Value> = None;
                let kept: Vec<Value> = current
                    .into_iter()
                    .filter(|att| {
                        let matches = att.get("message_uuid").and_then(Value::as_str)
                            == Some(needle.as_str())
                            || att.get("attachment_id").and_then(Value::as_str)
                                == Some(needle.as_str());
                        if matches {
                            removed = Some(att.clone());
                        }
                        !matches
                    })
                    .collect();

                let Some(removed) = removed else {
                    return Ok(Some(kept));
                };

                let name = removed
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let message = NewChatMessage {
                    uuid: Uuid::new_v4().to_string(),
                    message_type: MessageType::Deal,
                    sender_id: owner.clone(),
                    receiver_id: deal.receiver_did.clone(),
                    deal_uid: Some(uid.clone()),
                    deal_label: Some(deal.label.clone()),
                    text: Some(format!("File removed: {name}")),
                    attachments: None,
                    reply_to_message_uuid: None,
                    metadata: Some(json!({
                        "action": "remove_attachment",
                        "removed_attachment": removed,
                        "removed_by": owner.clone(),
                    })),
                    signature: None,
                    txn_hash: None,
                };
                chat::add_message_on(conn, &owner, message, Some(&uid))?;

                Deal::set_attachments(conn, &uid, &json!(kept))?;
                Ok(Some(kept))
            })
        })
        .await
    }

    // ========================================================================
    // Terms approval and deposit
    // ========================================================================

    /// The sender accepts the deal terms; transitions stay locked until
    /// this flag clears.
    pub async fn approve_terms(&self, deal_uid: &str) -> ServiceResult<Option<Deal>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        if !deal.need_receiver_approve {
            return Ok(Some(deal));
        }
        if deal.sender_did != self.owner_did {
            return Err(ServiceError::Validation(
                "Only the sender can approve the deal terms".into(),
            ));
        }

        let owner = self.owner_did.clone();
        let uid = deal_uid.to_string();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                Deal::set_need_receiver_approve(conn, &uid, false)?;
                let nickname = WalletUser::nickname_for(conn, &owner)?;
                emit_service_message(
                    conn,
                    &deal,
                    &owner,
                    &deal.receiver_did,
                    format!("{nickname} {owner} accepted the deal terms"),
                    None,
                );
                Ok(Deal::find_by_uid(conn, &uid)?)
            })
        })
        .await
    }

    /// Record the sender's deposit transaction hash.
    pub async fn set_deposit_txn_hash(
        &self,
        deal_uid: &str,
        tx_hash: &str,
    ) -> ServiceResult<Option<Deal>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        if deal.status()? != DealStatus::WaitDeposit {
            return Ok(None);
        }
        if deal.sender_did != self.owner_did {
            return Err(ServiceError::Validation(
                "Only the sender can record the deposit transaction".into(),
            ));
        }
        let uid = deal_uid.to_string();
        let hash = tx_hash.to_string();
        with_conn(&self.pool, move |conn| {
            Deal::set_deposit_txn_hash(conn, &uid, &hash)?;
            Ok(Deal::find_by_uid(conn, &uid)?)
        })
        .await
    }

    // ========================================================================
    // Payout builder
    // ========================================================================

    /// Ensure `deal.payout_txn` reflects the correct outbound transaction
    /// for the current status, or is cleared when none applies.
    pub async fn get_or_build_deal_payout_txn(
        &self,
        deal_uid: &str,
    ) -> ServiceResult<Option<PayoutPayload>> {
        let Some(mut deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };

        let Some(escrow_id) = deal.escrow_id else {
            self.clear_payout(deal_uid).await?;
            return Ok(None);
        };
        let Some(escrow) = self.load_escrow(escrow_id).await? else {
            self.clear_payout(deal_uid).await?;
            return Ok(None);
        };
        if escrow.blockchain != self.settings.blockchain {
            self.clear_payout(deal_uid).await?;
            return Ok(None);
        }

        let mut status = deal.status()?;

        if status == DealStatus::WaitDeposit {
            let Some(deposit_hash) = deal.deposit_txn_hash.clone() else {
                self.clear_payout(deal_uid).await?;
                return Ok(None);
            };
            if !self
                .is_deposit_confirmed(deal_uid, &deposit_hash, &escrow.network)
                .await
            {
                return Ok(None);
            }
            self.promote_deposit(&deal, &deposit_hash).await?;
            status = DealStatus::Processing;
            if let Some(reloaded) = self.get_deal(deal_uid).await? {
                deal = reloaded;
            }
        }

        let recipient_role = match payout_target(status) {
            PayoutTarget::Clear => {
                self.clear_payout(deal_uid).await?;
                return Ok(None);
            }
            PayoutTarget::AwaitDeposit => return Ok(None),
            PayoutTarget::Recipient(role) => role,
        };

        let to_did = match recipient_role {
            Role::Sender => deal.sender_did.clone(),
            Role::Receiver | Role::Arbiter => deal.receiver_did.clone(),
        };
        let to_did_for_query = to_did.clone();
        let to_address = with_conn(&self.pool, move |conn| {
            WalletUser::address_by_did(conn, &to_did_for_query).map_err(ServiceError::from)
        })
        .await?;
        let Some(to_address) = to_address else {
            warn!(deal_uid, %to_did, "payout recipient has no wallet user record");
            self.clear_payout(deal_uid).await?;
            return Ok(None);
        };

        let requisites = deal.requisites.clone().unwrap_or_else(|| json!({}));
        let amount = deal
            .amount
            .as_ref()
            .and_then(BigDecimal::to_f64)
            .or_else(|| value_as_f64(requisites.get("amount")));
        let Some(amount) = amount else {
            info!(deal_uid, "deal has no amount, clearing payout");
            self.clear_payout(deal_uid).await?;
            return Ok(None);
        };

        let token_contract = requisites
            .get("token_contract")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| Some(self.settings.default_token_contract.clone()));

        // Reuse the stored payload verbatim when it still matches; this
        // preserves collected signatures across reads
        if let Some(existing) = deal.payout_payload() {
            if payload_matches(&existing, &to_address, amount, token_contract.as_deref()) {
                if status == DealStatus::Processing
                    && existing.signatures.len() >= effective_required(&existing)
                {
                    if let Some(tx_hash) = existing.tx_id() {
                        // Explicit FAILED surfaces the on-chain error to
                        // the caller; pending keeps the payload as is
                        if self.is_payout_tx_success(&tx_hash, &escrow.network).await? {
                            self.finalize_success(&deal, &tx_hash).await?;
                        }
                    }
                }
                return Ok(Some(existing));
            }
        }

        // Build a fresh unsigned transaction for the current recipient
        let escrow_service = EscrowService::new(
            self.pool.clone(),
            self.chain.clone(),
            self.settings.clone(),
            deal.sender_did.clone(),
        );
        let created = match escrow_service
            .create_payment_transaction(escrow_id, &to_address, amount, token_contract.as_deref())
            .await
        {
            Ok(created) => created,
            Err(e) => {
                warn!(deal_uid, "create_payment_transaction failed: {e}");
                self.clear_payout(deal_uid).await?;
                return Ok(None);
            }
        };

        let mut unsigned_tx = created.unsigned_tx;
        if unsigned_tx.get("visible") != Some(&json!(true)) {
            unsigned_tx["visible"] = json!(true);
        }
        let contract_data = unsigned_tx.get("raw_data").cloned().unwrap_or_else(|| json!({}));
        let contract_type = if token_contract.is_some() {
            "TriggerSmartContract"
        } else {
            "TransferContract"
        };

        let payload = PayoutPayload {
            blockchain: escrow.blockchain.clone(),
            network: escrow.network.clone(),
            escrow_id,
            to_address,
            amount,
            token_contract,
            unsigned_tx,
            contract_data,
            required_signatures: created.required_signatures,
            participants: created.participants,
            arbiter: created.arbiter,
            owner_addresses: created.owner_addresses,
            contract_type: contract_type.to_string(),
            signatures: vec![],
        };

        let uid = deal_uid.to_string();
        let value = payload.to_value();
        with_conn(&self.pool, move |conn| {
            Deal::set_payout_txn(conn, &uid, Some(&value)).map_err(ServiceError::from)
        })
        .await?;

        Ok(Some(payload))
    }

    /// Clear the stored payload and rebuild it for the current status.
    pub async fn refresh_deal_payout_txn(
        &self,
        deal_uid: &str,
    ) -> ServiceResult<Option<PayoutPayload>> {
        if self.get_deal(deal_uid).await?.is_none() {
            return Ok(None);
        }
        self.clear_payout(deal_uid).await?;
        self.get_or_build_deal_payout_txn(deal_uid).await
    }

    /// Sender-driven rebuild after an on-chain failure (e.g. out of
    /// energy): signatures reset, a service message names the failed
    /// transaction and the reason.
    pub async fn refresh_payout_txn_for_retry(
        &self,
        deal_uid: &str,
        failed_tx_hash: Option<&str>,
        reason: Option<&str>,
    ) -> ServiceResult<Option<PayoutPayload>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        if self.owner_did != deal.sender_did {
            return Ok(None);
        }
        if deal.status()? != DealStatus::Processing || deal.need_receiver_approve {
            return Ok(None);
        }

        let Some(payload) = self.refresh_deal_payout_txn(deal_uid).await? else {
            return Ok(None);
        };

        let reason_text = reason
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("the transaction did not go through on chain")
            .to_string();
        let failed_hash = failed_tx_hash
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let owner = self.owner_did.clone();
        let explorer = self.settings.explorer_tx_base.clone();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let nickname = WalletUser::nickname_for(conn, &owner)?;
                let mut parts = vec![format!("{nickname} initiated a payout transaction rebuild.")];
                if let Some(hash) = &failed_hash {
                    parts.push(format!("Problem transaction: {explorer}/{hash}"));
                }
                parts.push(format!("Reason: {reason_text}."));
                parts.push("The receiver and the sender must sign again.".to_string());
                emit_service_message(
                    conn,
                    &deal,
                    &deal.sender_did.clone(),
                    &deal.receiver_did.clone(),
                    parts.join(" "),
                    failed_hash,
                );
                Ok(())
            })
        })
        .await?;

        Ok(Some(payload))
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Apply a requested status change under the authorization matrix.
    pub async fn set_deal_status(
        &self,
        deal_uid: &str,
        requested: &str,
    ) -> ServiceResult<Option<Deal>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        if deal.need_receiver_approve {
            return Err(ServiceError::Transition(
                "Deal not started: receiver approval required".into(),
            ));
        }
        let role = self
            .actor_role(&deal)
            .ok_or_else(|| ServiceError::Validation("Caller is not a deal participant".into()))?;
        let plan = plan_transition(role, deal.status()?, requested)?;

        let owner = self.owner_did.clone();
        let uid = deal_uid.to_string();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                Deal::set_status(conn, &uid, plan.next)?;
                if plan.clear_payout {
                    Deal::set_payout_txn(conn, &uid, None)?;
                }
                match plan.note {
                    Some(ServiceNote::AppealFiled) => {
                        let nickname = WalletUser::nickname_for(conn, &owner)?;
                        let other = if owner == deal.sender_did {
                            deal.receiver_did.clone()
                        } else {
                            deal.sender_did.clone()
                        };
                        emit_service_message(
                            conn,
                            &deal,
                            &owner,
                            &other,
                            format!("{nickname} filed an appeal"),
                            None,
                        );
                    }
                    Some(ServiceNote::ArbiterRecalled) => emit_service_message(
                        conn,
                        &deal,
                        &deal.arbiter_did.clone(),
                        &deal.receiver_did.clone(),
                        "Arbiter returned the deal for review".to_string(),
                        None,
                    ),
                    Some(ServiceNote::ReclineAppeal) => emit_service_message(
                        conn,
                        &deal,
                        &deal.arbiter_did.clone(),
                        &deal.receiver_did.clone(),
                        "Arbiter sent the request back for review".to_string(),
                        None,
                    ),
                    Some(ServiceNote::ReturnedToWork) => emit_service_message(
                        conn,
                        &deal,
                        &deal.arbiter_did.clone(),
                        &deal.receiver_did.clone(),
                        "Arbiter returned the deal to work".to_string(),
                        None,
                    ),
                    None => {}
                }
                Ok(())
            })
        })
        .await?;

        // Rebuild the payout for the new recipient outside the transaction
        self.refresh_deal_payout_txn(deal_uid).await?;
        self.get_deal(deal_uid).await
    }

    /// Confirm completion after a successful payout broadcast.
    ///
    /// `processing` + sender → `success`; `resolving_sender` + sender →
    /// `resolved_sender`; `resolving_receiver` + receiver →
    /// `resolved_receiver`. The resolving paths require the transaction
    /// hash and its on-chain confirmation.
    pub async fn confirm_complete(
        &self,
        deal_uid: &str,
        payout_tx_hash: Option<&str>,
    ) -> ServiceResult<Option<Deal>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        if deal.need_receiver_approve {
            return Ok(None);
        }
        let tx_hash = payout_tx_hash
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        match deal.status()? {
            DealStatus::Processing => {
                if self.owner_did != deal.sender_did {
                    return Ok(None);
                }
                if let (Some(hash), Some(escrow_id)) = (&tx_hash, deal.escrow_id) {
                    if let Some(escrow) = self.load_escrow(escrow_id).await? {
                        if escrow.blockchain == self.settings.blockchain
                            && !self.is_payout_tx_success(hash, &escrow.network).await?
                        {
                            warn!(deal_uid, %hash, "payout tx not confirmed");
                            return Ok(None);
                        }
                    }
                }
                self.finalize(&deal, DealStatus::Success, tx_hash, CompletionNote::Sender)
                    .await?;
                self.get_deal(deal_uid).await
            }
            DealStatus::ResolvingSender => {
                if self.owner_did != deal.sender_did {
                    return Ok(None);
                }
                let (Some(hash), Some(escrow_id)) = (tx_hash.clone(), deal.escrow_id) else {
                    return Ok(None);
                };
                let Some(escrow) = self.load_escrow(escrow_id).await? else {
                    return Ok(None);
                };
                if escrow.blockchain != self.settings.blockchain {
                    return Ok(None);
                }
                if !self.is_payout_tx_success(&hash, &escrow.network).await? {
                    warn!(deal_uid, %hash, "payout tx not confirmed");
                    return Ok(None);
                }
                self.finalize(&deal, DealStatus::ResolvedSender, tx_hash, CompletionNote::Sender)
                    .await?;
                self.get_deal(deal_uid).await
            }
            DealStatus::ResolvingReceiver => {
                if self.owner_did != deal.receiver_did {
                    return Ok(None);
                }
                let (Some(hash), Some(escrow_id)) = (tx_hash.clone(), deal.escrow_id) else {
                    return Ok(None);
                };
                let Some(escrow) = self.load_escrow(escrow_id).await? else {
                    return Ok(None);
                };
                if escrow.blockchain != self.settings.blockchain {
                    return Ok(None);
                }
                if !self.is_payout_tx_success(&hash, &escrow.network).await? {
                    warn!(deal_uid, %hash, "payout tx not confirmed");
                    return Ok(None);
                }
                self.finalize(
                    &deal,
                    DealStatus::ResolvedReceiver,
                    tx_hash,
                    CompletionNote::Receiver,
                )
                .await?;
                self.get_deal(deal_uid).await
            }
            _ => Ok(None),
        }
    }

    // ========================================================================
    // Signature aggregator
    // ========================================================================

    /// Add an off-chain signature to the stored payout payload.
    pub async fn add_payout_signature(
        &self,
        deal_uid: &str,
        signer_address: &str,
        signature: &str,
        signature_index: Option<u32>,
        unsigned_tx: Option<Value>,
    ) -> ServiceResult<Option<PayoutPayload>> {
        let Some(deal) = self.get_deal(deal_uid).await? else {
            return Ok(None);
        };
        let Some(mut payload) = deal.payout_payload() else {
            return Ok(None);
        };

        match apply_signature(
            &mut payload,
            signer_address,
            signature,
            signature_index,
            unsigned_tx,
        )? {
            SignatureOutcome::Duplicate => return Ok(Some(payload)),
            SignatureOutcome::Added => {}
        }

        let uid = deal_uid.to_string();
        let signer = signer_address.to_string();
        let value = payload.to_value();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                Deal::set_payout_txn(conn, &uid, Some(&value))?;

                // A signature from the receiver's wallet doubles as their
                // report that the deal conditions are fulfilled
                if let Some(receiver) = WalletUser::find_by_did(conn, &deal.receiver_did)? {
                    if receiver.wallet_address.trim().to_lowercase()
                        == signer.trim().to_lowercase()
                    {
                        let nickname = receiver.display_name().to_string();
                        emit_service_message(
                            conn,
                            &deal,
                            &deal.receiver_did.clone(),
                            &deal.sender_did.clone(),
                            format!(
                                "{nickname} {} reported that the deal conditions are fulfilled",
                                deal.receiver_did
                            ),
                            None,
                        );
                    }
                }
                Ok(())
            })
        })
        .await?;

        Ok(Some(payload))
    }

    /// The broadcast-ready payload, once enough signatures are collected.
    pub fn get_payout_signed_tx(deal: &Deal) -> Option<Value> {
        deal.payout_payload()
            .as_ref()
            .and_then(assemble_signed_tx)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn clear_payout(&self, deal_uid: &str) -> ServiceResult<()> {
        let uid = deal_uid.to_string();
        with_conn(&self.pool, move |conn| {
            Deal::set_payout_txn(conn, &uid, None).map_err(ServiceError::from)
        })
        .await
    }

    async fn load_escrow(&self, escrow_id: i32) -> ServiceResult<Option<Escrow>> {
        with_conn(&self.pool, move |conn| {
            Escrow::find_by_id(conn, escrow_id).map_err(ServiceError::from)
        })
        .await
    }

    /// Deposit receipt check with a short per-deal cache to smooth
    /// repeated reads.
    async fn is_deposit_confirmed(&self, deal_uid: &str, tx_hash: &str, network: &str) -> bool {
        if let Some((at, confirmed)) = DEPOSIT_CHECKS
            .lock()
            .expect("deposit cache poisoned")
            .get(deal_uid)
        {
            if at.elapsed() < DEPOSIT_CHECK_TTL {
                return *confirmed;
            }
        }

        let confirmed = match self.chain.get_transaction_info(network, tx_hash).await {
            Ok(info) => info.result() == Some("SUCCESS") && info.in_block(),
            Err(e) => {
                warn!(deal_uid, "deposit tx check failed: {e}");
                false
            }
        };

        DEPOSIT_CHECKS
            .lock()
            .expect("deposit cache poisoned")
            .insert(deal_uid.to_string(), (Instant::now(), confirmed));
        confirmed
    }

    /// Poll the payout receipt for up to ~10 s.
    ///
    /// `SUCCESS` in a block → `Ok(true)`; explicit failure → the on-chain
    /// error as [`ServiceError::ChainExecution`]; persistent pending →
    /// `Ok(false)` and the client retries.
    async fn is_payout_tx_success(&self, tx_hash: &str, network: &str) -> ServiceResult<bool> {
        let mut saw_transport_error = false;
        for attempt in 0..PAYOUT_CHECK_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(PAYOUT_CHECK_INTERVAL).await;
            }
            let info = match self.chain.get_transaction_info(network, tx_hash).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(%tx_hash, attempt, "payout tx check failed: {e}");
                    saw_transport_error = true;
                    continue;
                }
            };
            match info.result() {
                Some("SUCCESS") => return Ok(info.in_block()),
                Some(result) if !result.eq_ignore_ascii_case("PENDING") && !result.is_empty() => {
                    return Err(ServiceError::ChainExecution(info.failure_message()));
                }
                _ => {} // pending or not yet indexed
            }
        }
        if saw_transport_error {
            warn!(%tx_hash, "payout tx check exhausted after transport errors");
        }
        Ok(false)
    }

    /// Promote `wait_deposit → processing` with the one-time deposit
    /// service message keyed by the deposit hash.
    async fn promote_deposit(&self, deal: &Deal, deposit_hash: &str) -> ServiceResult<()> {
        let deal = deal.clone();
        let hash = deposit_hash.to_string();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                Deal::set_status(conn, &deal.uid, DealStatus::Processing)?;
                let nickname = WalletUser::nickname_for(conn, &deal.sender_did)?;
                emit_service_message(
                    conn,
                    &deal,
                    &deal.sender_did.clone(),
                    &deal.receiver_did.clone(),
                    format!("{nickname} posted the escrow deposit."),
                    Some(hash),
                );
                Ok(())
            })
        })
        .await
    }

    /// `processing → success` observed from a confirmed, fully signed
    /// payout during a read.
    async fn finalize_success(&self, deal: &Deal, tx_hash: &str) -> ServiceResult<()> {
        self.finalize(
            deal,
            DealStatus::Success,
            Some(tx_hash.to_string()),
            CompletionNote::Sender,
        )
        .await
    }

    async fn finalize(
        &self,
        deal: &Deal,
        next: DealStatus,
        tx_hash: Option<String>,
        note: CompletionNote,
    ) -> ServiceResult<()> {
        let deal = deal.clone();
        with_conn(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let (actor, other, text) = match note {
                    CompletionNote::Sender => {
                        let nickname = WalletUser::nickname_for(conn, &deal.sender_did)?;
                        (
                            deal.sender_did.clone(),
                            deal.receiver_did.clone(),
                            format!(
                                "{nickname} {} confirmed completion and has no claims",
                                deal.sender_did
                            ),
                        )
                    }
                    CompletionNote::Receiver => {
                        let nickname = WalletUser::nickname_for(conn, &deal.receiver_did)?;
                        (
                            deal.receiver_did.clone(),
                            deal.sender_did.clone(),
                            format!("{nickname} {} confirmed receipt", deal.receiver_did),
                        )
                    }
                };
                emit_service_message(conn, &deal, &actor, &other, text, tx_hash.clone());

                Deal::set_status(conn, &deal.uid, next)?;
                if let Some(hash) = &tx_hash {
                    Deal::set_payout_txn_hash(conn, &deal.uid, hash)?;
                }
                Ok(())
            })
        })
        .await
    }
}

#[derive(Debug, Clone, Copy)]
enum CompletionNote {
    Sender,
    Receiver,
}

/// Append a service message to the deal chat inside the caller's
/// transaction. Messages carrying a tx hash are deduplicated by
/// `(deal_uid, service, txn_hash)`; failures are logged, never fatal to
/// the surrounding transition.
fn emit_service_message(
    conn: &mut PgConnection,
    deal: &Deal,
    sender_did: &str,
    receiver_did: &str,
    text: String,
    txn_hash: Option<String>,
) {
    if let Some(hash) = &txn_hash {
        match StorageRecord::service_message_exists(conn, CHAT_SPACE, &deal.uid, hash) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(deal_uid = %deal.uid, "service message dedup check failed: {e}");
                return;
            }
        }
    }

    let message = NewChatMessage {
        uuid: Uuid::new_v4().to_string(),
        message_type: MessageType::Service,
        sender_id: sender_did.to_string(),
        receiver_id: receiver_did.to_string(),
        deal_uid: Some(deal.uid.clone()),
        deal_label: Some(deal.label.clone()),
        text: Some(text),
        attachments: None,
        reply_to_message_uuid: None,
        metadata: None,
        signature: None,
        txn_hash,
    };
    if let Err(e) = chat::add_message_on(conn, sender_did, message, Some(&deal.uid)) {
        warn!(deal_uid = %deal.uid, "failed to append service message: {e}");
    }
}

fn value_as_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(owner_addresses: Option<Vec<&str>>) -> PayoutPayload {
        PayoutPayload {
            blockchain: "tron".into(),
            network: "mainnet".into(),
            escrow_id: 1,
            to_address: "TReceiver".into(),
            amount: 100.0,
            token_contract: Some("TToken".into()),
            unsigned_tx: json!({"txID": "aa11", "raw_data_hex": "beef", "raw_data": {}}),
            contract_data: json!({}),
            required_signatures: 2,
            participants: vec!["TSender".into(), "TReceiver".into()],
            arbiter: "TArb".into(),
            owner_addresses: owner_addresses
                .map(|list| list.into_iter().map(str::to_string).collect()),
            contract_type: "TriggerSmartContract".into(),
            signatures: vec![],
        }
    }

    // ------------------------------------------------------------------
    // Transition matrix
    // ------------------------------------------------------------------

    #[test]
    fn party_appeal_from_processing() {
        let plan = plan_transition(Role::Sender, DealStatus::Processing, "appeal").unwrap();
        assert_eq!(plan.next, DealStatus::WaitArbiter);
        assert!(plan.clear_payout);
        assert_eq!(plan.note, Some(ServiceNote::AppealFiled));

        assert!(plan_transition(Role::Receiver, DealStatus::Processing, "appeal").is_ok());
        assert!(plan_transition(Role::Sender, DealStatus::WaitDeposit, "appeal").is_err());
    }

    #[test]
    fn arbiter_recalls_only_final_states() {
        let plan = plan_transition(Role::Arbiter, DealStatus::Success, "appeal").unwrap();
        assert_eq!(plan.next, DealStatus::WaitArbiter);
        assert_eq!(plan.note, Some(ServiceNote::ArbiterRecalled));

        assert!(plan_transition(Role::Arbiter, DealStatus::ResolvedSender, "appeal").is_ok());
        assert!(plan_transition(Role::Arbiter, DealStatus::Processing, "appeal").is_err());
    }

    #[test]
    fn parties_locked_out_of_appeal_states() {
        for current in [
            DealStatus::WaitArbiter,
            DealStatus::ReclineAppeal,
            DealStatus::ResolvingSender,
            DealStatus::Success,
        ] {
            assert!(plan_transition(Role::Sender, current, "processing").is_err());
            assert!(plan_transition(Role::Receiver, current, "resolving_sender").is_err());
        }
    }

    #[test]
    fn arbiter_resolving_paths() {
        for current in [
            DealStatus::WaitArbiter,
            DealStatus::Appeal,
            DealStatus::ReclineAppeal,
        ] {
            let plan = plan_transition(Role::Arbiter, current, "resolving_sender").unwrap();
            assert_eq!(plan.next, DealStatus::ResolvingSender);
            assert!(!plan.clear_payout);

            let plan = plan_transition(Role::Arbiter, current, "resolving_receiver").unwrap();
            assert_eq!(plan.next, DealStatus::ResolvingReceiver);
        }
        assert!(plan_transition(Role::Arbiter, DealStatus::Processing, "resolving_sender").is_err());
    }

    #[test]
    fn recline_only_from_resolving() {
        let plan =
            plan_transition(Role::Arbiter, DealStatus::ResolvingSender, "recline_appeal").unwrap();
        assert_eq!(plan.next, DealStatus::ReclineAppeal);
        assert!(plan.clear_payout);

        assert!(plan_transition(Role::Arbiter, DealStatus::WaitArbiter, "recline_appeal").is_err());
    }

    #[test]
    fn return_to_work_is_arbiter_only() {
        let plan = plan_transition(Role::Arbiter, DealStatus::WaitArbiter, "processing").unwrap();
        assert_eq!(plan.next, DealStatus::Processing);
        assert_eq!(plan.note, Some(ServiceNote::ReturnedToWork));

        let plan = plan_transition(Role::Arbiter, DealStatus::Success, "processing").unwrap();
        assert!(plan.clear_payout);

        assert!(plan_transition(Role::Sender, DealStatus::Processing, "processing").is_err());
    }

    #[test]
    fn direct_terminal_transitions_are_rejected() {
        // success/resolved are reachable only via confirm-complete
        assert!(plan_transition(Role::Sender, DealStatus::Processing, "success").is_err());
        assert!(
            plan_transition(Role::Arbiter, DealStatus::ResolvingSender, "resolved_sender").is_err()
        );
        assert!(plan_transition(Role::Sender, DealStatus::Processing, "unknown").is_err());
    }

    // ------------------------------------------------------------------
    // Payout decision table
    // ------------------------------------------------------------------

    #[test]
    fn decision_table() {
        assert_eq!(payout_target(DealStatus::WaitDeposit), PayoutTarget::AwaitDeposit);
        assert_eq!(
            payout_target(DealStatus::Processing),
            PayoutTarget::Recipient(Role::Receiver)
        );
        assert_eq!(
            payout_target(DealStatus::Success),
            PayoutTarget::Recipient(Role::Receiver)
        );
        assert_eq!(
            payout_target(DealStatus::ResolvingSender),
            PayoutTarget::Recipient(Role::Sender)
        );
        assert_eq!(
            payout_target(DealStatus::ResolvedSender),
            PayoutTarget::Recipient(Role::Sender)
        );
        assert_eq!(
            payout_target(DealStatus::ResolvingReceiver),
            PayoutTarget::Recipient(Role::Receiver)
        );
        assert_eq!(
            payout_target(DealStatus::ResolvedReceiver),
            PayoutTarget::Recipient(Role::Receiver)
        );
        for status in [DealStatus::Appeal, DealStatus::WaitArbiter, DealStatus::ReclineAppeal] {
            assert_eq!(payout_target(status), PayoutTarget::Clear);
        }
    }

    #[test]
    fn payload_reuse_matching() {
        let p = payload(None);
        assert!(payload_matches(&p, "TReceiver", 100.0, Some("TToken")));
        assert!(!payload_matches(&p, "TSender", 100.0, Some("TToken")));
        assert!(!payload_matches(&p, "TReceiver", 100.5, Some("TToken")));
        assert!(!payload_matches(&p, "TReceiver", 100.0, Some("TOther")));
        assert!(!payload_matches(&p, "TReceiver", 100.0, None));
    }

    // ------------------------------------------------------------------
    // Signature aggregation
    // ------------------------------------------------------------------

    #[test]
    fn rejects_foreign_signer() {
        let mut p = payload(Some(vec!["TSender", "TReceiver", "TArb"]));
        let result = apply_signature(&mut p, "TMallory", "0xff", None, None);
        assert!(matches!(result, Err(ServiceError::Validation(_))));
        assert!(p.signatures.is_empty());
    }

    #[test]
    fn arbiter_allowed_without_owner_list() {
        let mut p = payload(None);
        assert_eq!(
            apply_signature(&mut p, "TArb", "0xff", None, None).unwrap(),
            SignatureOutcome::Added
        );
    }

    #[test]
    fn duplicate_signer_is_a_noop() {
        let mut p = payload(Some(vec!["TSender", "TReceiver", "TArb"]));
        apply_signature(&mut p, "TSender", "0xaa", None, None).unwrap();
        assert_eq!(
            apply_signature(&mut p, "TSender", "0xbb", None, None).unwrap(),
            SignatureOutcome::Duplicate
        );
        assert_eq!(p.signatures.len(), 1);
        assert_eq!(p.signatures[0].signature, "0xaa");
    }

    #[test]
    fn unsigned_tx_replacement_rules() {
        let mut p = payload(Some(vec!["TSender", "TReceiver", "TArb"]));
        let extended = json!({"txID": "bb22", "raw_data_hex": "cafe", "raw_data": {"k": 1}});

        // no signatures yet: replacement allowed
        apply_signature(&mut p, "TSender", "0xaa", None, Some(extended.clone())).unwrap();
        assert_eq!(p.unsigned_tx["txID"], "bb22");
        assert_eq!(p.contract_data, json!({"k": 1}));

        // with a signature on file: replacement refused
        let result = apply_signature(&mut p, "TReceiver", "0xbb", None, Some(extended));
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[test]
    fn assembly_requires_threshold() {
        let mut p = payload(Some(vec!["TSender", "TReceiver", "TArb"]));
        assert!(assemble_signed_tx(&p).is_none());

        apply_signature(&mut p, "TReceiver", "0xbb", None, None).unwrap();
        assert!(assemble_signed_tx(&p).is_none());

        apply_signature(&mut p, "TSender", "0xaa", None, None).unwrap();
        let signed = assemble_signed_tx(&p).unwrap();
        // ordered by owner index (sender first), 0x stripped
        assert_eq!(signed["signature"], json!(["aa", "bb"]));
        assert_eq!(signed["txID"], "aa11");
    }

    #[test]
    fn assembly_orders_by_owner_index_not_arrival() {
        let mut p = payload(Some(vec!["TSender", "TReceiver", "TArb"]));
        apply_signature(&mut p, "TArb", "0xcc", None, None).unwrap();
        apply_signature(&mut p, "TSender", "0xaa", None, None).unwrap();
        let signed = assemble_signed_tx(&p).unwrap();
        assert_eq!(signed["signature"], json!(["aa", "cc"]));
    }

    #[test]
    fn assembly_address_match_is_case_insensitive() {
        let mut p = payload(Some(vec!["TSender", "TReceiver", "TArb"]));
        apply_signature(&mut p, "TSender", "0xaa", None, None).unwrap();
        p.signatures[0].signer_address = "tsender".into();
        apply_signature(&mut p, "TArb", "0xcc", None, None).unwrap();
        let signed = assemble_signed_tx(&p).unwrap();
        assert_eq!(signed["signature"], json!(["aa", "cc"]));
    }

    #[test]
    fn degenerate_two_of_two_requires_all_participants() {
        let mut p = payload(None);
        p.arbiter = String::new();

        apply_signature(&mut p, "TSender", "0xaa", None, None).unwrap();
        assert!(assemble_signed_tx(&p).is_none());

        apply_signature(&mut p, "TReceiver", "0xbb", None, None).unwrap();
        let signed = assemble_signed_tx(&p).unwrap();
        // participant order: sender then receiver
        assert_eq!(signed["signature"], json!(["aa", "bb"]));
    }

    #[test]
    fn effective_required_falls_back_to_participant_count() {
        let mut p = payload(None);
        assert_eq!(effective_required(&p), 2);
        p.required_signatures = 0;
        assert_eq!(effective_required(&p), 2);
        p.participants.push("TThird".into());
        assert_eq!(effective_required(&p), 3);
    }

    #[test]
    fn amount_parsing_from_requisites() {
        assert_eq!(value_as_f64(Some(&json!(12.5))), Some(12.5));
        assert_eq!(value_as_f64(Some(&json!("12.5"))), Some(12.5));
        assert_eq!(value_as_f64(Some(&json!(" 99 "))), Some(99.0));
        assert_eq!(value_as_f64(Some(&json!("abc"))), None);
        assert_eq!(value_as_f64(None), None);
    }
}
