//! Chat message payload schema
//!
//! The serialized form of these types is what the storage records carry.
//! Validation enforces the per-type content invariants before anything is
//! persisted; an invalid message produces no records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use escrow_marketplace_common::{utils, validate_did, MAX_ATTACHMENT_SIZE};

use crate::error::{ServiceError, ServiceResult};

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
    Audio,
    Video,
    /// Text plus attachments
    Mixed,
    /// Reply to another message
    Reply,
    /// Marks deal-related activity in the thread
    Deal,
    /// Emitted by the state machine, never by users directly
    Service,
}

/// Attachment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    Document,
    Photo,
    Video,
    Audio,
}

/// Delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

/// Detached signature over a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSignature {
    /// Hex signature, `0x`-prefixed
    pub signature: String,
    pub signer_address: String,
    pub signed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
}

/// File attachment, base64 payload included
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AttachmentType,
    pub name: String,
    /// Size in bytes
    pub size: i64,
    pub mime_type: String,
    /// Base64 content; absent when stripped for paginated reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Set in place of `data` on stripped reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl FileAttachment {
    fn validate(&self) -> ServiceResult<()> {
        if self.size <= 0 {
            return Err(ServiceError::Validation(format!(
                "Attachment {}: size must be positive",
                self.id
            )));
        }
        if self.size > MAX_ATTACHMENT_SIZE {
            return Err(ServiceError::Validation(format!(
                "Attachment {}: size exceeds maximum of {} bytes",
                self.id, MAX_ATTACHMENT_SIZE
            )));
        }
        if let Some(data) = &self.data {
            if data.is_empty() {
                return Err(ServiceError::Validation(format!(
                    "Attachment {}: base64 data cannot be empty",
                    self.id
                )));
            }
            utils::decode_base64(data).map_err(|e| {
                ServiceError::Validation(format!("Attachment {}: {e}", self.id))
            })?;
        }
        Ok(())
    }
}

/// The full chat message as stored in a record payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub uuid: String,
    pub message_type: MessageType,
    pub sender_id: String,
    pub receiver_id: String,
    /// Per-owner grouping key, filled during fan-out
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_uuid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<FileAttachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<MessageSignature>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Chain transaction the message refers to; dedup key for service
    /// messages emitted by the state machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_hash: Option<String>,
}

/// Client-supplied shape for a new message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChatMessage {
    /// Generated on the client
    pub uuid: String,
    pub message_type: MessageType,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub deal_uid: Option<String>,
    #[serde(default)]
    pub deal_label: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<FileAttachment>>,
    #[serde(default)]
    pub reply_to_message_uuid: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub signature: Option<MessageSignature>,
    #[serde(default)]
    pub txn_hash: Option<String>,
}

impl NewChatMessage {
    fn has_text(&self) -> bool {
        self.text.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false)
    }

    fn attachment_slice(&self) -> &[FileAttachment] {
        self.attachments.as_deref().unwrap_or_default()
    }

    /// Enforce the schema invariants for this message type.
    pub fn validate(&self) -> ServiceResult<()> {
        validate_did(&self.sender_id)
            .map_err(|e| ServiceError::Validation(format!("sender_id: {e}")))?;
        validate_did(&self.receiver_id)
            .map_err(|e| ServiceError::Validation(format!("receiver_id: {e}")))?;

        for attachment in self.attachment_slice() {
            attachment.validate()?;
        }

        let attachments = self.attachment_slice();
        match self.message_type {
            MessageType::Text => {
                if !self.has_text() {
                    return Err(ServiceError::Validation(
                        "Text message must contain text".into(),
                    ));
                }
                if !attachments.is_empty() {
                    return Err(ServiceError::Validation(
                        "Text message cannot contain attachments".into(),
                    ));
                }
            }
            MessageType::File => {
                if attachments.is_empty() {
                    return Err(ServiceError::Validation(
                        "File message must contain at least one attachment".into(),
                    ));
                }
                if attachments
                    .iter()
                    .any(|a| matches!(a.kind, AttachmentType::Audio | AttachmentType::Video))
                {
                    return Err(ServiceError::Validation(
                        "File message cannot contain audio/video attachments".into(),
                    ));
                }
            }
            MessageType::Audio => {
                if attachments.is_empty()
                    || attachments.iter().any(|a| a.kind != AttachmentType::Audio)
                {
                    return Err(ServiceError::Validation(
                        "Audio message can only contain audio attachments".into(),
                    ));
                }
            }
            MessageType::Video => {
                if attachments.is_empty()
                    || attachments.iter().any(|a| a.kind != AttachmentType::Video)
                {
                    return Err(ServiceError::Validation(
                        "Video message can only contain video attachments".into(),
                    ));
                }
            }
            MessageType::Mixed => {
                if !self.has_text() && attachments.is_empty() {
                    return Err(ServiceError::Validation(
                        "Mixed message must contain either text or attachments".into(),
                    ));
                }
            }
            MessageType::Reply => {
                if self.reply_to_message_uuid.is_none() {
                    return Err(ServiceError::Validation(
                        "Reply message must contain reply_to_message_uuid".into(),
                    ));
                }
                if !self.has_text() && attachments.is_empty() {
                    return Err(ServiceError::Validation(
                        "Reply message must contain either text or attachments".into(),
                    ));
                }
            }
            MessageType::Deal => {
                if self.deal_uid.is_none() {
                    return Err(ServiceError::Validation(
                        "Deal message must contain deal_uid".into(),
                    ));
                }
                if self.deal_label.is_none() {
                    return Err(ServiceError::Validation(
                        "Deal message must contain deal_label".into(),
                    ));
                }
            }
            MessageType::Service => {}
        }

        if let Some(signature) = &self.signature {
            if !signature.signature.starts_with("0x") {
                return Err(ServiceError::Validation(
                    "Signature must start with '0x'".into(),
                ));
            }
            if signature.signature.len() < 10 {
                return Err(ServiceError::Validation("Signature too short".into()));
            }
            if !self.has_text() && attachments.is_empty() {
                return Err(ServiceError::Validation(
                    "Cannot sign a message without text or attachments".into(),
                ));
            }
        }

        Ok(())
    }

    /// Materialize the stored message form, conversation id left unfilled.
    pub fn into_message(self, timestamp: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            uuid: self.uuid,
            message_type: self.message_type,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            conversation_id: None,
            deal_uid: self.deal_uid,
            deal_label: self.deal_label,
            reply_to_message_uuid: self.reply_to_message_uuid,
            text: self.text,
            attachments: self.attachments,
            signature: self.signature,
            timestamp,
            status: MessageStatus::Sent,
            edited_at: None,
            metadata: self.metadata,
            txn_hash: self.txn_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    const SENDER: &str = "did:tron:ta";
    const RECEIVER: &str = "did:tron:tb";

    fn text_message(text: &str) -> NewChatMessage {
        NewChatMessage {
            uuid: "m-1".into(),
            message_type: MessageType::Text,
            sender_id: SENDER.into(),
            receiver_id: RECEIVER.into(),
            deal_uid: None,
            deal_label: None,
            text: Some(text.into()),
            attachments: None,
            reply_to_message_uuid: None,
            metadata: None,
            signature: None,
            txn_hash: None,
        }
    }

    fn attachment(kind: AttachmentType, size: i64) -> FileAttachment {
        FileAttachment {
            id: "a-1".into(),
            kind,
            name: "file.bin".into(),
            size,
            mime_type: "application/octet-stream".into(),
            data: Some(base64::engine::general_purpose::STANDARD.encode(b"content")),
            thumbnail: None,
            width: None,
            height: None,
            download_url: None,
        }
    }

    #[test]
    fn text_rules() {
        assert!(text_message("hello").validate().is_ok());
        assert!(text_message("   ").validate().is_err());

        let mut with_attachment = text_message("hello");
        with_attachment.attachments = Some(vec![attachment(AttachmentType::Document, 7)]);
        assert!(with_attachment.validate().is_err());
    }

    #[test]
    fn did_validation_applies() {
        let mut message = text_message("hello");
        message.sender_id = "not-a-did".into();
        assert!(message.validate().is_err());
    }

    #[test]
    fn file_rules() {
        let mut message = text_message("");
        message.message_type = MessageType::File;
        message.text = None;
        assert!(message.validate().is_err()); // no attachments

        message.attachments = Some(vec![attachment(AttachmentType::Document, 7)]);
        assert!(message.validate().is_ok());

        message.attachments = Some(vec![attachment(AttachmentType::Audio, 7)]);
        assert!(message.validate().is_err()); // audio not allowed in file message
    }

    #[test]
    fn audio_video_homogeneity() {
        let mut message = text_message("");
        message.message_type = MessageType::Audio;
        message.text = None;
        message.attachments = Some(vec![attachment(AttachmentType::Audio, 7)]);
        assert!(message.validate().is_ok());

        message.attachments = Some(vec![
            attachment(AttachmentType::Audio, 7),
            attachment(AttachmentType::Document, 7),
        ]);
        assert!(message.validate().is_err());

        message.message_type = MessageType::Video;
        message.attachments = Some(vec![attachment(AttachmentType::Video, 7)]);
        assert!(message.validate().is_ok());
    }

    #[test]
    fn attachment_size_limits() {
        let mut message = text_message("");
        message.message_type = MessageType::File;
        message.text = None;

        message.attachments = Some(vec![attachment(AttachmentType::Document, 0)]);
        assert!(message.validate().is_err());

        message.attachments =
            Some(vec![attachment(AttachmentType::Document, MAX_ATTACHMENT_SIZE + 1)]);
        assert!(message.validate().is_err());

        message.attachments =
            Some(vec![attachment(AttachmentType::Document, MAX_ATTACHMENT_SIZE)]);
        assert!(message.validate().is_ok());
    }

    #[test]
    fn invalid_base64_rejected() {
        let mut message = text_message("");
        message.message_type = MessageType::File;
        message.text = None;
        let mut bad = attachment(AttachmentType::Document, 7);
        bad.data = Some("!!!not base64!!!".into());
        message.attachments = Some(vec![bad]);
        assert!(message.validate().is_err());
    }

    #[test]
    fn reply_requires_reference() {
        let mut message = text_message("answering you");
        message.message_type = MessageType::Reply;
        assert!(message.validate().is_err());

        message.reply_to_message_uuid = Some("m-0".into());
        assert!(message.validate().is_ok());

        message.text = None;
        assert!(message.validate().is_err()); // neither text nor attachments
    }

    #[test]
    fn deal_requires_uid_and_label() {
        let mut message = text_message("");
        message.message_type = MessageType::Deal;
        message.text = None;
        assert!(message.validate().is_err());

        message.deal_uid = Some("3mJr7AoUXx2Wqd".into());
        assert!(message.validate().is_err());

        message.deal_label = Some("Invoice #1".into());
        // deal messages may carry neither text nor attachments
        assert!(message.validate().is_ok());
    }

    #[test]
    fn mixed_needs_content() {
        let mut message = text_message("");
        message.message_type = MessageType::Mixed;
        message.text = None;
        assert!(message.validate().is_err());
        message.text = Some("note".into());
        assert!(message.validate().is_ok());
    }

    #[test]
    fn signature_rules() {
        let mut message = text_message("signed content");
        message.signature = Some(MessageSignature {
            signature: "deadbeef".into(),
            signer_address: "TSigner".into(),
            signed_at: Utc::now(),
            message_hash: None,
        });
        assert!(message.validate().is_err()); // missing 0x

        message.signature.as_mut().unwrap().signature = "0xdeadbeef11".into();
        assert!(message.validate().is_ok());
    }

    #[test]
    fn service_messages_pass_through() {
        let mut message = text_message("arbiter returned the deal to work");
        message.message_type = MessageType::Service;
        message.txn_hash = Some("abc123".into());
        assert!(message.validate().is_ok());
    }

    #[test]
    fn payload_serialization_round_trip() {
        let message = text_message("hello").into_message(Utc::now());
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["message_type"], "text");
        assert_eq!(value["status"], "sent");
        let parsed: ChatMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.uuid, message.uuid);
    }
}
