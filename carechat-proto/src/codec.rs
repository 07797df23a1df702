//! Message codec: normalization, validation and outgoing construction,
//! plus JSON framing of socket events.
//!
//! Inbound payloads have used several field spellings over time
//! (`sender_id`/`senderId`, `recipient_id`/`receiver_id`, `content`/`text`,
//! ...). [`normalize`] folds them into one [`MessageDraft`] without ever
//! failing; [`validate`] reports every violated constraint; only
//! [`MessageDraft::into_message`] turns violations into an error.

use std::fmt;

use serde_json::{Map, Value};

use crate::conversation::ConversationId;
use crate::event::{ClientEvent, ServerEvent};
use crate::identity::{ProfileSource, resolve_local_party};
use crate::message::{MAX_CONTENT_SIZE, Message, MessageId, MessageKind, Timestamp};
use crate::party::{PartyId, PartyRef, PartyType};

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No signed-in party could be resolved, so the message has no sender.
    #[error("no signed-in party available to send as")]
    NoLocalParty,
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A single violated message constraint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// No sender id.
    #[error("missing sender")]
    MissingSender,
    /// No recipient id.
    #[error("missing recipient")]
    MissingRecipient,
    /// Content is empty or whitespace.
    #[error("message content is empty")]
    EmptyContent,
    /// Content exceeds [`MAX_CONTENT_SIZE`].
    #[error("message content too large: {size} bytes (max {max} bytes)")]
    ContentTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
    /// Sender type outside `user | caregiver | admin`.
    #[error("invalid sender type '{0}'")]
    InvalidSenderType(String),
    /// Recipient type outside `user | caregiver | admin`.
    #[error("invalid recipient type '{0}'")]
    InvalidRecipientType(String),
    /// Kind outside `text | image | file | system`.
    #[error("invalid message type '{0}'")]
    InvalidKind(String),
}

/// A non-empty list of violations, displayed as one `; `-joined reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Violations {}

/// A message in canonical shape whose fields have not been checked yet.
///
/// Type and kind stay as raw strings so that [`validate`] can report bad
/// values instead of them being lost during normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Provisional or server id, when present.
    pub message_id: Option<MessageId>,
    /// Provisional id echoed back by the server for reconciliation.
    pub client_id: Option<MessageId>,
    /// Sender id.
    pub sender_id: Option<PartyId>,
    /// Sender type, defaulting to `user`.
    pub sender_type: String,
    /// Sender display name.
    pub sender_name: Option<String>,
    /// Recipient id.
    pub recipient_id: Option<PartyId>,
    /// Recipient type, defaulting to `user`.
    pub recipient_type: String,
    /// Body, defaulting to empty.
    pub content: String,
    /// Kind, defaulting to `text`.
    pub kind: String,
    /// Creation time, defaulting to now.
    pub created_at: Timestamp,
    /// Read time, when known.
    pub read_at: Option<Timestamp>,
    /// Conversation id as carried by the payload (informational).
    pub conversation_id: Option<String>,
}

impl MessageDraft {
    /// Sender reference, if the id is present and the type valid.
    #[must_use]
    pub fn sender(&self) -> Option<PartyRef> {
        let kind = self.sender_type.parse().ok()?;
        Some(PartyRef::new(self.sender_id.clone()?, kind))
    }

    /// Recipient reference, if the id is present and the type valid.
    #[must_use]
    pub fn recipient(&self) -> Option<PartyRef> {
        let kind = self.recipient_type.parse().ok()?;
        Some(PartyRef::new(self.recipient_id.clone()?, kind))
    }

    /// Validate and convert into a [`Message`].
    ///
    /// The conversation id is always derived from the sender and
    /// recipient; a payload-supplied one is ignored. A draft without a
    /// message id gets a provisional one.
    ///
    /// # Errors
    ///
    /// Returns every [`Violation`] found by [`validate`].
    pub fn into_message(self) -> Result<Message, Violations> {
        let violations = validate(&self);
        let (Some(sender), Some(recipient), Ok(kind)) = (
            self.sender(),
            self.recipient(),
            self.kind.parse::<MessageKind>(),
        ) else {
            return Err(Violations(violations));
        };
        if !violations.is_empty() {
            return Err(Violations(violations));
        }

        Ok(Message {
            id: self
                .message_id
                .or(self.client_id)
                .unwrap_or_else(MessageId::provisional),
            conversation_id: ConversationId::between(&sender, &recipient),
            sender,
            sender_name: self.sender_name,
            recipient,
            content: self.content,
            kind,
            created_at: self.created_at,
            read_at: self.read_at,
        })
    }

    /// Canonical snake_case wire object for `send_message`.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        if let Some(id) = &self.message_id {
            obj.insert("message_id".into(), Value::from(id.to_string()));
        }
        if let Some(id) = &self.client_id {
            obj.insert("client_id".into(), Value::from(id.to_string()));
        }
        if let Some(id) = &self.sender_id {
            obj.insert("sender_id".into(), Value::from(id.as_str()));
        }
        obj.insert("sender_type".into(), Value::from(self.sender_type.as_str()));
        if let Some(name) = &self.sender_name {
            obj.insert("sender_name".into(), Value::from(name.as_str()));
        }
        if let Some(id) = &self.recipient_id {
            obj.insert("recipient_id".into(), Value::from(id.as_str()));
        }
        obj.insert(
            "recipient_type".into(),
            Value::from(self.recipient_type.as_str()),
        );
        obj.insert("content".into(), Value::from(self.content.as_str()));
        obj.insert("message_type".into(), Value::from(self.kind.as_str()));
        obj.insert("timestamp".into(), Value::from(self.created_at.as_millis()));
        if let Some(read_at) = self.read_at {
            obj.insert("read_at".into(), Value::from(read_at.as_millis()));
        }
        if let Some(conv) = &self.conversation_id {
            obj.insert("conversation_id".into(), Value::from(conv.as_str()));
        }
        Value::Object(obj)
    }
}

const MESSAGE_ID_KEYS: &[&str] = &["message_id", "messageId", "id"];
const CLIENT_ID_KEYS: &[&str] = &["client_id", "clientId"];
const SENDER_ID_KEYS: &[&str] = &["sender_id", "senderId"];
const SENDER_TYPE_KEYS: &[&str] = &["sender_type", "senderType"];
const SENDER_NAME_KEYS: &[&str] = &["sender_name", "senderName"];
const RECIPIENT_ID_KEYS: &[&str] = &["recipient_id", "recipientId", "receiver_id", "receiverId"];
const RECIPIENT_TYPE_KEYS: &[&str] = &[
    "recipient_type",
    "recipientType",
    "receiver_type",
    "receiverType",
];
const CONTENT_KEYS: &[&str] = &["content", "message", "text"];
const KIND_KEYS: &[&str] = &["message_type", "messageType", "type"];
const CREATED_AT_KEYS: &[&str] = &["timestamp", "created_at", "createdAt"];
const READ_AT_KEYS: &[&str] = &["read_at", "readAt"];
const IS_READ_KEYS: &[&str] = &["is_read", "isRead", "read"];
const CONVERSATION_KEYS: &[&str] = &["conversation_id", "conversationId", "room_id", "roomId"];

/// First non-null value among `keys`.
fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// String or number rendered as a trimmed string; blanks are absent.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0" && s != "false",
        _ => false,
    }
}

/// Fold any historical payload shape into a [`MessageDraft`].
///
/// Never fails. Non-object input yields a draft with every required field
/// missing, which [`validate`] then reports.
#[must_use]
pub fn normalize(raw: &Value) -> MessageDraft {
    let empty = Map::new();
    let obj = raw.as_object().unwrap_or(&empty);

    let created_at = first(obj, CREATED_AT_KEYS)
        .and_then(Timestamp::from_value)
        .unwrap_or_else(Timestamp::now);
    let read_at = first(obj, READ_AT_KEYS)
        .and_then(Timestamp::from_value)
        .or_else(|| {
            first(obj, IS_READ_KEYS)
                .filter(|v| truthy(v))
                .map(|_| created_at)
        });

    MessageDraft {
        message_id: first(obj, MESSAGE_ID_KEYS)
            .and_then(scalar_string)
            .map(|s| MessageId::parse(&s)),
        client_id: first(obj, CLIENT_ID_KEYS)
            .and_then(scalar_string)
            .map(|s| MessageId::parse(&s)),
        sender_id: first(obj, SENDER_ID_KEYS).and_then(PartyId::from_value),
        sender_type: first(obj, SENDER_TYPE_KEYS)
            .and_then(scalar_string)
            .unwrap_or_else(|| PartyType::User.as_str().to_string()),
        sender_name: first(obj, SENDER_NAME_KEYS).and_then(scalar_string),
        recipient_id: first(obj, RECIPIENT_ID_KEYS).and_then(PartyId::from_value),
        recipient_type: first(obj, RECIPIENT_TYPE_KEYS)
            .and_then(scalar_string)
            .unwrap_or_else(|| PartyType::User.as_str().to_string()),
        content: first(obj, CONTENT_KEYS)
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_default(),
        kind: first(obj, KIND_KEYS)
            .and_then(scalar_string)
            .unwrap_or_else(|| MessageKind::Text.as_str().to_string()),
        created_at,
        read_at,
        conversation_id: first(obj, CONVERSATION_KEYS).and_then(scalar_string),
    }
}

/// Report every constraint `draft` violates. Empty means valid.
#[must_use]
pub fn validate(draft: &MessageDraft) -> Vec<Violation> {
    let mut violations = Vec::new();

    if draft.sender_id.as_ref().is_none_or(PartyId::is_empty) {
        violations.push(Violation::MissingSender);
    }
    if draft.recipient_id.as_ref().is_none_or(PartyId::is_empty) {
        violations.push(Violation::MissingRecipient);
    }
    if draft.content.trim().is_empty() {
        violations.push(Violation::EmptyContent);
    } else if draft.content.len() > MAX_CONTENT_SIZE {
        violations.push(Violation::ContentTooLarge {
            size: draft.content.len(),
            max: MAX_CONTENT_SIZE,
        });
    }
    if draft.sender_type.parse::<PartyType>().is_err() {
        violations.push(Violation::InvalidSenderType(draft.sender_type.clone()));
    }
    if draft.recipient_type.parse::<PartyType>().is_err() {
        violations.push(Violation::InvalidRecipientType(
            draft.recipient_type.clone(),
        ));
    }
    if draft.kind.parse::<MessageKind>().is_err() {
        violations.push(Violation::InvalidKind(draft.kind.clone()));
    }

    violations
}

/// Options for [`build_outgoing`].
#[derive(Debug, Clone, Default)]
pub struct OutgoingOptions {
    /// Body kind.
    pub kind: MessageKind,
}

/// Build an outgoing draft addressed to `recipient`, sent as the first
/// party in `precedence` that `source` has a profile id for.
///
/// The draft carries a fresh provisional id both as `message_id` and as
/// `client_id`. Content is not checked here; run [`validate`] before
/// sending.
///
/// # Errors
///
/// Returns [`CodecError::NoLocalParty`] if no signed-in party resolves.
pub fn build_outgoing(
    source: &impl ProfileSource,
    precedence: &[PartyType],
    recipient: &PartyRef,
    content: &str,
    opts: &OutgoingOptions,
) -> Result<MessageDraft, CodecError> {
    let local = resolve_local_party(source, precedence).ok_or(CodecError::NoLocalParty)?;
    let id = MessageId::provisional();

    Ok(MessageDraft {
        message_id: Some(id.clone()),
        client_id: Some(id),
        conversation_id: Some(ConversationId::between(&local.party, recipient).to_string()),
        sender_id: Some(local.party.id),
        sender_type: local.party.kind.as_str().to_string(),
        sender_name: Some(local.name),
        recipient_id: Some(recipient.id.clone()),
        recipient_type: recipient.kind.as_str().to_string(),
        content: content.to_string(),
        kind: opts.kind.as_str().to_string(),
        created_at: Timestamp::now(),
        read_at: None,
    })
}

/// Encode a client event as a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if serialization fails.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decode a client event from a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] for malformed or unknown events.
pub fn decode_client(frame: &str) -> Result<ClientEvent, CodecError> {
    serde_json::from_str(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encode a server event as a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if serialization fails.
pub fn encode_server(event: &ServerEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decode a server event from a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] for malformed or unknown events.
pub fn decode_server(frame: &str) -> Result<ServerEvent, CodecError> {
    serde_json::from_str(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}
