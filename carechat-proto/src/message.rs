//! Canonical chat message model.
//!
//! Every message the client renders, whether built locally or received
//! from the server, ends up as a [`Message`]. Raw payloads get here through
//! [`crate::codec::normalize`] followed by
//! [`crate::codec::MessageDraft::into_message`].

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::conversation::ConversationId;
use crate::party::PartyRef;

/// Maximum allowed content size in bytes (64 KB).
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Prefix that marks a client-generated message id.
pub const PROVISIONAL_PREFIX: &str = "tmp-";

/// Kind of message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image reference.
    Image,
    /// File reference.
    File,
    /// Server-generated notice.
    System,
}

impl MessageKind {
    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message kind string outside `text | image | file | system`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message kind '{0}'")]
pub struct UnknownMessageKind(pub String);

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "system" => Ok(Self::System),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

/// Message identifier.
///
/// Locally built messages carry a provisional UUID v7 until the server
/// confirms them and assigns its own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Client-generated, rendered as `tmp-<uuid>`.
    Provisional(Uuid),
    /// Authoritative id assigned by the server.
    Assigned(String),
}

impl MessageId {
    /// Generate a fresh provisional id.
    #[must_use]
    pub fn provisional() -> Self {
        Self::Provisional(Uuid::now_v7())
    }

    /// Interpret an id string; `tmp-<uuid>` is provisional, anything else
    /// is a server id.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        s.strip_prefix(PROVISIONAL_PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map_or_else(|| Self::Assigned(s.to_string()), Self::Provisional)
    }

    /// Whether this id still awaits server confirmation.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(uuid) => write!(f, "{PROVISIONAL_PREFIX}{uuid}"),
            Self::Assigned(id) => f.write_str(id),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(s) => Self::parse(&s),
            Repr::Number(n) => Self::Assigned(n.to_string()),
        })
    }
}

/// Unix timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

/// Epoch values below this are taken to be seconds rather than millis.
const SECONDS_THRESHOLD: u64 = 100_000_000_000;

impl Timestamp {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self(millis)
    }

    /// Create a timestamp from milliseconds since the Unix epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Parse a timestamp the way the various backends have sent them.
    ///
    /// Numbers are epoch millis (or seconds when small enough to clearly
    /// be seconds). Strings may be digits, RFC 3339, or
    /// `YYYY-MM-DD HH:MM:SS[.fff]` / `YYYY-MM-DDTHH:MM:SS[.fff]` in UTC.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(v) => Some(Self::from_epoch(v)),
                None => n
                    .as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| Self(float_to_millis(f))),
            },
            serde_json::Value::String(s) => Self::parse_str(s),
            _ => None,
        }
    }

    fn from_epoch(value: u64) -> Self {
        if value < SECONDS_THRESHOLD {
            Self(value.saturating_mul(1000))
        } else {
            Self(value)
        }
    }

    fn parse_str(s: &str) -> Option<Self> {
        let s = s.trim();
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse().ok().map(Self::from_epoch);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return u64::try_from(dt.timestamp_millis()).ok().map(Self);
        }
        ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .and_then(|naive| u64::try_from(naive.and_utc().timestamp_millis()).ok())
            .map(Self)
    }

    /// Render in local time with a chrono format string.
    #[must_use]
    pub fn format(self, fmt: &str) -> String {
        i64::try_from(self.0)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.with_timezone(&chrono::Local).format(fmt).to_string())
            .unwrap_or_default()
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    reason = "caller filters to finite non-negative values"
)]
fn float_to_millis(f: f64) -> u64 {
    if f < SECONDS_THRESHOLD as f64 {
        (f * 1000.0) as u64
    } else {
        f as u64
    }
}

/// Delivery state of a message held by a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Rendered optimistically, awaiting server confirmation.
    Pending,
    /// Server confirmed receipt and assigned an id.
    Sent,
    /// Recipient reported the message as read.
    Read,
    /// Sending failed, with a reason.
    Failed(String),
}

impl MessageStatus {
    /// Short label for display.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Pending => "sending",
            Self::Sent => "sent",
            Self::Read => "read",
            Self::Failed(_) => "failed",
        }
    }
}

/// A validated chat message.
///
/// Only `read_at` and a provisional `id` may change after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Provisional or server-assigned id.
    pub id: MessageId,
    /// Author.
    pub sender: PartyRef,
    /// Author display name, when the payload carried one.
    pub sender_name: Option<String>,
    /// Addressee.
    pub recipient: PartyRef,
    /// Body; never empty.
    pub content: String,
    /// Body kind.
    pub kind: MessageKind,
    /// Creation time.
    pub created_at: Timestamp,
    /// Time the recipient read it, if known.
    pub read_at: Option<Timestamp>,
    /// Always `ConversationId::between(sender, recipient)`.
    pub conversation_id: ConversationId,
}

impl Message {
    /// Whether `party` wrote this message.
    #[must_use]
    pub fn is_from(&self, party: &PartyRef) -> bool {
        &self.sender == party
    }

    /// Whether this message is addressed to `party`.
    #[must_use]
    pub fn is_addressed_to(&self, party: &PartyRef) -> bool {
        &self.recipient == party
    }

    /// Record the read time. Later calls keep the first value.
    pub fn mark_read(&mut self, at: Timestamp) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        true
    }

    /// Replace a provisional id with the server's. No-op once assigned.
    pub fn reconcile_id(&mut self, id: MessageId) -> bool {
        if !self.id.is_provisional() || id.is_provisional() {
            return false;
        }
        self.id = id;
        true
    }

    /// Canonical snake_case wire object.
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "message_id": self.id.to_string(),
            "sender_id": self.sender.id.as_str(),
            "sender_type": self.sender.kind.as_str(),
            "recipient_id": self.recipient.id.as_str(),
            "recipient_type": self.recipient.kind.as_str(),
            "content": self.content,
            "message_type": self.kind.as_str(),
            "timestamp": self.created_at.as_millis(),
            "conversation_id": self.conversation_id.as_str(),
        });
        if let Some(name) = &self.sender_name {
            obj["sender_name"] = serde_json::Value::from(name.as_str());
        }
        if let Some(read_at) = self.read_at {
            obj["read_at"] = serde_json::Value::from(read_at.as_millis());
        }
        obj
    }
}
