//! REST client for message history, conversation lists and unread counts.
//!
//! Every endpoint answers `{"success": bool, "data": ...}`. Message
//! records go through the same normalization as socket payloads, so any
//! historical field spelling is accepted; records that still fail
//! validation are skipped.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use carechat_proto::codec;
use carechat_proto::contact::ContactResolver;
use carechat_proto::conversation::ConversationId;
use carechat_proto::identity::LocalParty;
use carechat_proto::message::{Message, Timestamp};
use carechat_proto::party::{PartyId, PartyRef, PartyType};

/// Errors from the history API.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The request could not be sent or the body not read.
    #[error("history request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("history API returned status {0}")]
    Status(u16),

    /// The API answered `success: false`.
    #[error("history API error: {0}")]
    Api(String),

    /// The body was not the expected JSON.
    #[error("malformed history response: {0}")]
    Decode(String),
}

/// Paging window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum records.
    pub limit: usize,
    /// Records to skip from the most recent.
    pub offset: usize,
}

impl Page {
    /// The first `limit` records.
    #[must_use]
    pub const fn first(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// Conversation id.
    pub conversation_id: ConversationId,
    /// The other party.
    pub contact: PartyRef,
    /// Display name of the other party, if sent.
    pub contact_name: Option<String>,
    /// Preview of the last message.
    pub last_message: Option<String>,
    /// When the last message was sent.
    pub last_time: Option<Timestamp>,
    /// Unread messages for the local party.
    pub unread: u64,
}

/// Read side of the chat backend.
pub trait HistoryApi: Send + Sync + 'static {
    /// Messages between `local` and `contact`, most recent first.
    fn fetch_messages(
        &self,
        local: &LocalParty,
        contact: &PartyRef,
        page: Page,
    ) -> impl Future<Output = Result<Vec<Message>, HistoryError>> + Send;

    /// Conversations the local party takes part in.
    fn fetch_conversations(
        &self,
        local: &LocalParty,
        page: Page,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, HistoryError>> + Send;

    /// Total unread messages for the local party.
    fn fetch_unread_count(
        &self,
        local: &LocalParty,
    ) -> impl Future<Output = Result<u64, HistoryError>> + Send;
}

/// [`HistoryApi`] over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct RestHistoryClient {
    client: reqwest::Client,
    base_url: String,
    resolver: ContactResolver,
}

impl RestHistoryClient {
    /// Create a client for the API at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Http`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        resolver: ContactResolver,
        timeout: Duration,
    ) -> Result<Self, HistoryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            resolver,
        })
    }

    /// The API base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_data(
        &self,
        path: &str,
        local: &LocalParty,
        query: &[(&str, String)],
    ) -> Result<Value, HistoryError> {
        let mut request = self
            .client
            .get(format!("{}{path}", self.base_url))
            .query(query);
        if let Some(token) = &local.credential {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        tracing::debug!(status = %status, path, "history API response");
        if !status.is_success() {
            return Err(HistoryError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let body: Value =
            serde_json::from_str(&body).map_err(|e| HistoryError::Decode(e.to_string()))?;
        unwrap_envelope(body)
    }
}

impl HistoryApi for RestHistoryClient {
    async fn fetch_messages(
        &self,
        local: &LocalParty,
        contact: &PartyRef,
        page: Page,
    ) -> Result<Vec<Message>, HistoryError> {
        let query = [
            ("user_id", local.party.id.to_string()),
            ("user_type", local.party.kind.to_string()),
            ("contact_id", contact.id.to_string()),
            ("contact_type", contact.kind.to_string()),
            ("limit", page.limit.to_string()),
            ("offset", page.offset.to_string()),
        ];
        let data = self.get_data("/api/chat/messages", local, &query).await?;
        let records = list_field(data, "messages")?;

        let mut messages = Vec::with_capacity(records.len());
        for record in &records {
            match codec::normalize(record).into_message() {
                Ok(message) => messages.push(message),
                Err(violations) => {
                    tracing::warn!(reason = %violations, "skipping invalid history record");
                }
            }
        }
        tracing::debug!(
            contact = %contact,
            fetched = records.len(),
            kept = messages.len(),
            "history page fetched"
        );
        Ok(messages)
    }

    async fn fetch_conversations(
        &self,
        local: &LocalParty,
        page: Page,
    ) -> Result<Vec<ConversationSummary>, HistoryError> {
        let query = [
            ("user_id", local.party.id.to_string()),
            ("user_type", local.party.kind.to_string()),
            ("limit", page.limit.to_string()),
            ("offset", page.offset.to_string()),
        ];
        let data = self
            .get_data("/api/chat/conversations", local, &query)
            .await?;
        let records = list_field(data, "conversations")?;
        Ok(records
            .iter()
            .filter_map(|record| {
                let summary = summarize(record, &local.party, &self.resolver);
                if summary.is_none() {
                    tracing::warn!(%record, "skipping conversation without a contact");
                }
                summary
            })
            .collect())
    }

    async fn fetch_unread_count(&self, local: &LocalParty) -> Result<u64, HistoryError> {
        let query = [
            ("user_id", local.party.id.to_string()),
            ("user_type", local.party.kind.to_string()),
        ];
        let data = self
            .get_data("/api/chat/unread-count", local, &query)
            .await?;
        data.get("unread_count")
            .and_then(as_count)
            .ok_or_else(|| HistoryError::Decode(format!("no unread_count in {data}")))
    }
}

fn unwrap_envelope(body: Value) -> Result<Value, HistoryError> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        return Err(HistoryError::Api(message.to_string()));
    }
    match body {
        Value::Object(mut obj) => Ok(obj.remove("data").unwrap_or(Value::Null)),
        other => Err(HistoryError::Decode(format!("expected an object, got {other}"))),
    }
}

/// `data` is either the list itself or an object holding it under `key`.
fn list_field(data: Value, key: &str) -> Result<Vec<Value>, HistoryError> {
    match data {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.remove(key) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(HistoryError::Decode(format!("no '{key}' list in response"))),
        },
        Value::Null => Ok(Vec::new()),
        other => Err(HistoryError::Decode(format!("expected a list, got {other}"))),
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_field(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| record.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn summarize(
    record: &Value,
    local: &PartyRef,
    resolver: &ContactResolver,
) -> Option<ConversationSummary> {
    let contact = record
        .get("conversation_id")
        .and_then(Value::as_str)
        .and_then(|raw| ConversationId::from_raw(raw).counterpart(local))
        .or_else(|| resolver.resolve_record(record).ok().filter(|c| c != local))
        .or_else(|| counterpart_column(record, local))?;

    Some(ConversationSummary {
        conversation_id: ConversationId::between(local, &contact),
        contact,
        contact_name: text_field(record, &["contact_name", "contactName", "name"]),
        last_message: text_field(record, &["last_message_content", "last_message", "lastMessage"]),
        last_time: ["last_message_time", "last_time", "lastTime", "updated_at"]
            .iter()
            .find_map(|k| record.get(*k).and_then(Timestamp::from_value)),
        unread: ["unread_count", "unread", "unreadCount"]
            .iter()
            .find_map(|k| record.get(*k).and_then(as_count))
            .unwrap_or(0),
    })
}

/// Rows keyed by `user_id`/`caregiver_id` columns: the contact is the
/// column that is not the local party's own type.
fn counterpart_column(record: &Value, local: &PartyRef) -> Option<PartyRef> {
    [PartyType::Caregiver, PartyType::User, PartyType::Admin]
        .into_iter()
        .filter(|kind| *kind != local.kind)
        .find_map(|kind| {
            record
                .get(format!("{kind}_id"))
                .and_then(PartyId::from_value)
                .map(|id| PartyRef::new(id, kind))
        })
}
