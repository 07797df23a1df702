//! Contact/room resolver: maps human-facing contact tokens to party
//! references and socket room names.
//!
//! Accepted tokens:
//! - `"<type>_<id>"` composites such as `"caregiver_42"`,
//! - bare numeric ids such as `"42"` (typed by the caller, else the
//!   configured default, `caregiver`),
//! - anything else, kept verbatim as an opaque id with the caller's type
//!   or the fallback type (`user`).

use serde_json::Value;

use crate::conversation::ConversationId;
use crate::party::{PartyId, PartyRef, PartyType};

/// Errors from contact resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContactError {
    /// The token is empty or whitespace.
    #[error("contact reference is blank")]
    Blank,
    /// A contact record carried none of the recognised fields.
    #[error("contact record has no id: {0}")]
    NoId(String),
}

/// Pure token → party mapping with explicit defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactResolver {
    bare_id_type: PartyType,
    fallback_type: PartyType,
}

impl Default for ContactResolver {
    fn default() -> Self {
        Self::new(PartyType::Caregiver, PartyType::User)
    }
}

impl ContactResolver {
    /// Create a resolver.
    ///
    /// `bare_id_type` types bare numeric ids; `fallback_type` types
    /// unrecognised tokens. Both only apply when the call site gives no
    /// explicit type.
    #[must_use]
    pub const fn new(bare_id_type: PartyType, fallback_type: PartyType) -> Self {
        Self {
            bare_id_type,
            fallback_type,
        }
    }

    /// Resolve a contact token.
    ///
    /// A composite token's own type wins over `explicit`.
    ///
    /// # Errors
    ///
    /// Returns [`ContactError::Blank`] for an empty token.
    pub fn resolve(
        &self,
        token: &str,
        explicit: Option<PartyType>,
    ) -> Result<PartyRef, ContactError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ContactError::Blank);
        }

        if let Some(party) = split_composite(token) {
            return Ok(party);
        }

        let kind = if token.bytes().all(|b| b.is_ascii_digit()) {
            explicit.unwrap_or(self.bare_id_type)
        } else {
            explicit.unwrap_or(self.fallback_type)
        };
        Ok(PartyRef::new(token, kind))
    }

    /// Resolve a contact given as a JSON record.
    ///
    /// Tries `{id, type}` first, then a `contactId`/`contact_id` token,
    /// then a bare `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ContactError::NoId`] if the record carries no usable id.
    pub fn resolve_record(&self, record: &Value) -> Result<PartyRef, ContactError> {
        let explicit = ["type", "contact_type", "contactType"]
            .iter()
            .filter_map(|k| record.get(*k).and_then(Value::as_str))
            .find_map(|s| s.parse::<PartyType>().ok());

        if let Some(kind) = explicit
            && let Some(id) = record.get("id").and_then(PartyId::from_value)
        {
            return Ok(PartyRef::new(id, kind));
        }

        let token = ["contactId", "contact_id", "id"]
            .iter()
            .find_map(|k| record.get(*k).and_then(PartyId::from_value))
            .ok_or_else(|| ContactError::NoId(record.to_string()))?;
        self.resolve(token.as_str(), explicit)
    }

    /// Token form of a party; the inverse of [`resolve`](Self::resolve)
    /// for composites.
    #[must_use]
    pub fn token(party: &PartyRef) -> String {
        party.to_string()
    }

    /// Personal room of a party.
    #[must_use]
    pub fn personal_room(party: &PartyRef) -> String {
        party.room()
    }

    /// Room shared by the two ends of a conversation.
    #[must_use]
    pub fn conversation_room(local: &PartyRef, contact: &PartyRef) -> String {
        ConversationId::between(local, contact).to_string()
    }
}

fn split_composite(token: &str) -> Option<PartyRef> {
    PartyType::ALL.into_iter().find_map(|kind| {
        let id = token.strip_prefix(kind.as_str())?.strip_prefix('_')?;
        (!id.trim().is_empty()).then(|| PartyRef::new(id, kind))
    })
}
