//! Deterministic conversation identifiers.
//!
//! A conversation between two parties is keyed by
//! `<typeA>_<idA>_<typeB>_<idB>` where `(typeA, idA) <= (typeB, idB)`, so
//! both ends derive the same key no matter who opens the chat. The same
//! string doubles as the socket room name for the conversation.
//!
//! `_` separates the four fields, so inside an id it is written `%5F` (and
//! `%` as `%25`). Plain numeric ids are unaffected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::party::{PartyRef, PartyType};

/// Errors from parsing a conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationIdError {
    /// The string does not start with a known party type.
    #[error("conversation id '{0}' does not start with a party type")]
    MissingType(String),
    /// The string does not have exactly four non-empty fields.
    #[error("conversation id '{0}' does not name two parties")]
    MissingSecondParty(String),
    /// An id contains a `%` that is not `%5F` or `%25`.
    #[error("conversation id '{0}' has a malformed escape")]
    BadEscape(String),
}

/// Key identifying a two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Derive the identifier for a conversation between `a` and `b`.
    ///
    /// Commutative: `between(a, b) == between(b, a)`.
    #[must_use]
    pub fn between(a: &PartyRef, b: &PartyRef) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{}_{}_{}_{}",
            first.kind,
            escape(first.id.as_str()),
            second.kind,
            escape(second.id.as_str())
        ))
    }

    /// Wrap a string received from elsewhere without checking it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// String form, also used as the room name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the two parties, in stored (sorted) order.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationIdError`] when the string is not of the form
    /// `<type>_<id>_<type>_<id>`.
    pub fn parties(&self) -> Result<(PartyRef, PartyRef), ConversationIdError> {
        let s = self.0.as_str();
        let mut fields = s.split('_');
        let first_kind = fields
            .next()
            .and_then(|f| f.parse::<PartyType>().ok())
            .ok_or_else(|| ConversationIdError::MissingType(s.to_string()))?;
        let missing = || ConversationIdError::MissingSecondParty(s.to_string());
        let (Some(first_id), Some(second_kind), Some(second_id), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(missing());
        };
        let second_kind = second_kind.parse::<PartyType>().map_err(|_| missing())?;
        if first_id.is_empty() || second_id.is_empty() {
            return Err(missing());
        }

        let bad = || ConversationIdError::BadEscape(s.to_string());
        Ok((
            PartyRef::new(unescape(first_id).ok_or_else(bad)?, first_kind),
            PartyRef::new(unescape(second_id).ok_or_else(bad)?, second_kind),
        ))
    }

    /// Whether `party` is one of the two ends of this conversation.
    #[must_use]
    pub fn involves(&self, party: &PartyRef) -> bool {
        self.parties()
            .is_ok_and(|(a, b)| &a == party || &b == party)
    }

    /// The other end of the conversation as seen from `local`.
    #[must_use]
    pub fn counterpart(&self, local: &PartyRef) -> Option<PartyRef> {
        let (a, b) = self.parties().ok()?;
        if &a == local {
            Some(b)
        } else if &b == local {
            Some(a)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConversationId {
    type Err = ConversationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.to_string());
        id.parties()?;
        Ok(id)
    }
}

fn escape(id: &str) -> String {
    id.replace('%', "%25").replace('_', "%5F")
}

fn unescape(field: &str) -> Option<String> {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        match rest.get(at + 1..at + 3)? {
            "5F" | "5f" => out.push('_'),
            "25" => out.push('%'),
            _ => return None,
        }
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Some(out)
}
