//! Party references: the `(id, type)` pair naming a user, caregiver, or
//! admin account on either end of a conversation.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The three account kinds that can take part in a chat.
///
/// Variants are declared in lexicographic order of their wire names so the
/// derived `Ord` matches string ordering of the type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyType {
    /// Platform administrator.
    Admin,
    /// Care provider.
    Caregiver,
    /// Care seeker (regular customer account).
    User,
}

impl PartyType {
    /// Every party type, in wire-name order.
    pub const ALL: [Self; 3] = [Self::Admin, Self::Caregiver, Self::User];

    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Caregiver => "caregiver",
            Self::User => "user",
        }
    }
}

impl fmt::Display for PartyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A party type string outside `user | caregiver | admin`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown party type '{0}' (expected user, caregiver or admin)")]
pub struct UnknownPartyType(pub String);

impl FromStr for PartyType {
    type Err = UnknownPartyType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "caregiver" => Ok(Self::Caregiver),
            "user" => Ok(Self::User),
            other => Err(UnknownPartyType(other.to_string())),
        }
    }
}

/// Account identifier.
///
/// The backend hands out numeric ids but older payloads carry them as
/// strings, so ids are kept as trimmed strings and JSON numbers are
/// accepted on input. Ordering is numeric when both ids are all digits,
/// lexicographic otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartyId(String);

impl PartyId {
    /// Create an id from its string form. Surrounding whitespace is dropped.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.len() == id.len() {
            Self(id)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Extract an id from a loosely typed JSON value.
    ///
    /// Strings and numbers are accepted; blank strings, `null`, booleans,
    /// arrays and objects yield `None`.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(Self::new(s.as_str())),
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// String form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value when the id is all ASCII digits.
    #[must_use]
    pub fn as_number(&self) -> Option<u128> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.0.parse().ok()
    }

    /// Whether the id is empty (an unusable reference).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Ord for PartyId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for PartyId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PartyId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<u64> for PartyId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl Serialize for PartyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PartyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(s) => Self::new(s),
            Repr::Unsigned(n) => Self(n.to_string()),
            Repr::Signed(n) => Self(n.to_string()),
        })
    }
}

/// One endpoint of a conversation.
///
/// Serialized as `{"id": "42", "type": "caregiver"}`. Ordering is by
/// `(type, id)`, which is the ordering conversation identifiers use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyRef {
    /// Account identifier.
    pub id: PartyId,
    /// Account kind.
    #[serde(rename = "type")]
    pub kind: PartyType,
}

impl PartyRef {
    /// Build a reference from an id and a type.
    pub fn new(id: impl Into<PartyId>, kind: PartyType) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Name of this party's personal room on the socket server.
    #[must_use]
    pub fn room(&self) -> String {
        format!("{}_{}", self.kind, self.id)
    }
}

impl Ord for PartyRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PartyRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PartyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind, self.id)
    }
}
