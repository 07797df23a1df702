//! Resolution of the signed-in ("local") party from cached profile data.
//!
//! A browser session may hold a profile for more than one account type at
//! once. The local party is the first type in a configured precedence list
//! whose profile carries an id.

use serde_json::Value;

use crate::party::{PartyId, PartyRef, PartyType};

/// Default precedence: user, then caregiver, then admin.
pub const DEFAULT_PRECEDENCE: [PartyType; 3] =
    [PartyType::User, PartyType::Caregiver, PartyType::Admin];

/// Display name used when a profile has none.
pub const FALLBACK_NAME: &str = "User";

/// Cached profile for one account type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    /// Account id, if the profile record carries one.
    pub id: Option<PartyId>,
    /// Display name.
    pub name: Option<String>,
    /// Bearer credential stored alongside the profile.
    pub credential: Option<String>,
}

impl Profile {
    /// Read a profile from a stored JSON record.
    ///
    /// The name falls back through `name`, `username` and `real_name`.
    #[must_use]
    pub fn from_record(record: &Value, credential: Option<String>) -> Self {
        let id = record.get("id").and_then(PartyId::from_value);
        let name = ["name", "username", "real_name"]
            .iter()
            .filter_map(|key| record.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|name| !name.is_empty())
            .map(str::to_string);
        Self {
            id,
            name,
            credential: credential.filter(|c| !c.trim().is_empty()),
        }
    }
}

/// Anything that can hand out cached profiles by account type.
pub trait ProfileSource {
    /// Profile cached for `kind`, if any.
    fn profile(&self, kind: PartyType) -> Option<Profile>;
}

/// The signed-in party as resolved from a [`ProfileSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalParty {
    /// Party reference.
    pub party: PartyRef,
    /// Display name.
    pub name: String,
    /// Bearer credential for the socket handshake and REST calls.
    pub credential: Option<String>,
}

/// Resolve the local party by walking `precedence` in order.
///
/// Returns `None` when no profile in the list carries an id.
pub fn resolve_local_party(
    source: &impl ProfileSource,
    precedence: &[PartyType],
) -> Option<LocalParty> {
    precedence.iter().find_map(|&kind| {
        let profile = source.profile(kind)?;
        let id = profile.id?;
        Some(LocalParty {
            party: PartyRef::new(id, kind),
            name: profile.name.unwrap_or_else(|| FALLBACK_NAME.to_string()),
            credential: profile.credential,
        })
    })
}
