//! Property tests for conversation identifiers and contact resolution.
//!
//! Verifies:
//! 1. `ConversationId::between` is commutative.
//! 2. `parties()` recovers the pair that generated the id.
//! 3. Composite contact tokens resolve back to the party they name.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use carechat_proto::contact::ContactResolver;
use carechat_proto::conversation::ConversationId;
use carechat_proto::party::{PartyRef, PartyType};

/// Strategy for generating arbitrary `PartyType` values.
fn arb_party_type() -> impl Strategy<Value = PartyType> {
    prop_oneof![
        Just(PartyType::User),
        Just(PartyType::Caregiver),
        Just(PartyType::Admin),
    ]
}

/// Strategy for ids: mostly numeric, sometimes opaque strings that may
/// contain separators, escapes, or type names.
fn arb_id() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => any::<u32>().prop_map(|n| n.to_string()),
        2 => "[a-z0-9_%-]{1,12}",
        1 => Just("x_user_y".to_string()),
        1 => Just("42_caregiver_7".to_string()),
    ]
}

/// Strategy for generating arbitrary `PartyRef` values.
fn arb_party() -> impl Strategy<Value = PartyRef> {
    (arb_id(), arb_party_type()).prop_map(|(id, kind)| PartyRef::new(id, kind))
}

proptest! {
    #[test]
    fn conversation_id_is_commutative(a in arb_party(), b in arb_party()) {
        prop_assert_eq!(ConversationId::between(&a, &b), ConversationId::between(&b, &a));
    }

    #[test]
    fn parse_recovers_unordered_pair(a in arb_party(), b in arb_party()) {
        let id = ConversationId::between(&a, &b);
        let (x, y) = id.parties().unwrap();
        prop_assert!((x == a && y == b) || (x == b && y == a));
        prop_assert!(x <= y);
    }

    #[test]
    fn parsed_id_regenerates_itself(a in arb_party(), b in arb_party()) {
        let id = ConversationId::between(&a, &b);
        let (x, y) = id.parties().unwrap();
        prop_assert_eq!(ConversationId::between(&x, &y), id);
    }

    #[test]
    fn composite_token_resolves_to_same_party(p in arb_party(), explicit in proptest::option::of(arb_party_type())) {
        let resolver = ContactResolver::default();
        let token = ContactResolver::token(&p);
        prop_assert_eq!(resolver.resolve(&token, explicit).unwrap(), p);
    }

    #[test]
    fn resolution_is_total(token in "\\PC{1,40}") {
        let resolver = ContactResolver::default();
        if !token.trim().is_empty() {
            prop_assert!(resolver.resolve(&token, None).is_ok());
        }
    }
}
