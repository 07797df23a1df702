//! Property tests for the message codec.
//!
//! Verifies:
//! 1. `normalize` and `validate` never panic on arbitrary JSON.
//! 2. Drafts missing content always report an empty-content violation.
//! 3. Any outgoing draft with non-blank content validates cleanly after a
//!    trip through its wire form.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;

use proptest::prelude::*;
use serde_json::{Value, json};
use carechat_proto::codec::{self, OutgoingOptions, Violation};
use carechat_proto::identity::{DEFAULT_PRECEDENCE, Profile, ProfileSource};
use carechat_proto::message::MessageKind;
use carechat_proto::party::{PartyRef, PartyType};

struct Cached(HashMap<PartyType, Profile>);

impl ProfileSource for Cached {
    fn profile(&self, kind: PartyType) -> Option<Profile> {
        self.0.get(&kind).cloned()
    }
}

/// Strategy for arbitrary JSON values, a few levels deep.
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<f64>().prop_map(|f| serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)),
        "\\PC{0,20}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::hash_map(
                prop_oneof![
                    Just("sender_id".to_string()),
                    Just("senderId".to_string()),
                    Just("recipient_id".to_string()),
                    Just("receiver_id".to_string()),
                    Just("content".to_string()),
                    Just("timestamp".to_string()),
                    Just("type".to_string()),
                    Just("is_read".to_string()),
                    "[a-z_]{1,10}",
                ],
                inner,
                0..6
            )
            .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Text),
        Just(MessageKind::Image),
        Just(MessageKind::File),
        Just(MessageKind::System),
    ]
}

proptest! {
    #[test]
    fn normalize_is_total(raw in arb_json()) {
        let draft = codec::normalize(&raw);
        let _ = codec::validate(&draft);
        let _ = draft.into_message();
    }

    #[test]
    fn missing_content_is_reported(sender in 1u32.., recipient in 1u32..) {
        let draft = codec::normalize(&json!({"sender_id": sender, "recipient_id": recipient}));
        prop_assert!(codec::validate(&draft).contains(&Violation::EmptyContent));
    }

    #[test]
    fn outgoing_wire_form_validates(
        local_id in 1u32..,
        recipient_id in 1u32..,
        content in "[a-zA-Z0-9 ]{0,40}[a-zA-Z0-9]",
        kind in arb_kind(),
    ) {
        let mut profiles = HashMap::new();
        profiles.insert(
            PartyType::Caregiver,
            Profile::from_record(&json!({"id": local_id}), Some("tok".into())),
        );
        let recipient = PartyRef::new(recipient_id.to_string(), PartyType::User);
        let draft = codec::build_outgoing(
            &Cached(profiles),
            &DEFAULT_PRECEDENCE,
            &recipient,
            &content,
            &OutgoingOptions { kind },
        )
        .unwrap();

        let again = codec::normalize(&draft.to_wire());
        prop_assert!(codec::validate(&again).is_empty());
        let message = again.into_message().unwrap();
        prop_assert_eq!(message.kind, kind);
        prop_assert_eq!(message.content, content);
    }
}
