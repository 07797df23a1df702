//! Socket event contract between chat clients and the chat server.
//!
//! Every frame is a JSON text frame `{"event": "<name>", "data": ...}`.
//! Message payloads stay as raw JSON so that every historical field
//! spelling reaches [`crate::codec::normalize`] intact.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::ConversationId;
use crate::message::Timestamp;
use crate::party::PartyRef;

/// Events a client emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Handshake sent right after the socket opens.
    Authenticate {
        /// The signed-in party.
        party: PartyRef,
        /// Bearer credential from local storage.
        credential: String,
    },
    /// Subscribe to a room.
    Join {
        /// Room name.
        room: String,
    },
    /// Unsubscribe from a room.
    Leave {
        /// Room name.
        room: String,
    },
    /// Send a chat message (canonical wire object).
    SendMessage(Value),
    /// The local party started typing to `contact`.
    Typing {
        /// Who is being typed to.
        contact: PartyRef,
    },
    /// The local party stopped typing to `contact`.
    StopTyping {
        /// Who was being typed to.
        contact: PartyRef,
    },
    /// The local party has read everything `contact` sent in a conversation.
    MarkRead {
        /// Author of the messages that were read.
        contact: PartyRef,
        /// Conversation the messages belong to.
        conversation_id: ConversationId,
    },
}

/// Events the server pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake accepted.
    Authenticated {
        /// The party the connection is now bound to.
        party: PartyRef,
    },
    /// Handshake rejected; the socket stays open.
    AuthError {
        /// Human-readable reason.
        reason: String,
    },
    /// A message addressed to this client (raw payload).
    #[serde(alias = "message_received")]
    NewMessage(Value),
    /// Confirmation of a message this client sent (raw payload, carries
    /// `client_id`).
    MessageSent(Value),
    /// A remote party started typing.
    #[serde(alias = "typing")]
    UserTyping {
        /// Who is typing.
        party: PartyRef,
    },
    /// A remote party stopped typing.
    #[serde(alias = "stop_typing")]
    UserStoppedTyping {
        /// Who stopped.
        party: PartyRef,
    },
    /// A remote party read messages in a conversation.
    MessageRead {
        /// Who read them.
        reader: PartyRef,
        /// Which conversation.
        conversation_id: ConversationId,
        /// When, if the server says.
        #[serde(default)]
        read_at: Option<Timestamp>,
    },
    /// A party came online.
    UserOnline {
        /// The party.
        party: PartyRef,
    },
    /// A party went offline.
    UserOffline {
        /// The party.
        party: PartyRef,
    },
    /// Room subscription confirmed.
    JoinedRoom {
        /// Room name.
        room: String,
    },
    /// Request-level error (validation, not authenticated, ...).
    Error {
        /// Human-readable message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::party::PartyType;

    #[test]
    fn authenticate_frame_shape() {
        let event = ClientEvent::Authenticate {
            party: PartyRef::new("7", PartyType::User),
            credential: "tok".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "authenticate",
                "data": {"party": {"id": "7", "type": "user"}, "credential": "tok"}
            })
        );
    }

    #[test]
    fn stopped_typing_aliases() {
        for name in ["user_stopped_typing", "stop_typing"] {
            let value = json!({"event": name, "data": {"party": {"id": 1, "type": "admin"}}});
            let event: ServerEvent = serde_json::from_value(value).unwrap();
            assert_eq!(
                event,
                ServerEvent::UserStoppedTyping {
                    party: PartyRef::new("1", PartyType::Admin)
                }
            );
        }
    }

    #[test]
    fn message_read_without_time() {
        let value = json!({
            "event": "message_read",
            "data": {
                "reader": {"id": 42, "type": "caregiver"},
                "conversation_id": "caregiver_42_user_7"
            }
        });
        let event: ServerEvent = serde_json::from_value(value).unwrap();
        assert!(matches!(event, ServerEvent::MessageRead { read_at: None, .. }));
    }
}
