// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Presence and typing indicators through the development relay.
//!
//! These tests validate:
//! - Parties coming online and going offline are reported to others
//! - Typing shows on the other side and is cleared by sending
//! - An idle typing indicator is stopped after the quiet period

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use carechat::app::AppContext;
use carechat::chat::ChatEvent;
use carechat::config::ClientConfig;
use carechat::connection::ConnectionState;
use carechat::connection::ws::WsConnector;
use carechat::history::{ConversationSummary, HistoryApi, HistoryError, Page};
use carechat::notify::RecordingSink;
use carechat::storage::LocalStore;
use carechat_proto::identity::LocalParty;
use carechat_proto::message::Message;
use carechat_proto::party::{PartyRef, PartyType};
use carechat_relay::relay;

// =============================================================================
// Helpers
// =============================================================================

struct NoHistory;

impl HistoryApi for NoHistory {
    async fn fetch_messages(
        &self,
        _local: &LocalParty,
        _contact: &PartyRef,
        _page: Page,
    ) -> Result<Vec<Message>, HistoryError> {
        Ok(Vec::new())
    }

    async fn fetch_conversations(
        &self,
        _local: &LocalParty,
        _page: Page,
    ) -> Result<Vec<ConversationSummary>, HistoryError> {
        Ok(Vec::new())
    }

    async fn fetch_unread_count(&self, _local: &LocalParty) -> Result<u64, HistoryError> {
        Ok(0)
    }
}

type Client = AppContext<WsConnector, NoHistory, RecordingSink>;

async fn start_relay() -> String {
    let (addr, _handle) = relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay");
    format!("ws://{addr}/ws")
}

async fn online_client(url: &str, party: &PartyRef) -> (Arc<Client>, mpsc::Receiver<ChatEvent>) {
    let store = LocalStore::in_memory();
    store
        .set_session(party.kind, json!({"id": party.id.as_str()}), "secret")
        .unwrap();
    let mut config = ClientConfig {
        socket_url: url.to_string(),
        ..ClientConfig::default()
    };
    config.chat.typing_timeout = Duration::from_millis(300);

    let (ctx, mut events) = AppContext::new(
        config,
        Arc::new(store),
        WsConnector::new(url).unwrap(),
        NoHistory,
        RecordingSink::default(),
    );
    ctx.start();
    wait_for(&mut events, |e| {
        *e == ChatEvent::Connection(ConnectionState::Authenticated)
    })
    .await;
    (ctx, events)
}

async fn wait_for<F>(rx: &mut mpsc::Receiver<ChatEvent>, pred: F) -> ChatEvent
where
    F: Fn(&ChatEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for chat event")
            .expect("chat event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

fn is_typing_change(e: &ChatEvent) -> bool {
    matches!(e, ChatEvent::TypingChanged { .. })
}

fn ann() -> PartyRef {
    PartyRef::new("7", PartyType::User)
}

fn cara() -> PartyRef {
    PartyRef::new("42", PartyType::Caregiver)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn presence_follows_connections() {
    let url = start_relay().await;
    let (alice, mut alice_rx) = online_client(&url, &ann()).await;
    let (bob, _bob_rx) = online_client(&url, &cara()).await;

    let event = wait_for(&mut alice_rx, |e| {
        matches!(e, ChatEvent::PresenceChanged { .. })
    })
    .await;
    assert_eq!(
        event,
        ChatEvent::PresenceChanged {
            party: cara(),
            online: true
        }
    );
    alice.with_chat(|chat| assert!(chat.is_online(&cara())));

    bob.shutdown();
    let event = wait_for(&mut alice_rx, |e| {
        matches!(e, ChatEvent::PresenceChanged { .. })
    })
    .await;
    assert_eq!(
        event,
        ChatEvent::PresenceChanged {
            party: cara(),
            online: false
        }
    );
    alice.with_chat(|chat| assert!(!chat.is_online(&cara())));

    alice.shutdown();
}

#[tokio::test]
async fn typing_shows_and_is_cleared_by_sending() {
    let url = start_relay().await;
    let (alice, _alice_rx) = online_client(&url, &ann()).await;
    let (bob, mut bob_rx) = online_client(&url, &cara()).await;

    let alice_conv = alice.open_party(&cara()).unwrap();
    let bob_conv = bob.open_party(&ann()).unwrap();

    alice.typing(&alice_conv);
    let event = wait_for(&mut bob_rx, is_typing_change).await;
    assert_eq!(
        event,
        ChatEvent::TypingChanged {
            conversation_id: bob_conv.clone(),
            party: ann(),
            typing: true
        }
    );
    bob.with_chat(|chat| {
        assert!(chat.session(&bob_conv).unwrap().is_typing(&ann()));
    });

    alice.send(&alice_conv, "see you then").unwrap();
    let event = wait_for(&mut bob_rx, is_typing_change).await;
    assert_eq!(
        event,
        ChatEvent::TypingChanged {
            conversation_id: bob_conv.clone(),
            party: ann(),
            typing: false
        }
    );
    wait_for(&mut bob_rx, |e| {
        matches!(e, ChatEvent::MessageAppended { message, .. } if message.content == "see you then")
    })
    .await;

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn idle_typing_is_stopped_after_quiet_period() {
    let url = start_relay().await;
    let (alice, _alice_rx) = online_client(&url, &ann()).await;
    let (bob, mut bob_rx) = online_client(&url, &cara()).await;

    let alice_conv = alice.open_party(&cara()).unwrap();
    bob.open_party(&ann()).unwrap();

    alice.typing(&alice_conv);
    let started = wait_for(&mut bob_rx, is_typing_change).await;
    assert!(matches!(started, ChatEvent::TypingChanged { typing: true, .. }));

    // No further keystrokes: the quiet period elapses on its own.
    let stopped = wait_for(&mut bob_rx, is_typing_change).await;
    assert!(matches!(stopped, ChatEvent::TypingChanged { typing: false, .. }));

    alice.shutdown();
    bob.shutdown();
}
