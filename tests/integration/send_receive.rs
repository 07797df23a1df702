// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! End-to-end send/receive between two clients through the development
//! relay.
//!
//! These tests validate:
//! - A sent message shows as pending, then is reconciled to the server id
//! - A message for a conversation the recipient has not opened counts
//!   towards the global unread badge and raises a notification
//! - Reading in the foreground sends a read receipt back to the sender
//! - Sending while disconnected is rejected before anything is emitted

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use carechat::app::AppContext;
use carechat::chat::{ChatEvent, SendError};
use carechat::config::ClientConfig;
use carechat::connection::ConnectionState;
use carechat::connection::ws::WsConnector;
use carechat::history::{ConversationSummary, HistoryApi, HistoryError, Page};
use carechat::notify::{Recorded, RecordingSink, ToastKind};
use carechat::storage::LocalStore;
use carechat_proto::identity::LocalParty;
use carechat_proto::message::{Message, MessageStatus};
use carechat_proto::party::{PartyRef, PartyType};
use carechat_relay::relay::{self, RelayState};

// =============================================================================
// Helpers
// =============================================================================

/// History API with nothing on the server.
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
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start relay");
    format!("ws://{addr}/ws")
}

fn client(
    url: &str,
    party: &PartyRef,
    name: &str,
) -> (Arc<Client>, mpsc::Receiver<ChatEvent>, RecordingSink) {
    let store = LocalStore::in_memory();
    store
        .set_session(
            party.kind,
            json!({"id": party.id.as_str(), "name": name}),
            "secret",
        )
        .unwrap();
    let config = ClientConfig {
        socket_url: url.to_string(),
        ..ClientConfig::default()
    };
    let sink = RecordingSink::default();
    let (ctx, events) = AppContext::new(
        config,
        Arc::new(store),
        WsConnector::new(url).unwrap(),
        NoHistory,
        sink.clone(),
    );
    (ctx, events, sink)
}

async fn wait_for<F>(rx: &mut mpsc::Receiver<ChatEvent>, pred: F) -> ChatEvent
where
    F: Fn(&ChatEvent) -> bool,
{
    let deadline = Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout(deadline, rx.recv())
            .await
            .expect("timed out waiting for chat event")
            .expect("chat event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn go_online(ctx: &Arc<Client>, rx: &mut mpsc::Receiver<ChatEvent>) {
    ctx.start();
    wait_for(rx, |e| {
        *e == ChatEvent::Connection(ConnectionState::Authenticated)
    })
    .await;
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
async fn sent_message_is_reconciled_and_delivered() {
    let url = start_relay().await;
    let (alice, mut alice_rx, _alice_sink) = client(&url, &ann(), "Ann");
    let (bob, mut bob_rx, bob_sink) = client(&url, &cara(), "Cara");
    go_online(&alice, &mut alice_rx).await;
    go_online(&bob, &mut bob_rx).await;

    // A bare numeric token resolves to a caregiver.
    let conv = alice.open("42", None).unwrap();
    assert_eq!(conv.as_str(), "caregiver_42_user_7");

    let provisional = alice.send(&conv, "Are you free on Tuesday?").unwrap();
    assert!(provisional.is_provisional());

    let ChatEvent::MessageAppended { status, .. } =
        wait_for(&mut alice_rx, |e| matches!(e, ChatEvent::MessageAppended { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(status, MessageStatus::Pending);

    let ChatEvent::IdReconciled {
        provisional: replaced,
        assigned,
        ..
    } = wait_for(&mut alice_rx, |e| matches!(e, ChatEvent::IdReconciled { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(replaced, provisional);
    assert!(!assigned.is_provisional());
    alice.with_chat(|chat| {
        let session = chat.session(&conv).unwrap();
        assert_eq!(session.status_of(&assigned), Some(&MessageStatus::Sent));
        assert_eq!(session.status_of(&provisional), None);
    });

    // Bob has no session open: global unread and a notification.
    let event = wait_for(&mut bob_rx, |e| matches!(e, ChatEvent::UnreadChanged { .. })).await;
    assert_eq!(
        event,
        ChatEvent::UnreadChanged {
            conversation_id: None,
            total: 1
        }
    );
    let toasts = bob_sink.toasts();
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].kind, ToastKind::Message);
    assert_eq!(toasts[0].title, "Ann sent a message");
    assert_eq!(toasts[0].body, "Are you free on Tuesday?");
    assert!(bob_sink.records().contains(&Recorded::Badge(1)));

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn foreground_reply_is_read_and_receipt_flows_back() {
    let url = start_relay().await;
    let (alice, mut alice_rx, alice_sink) = client(&url, &ann(), "Ann");
    let (bob, mut bob_rx, _bob_sink) = client(&url, &cara(), "Cara");
    go_online(&alice, &mut alice_rx).await;
    go_online(&bob, &mut bob_rx).await;

    let alice_conv = alice.open("caregiver_42", None).unwrap();
    let bob_conv = bob.open("user_7", None).unwrap();
    assert_eq!(alice_conv, bob_conv);
    wait_for(&mut bob_rx, |e| matches!(e, ChatEvent::HistoryLoaded { .. })).await;

    bob.send(&bob_conv, "Yes, from 9am").unwrap();
    let ChatEvent::StatusChanged { message_id, .. } = wait_for(&mut bob_rx, |e| {
        matches!(
            e,
            ChatEvent::StatusChanged {
                status: MessageStatus::Sent,
                ..
            }
        )
    })
    .await
    else {
        unreachable!()
    };

    // Alice is looking at the conversation: read on arrival, no toast.
    let appended = wait_for(&mut alice_rx, |e| {
        matches!(e, ChatEvent::MessageAppended { message, .. } if message.content == "Yes, from 9am")
    })
    .await;
    let ChatEvent::MessageAppended { message, .. } = appended else {
        unreachable!()
    };
    assert!(message.read_at.is_some());
    assert!(alice_sink.toasts().is_empty());

    // The read receipt flips Bob's copy to read.
    let event = wait_for(&mut bob_rx, |e| {
        matches!(
            e,
            ChatEvent::StatusChanged {
                status: MessageStatus::Read,
                ..
            }
        )
    })
    .await;
    assert_eq!(
        event,
        ChatEvent::StatusChanged {
            conversation_id: bob_conv,
            message_id,
            status: MessageStatus::Read,
        }
    );

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn send_while_disconnected_is_rejected_without_emitting() {
    let url = start_relay().await;
    let (alice, _alice_rx, alice_sink) = client(&url, &ann(), "Ann");

    let conv = alice.open("caregiver_42", None).unwrap();
    let err = alice.send(&conv, "hello?").unwrap_err();
    assert!(matches!(err, SendError::NotConnected));

    let toasts = alice_sink.toasts();
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].kind, ToastKind::Error);
    alice.with_chat(|chat| {
        assert!(chat.session(&conv).unwrap().messages().is_empty());
    });
}

#[tokio::test]
async fn invalid_content_is_rejected_before_the_socket() {
    let url = start_relay().await;
    let (alice, mut alice_rx, alice_sink) = client(&url, &ann(), "Ann");
    go_online(&alice, &mut alice_rx).await;

    let conv = alice.open("caregiver_42", None).unwrap();
    let err = alice.send(&conv, "   ").unwrap_err();
    assert!(matches!(err, SendError::Validation(_)));

    let oversized = "x".repeat(64 * 1024 + 1);
    let err = alice.send(&conv, &oversized).unwrap_err();
    assert!(err.to_string().contains("too large"));
    assert_eq!(alice_sink.toasts().len(), 2);

    alice.shutdown();
}
