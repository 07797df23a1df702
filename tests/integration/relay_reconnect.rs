// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Reconnect behaviour against the development relay.
//!
//! These tests validate:
//! - A connection dropped by the server is retried and re-authenticated
//! - Rooms joined before the drop are joined again after it
//! - A relay that stays down exhausts the retry budget and raises a toast
//! - A relay restarted on the same address is picked up again
//!
//! ## Disconnect simulation
//!
//! Aborting the relay's serve task does not close WebSockets that are
//! already open (they run on their own tasks), so every test first asks
//! the relay to send a close frame on every connection.

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
use carechat::notify::{RecordingSink, ToastKind};
use carechat::storage::LocalStore;
use carechat_proto::identity::LocalParty;
use carechat_proto::message::{Message, MessageStatus};
use carechat_proto::party::{PartyRef, PartyType};
use carechat_relay::relay::{self, RelayState};

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

/// A relay whose address and state outlive restarts.
struct TestRelay {
    addr: std::net::SocketAddr,
    state: Arc<RelayState>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    async fn start(addr: &str) -> Self {
        let state = Arc::new(RelayState::new());
        let (addr, handle) = relay::start_server_with_state(addr, Arc::clone(&state))
            .await
            .expect("failed to start relay");
        Self {
            addr,
            state,
            handle,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Close every connection and stop listening.
    async fn stop(self) -> std::net::SocketAddr {
        self.state.close_all_connections().await;
        self.handle.abort();
        let _ = self.handle.await;
        self.addr
    }
}

fn client(
    url: &str,
    base_delay: Duration,
    max_retries: u32,
) -> (Arc<Client>, mpsc::Receiver<ChatEvent>, RecordingSink) {
    let store = LocalStore::in_memory();
    store
        .set_session(PartyType::User, json!({"id": 7, "name": "Ann"}), "secret")
        .unwrap();
    let mut config = ClientConfig {
        socket_url: url.to_string(),
        ..ClientConfig::default()
    };
    config.reconnect.base_delay = base_delay;
    config.reconnect.max_retries = max_retries;
    config.reconnect.connect_timeout = Duration::from_secs(2);

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
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for chat event")
            .expect("chat event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn wait_for_state(rx: &mut mpsc::Receiver<ChatEvent>, state: ConnectionState) {
    wait_for(rx, |e| *e == ChatEvent::Connection(state)).await;
}

/// Poll until `cond` holds.
async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met in time");
}

fn cara() -> PartyRef {
    PartyRef::new("42", PartyType::Caregiver)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn dropped_connection_reauthenticates_and_rejoins() {
    let relay = TestRelay::start("127.0.0.1:0").await;
    let (ctx, mut rx, _sink) = client(&relay.url(), Duration::from_millis(50), 5);
    ctx.start();
    wait_for_state(&mut rx, ConnectionState::Authenticated).await;

    let conv = ctx.open_party(&cara()).unwrap();
    let room = conv.to_string();
    assert_eq!(ctx.connection().rooms(), vec![room.clone()]);

    relay.state.close_all_connections().await;
    wait_for_state(&mut rx, ConnectionState::Connecting).await;
    assert!(!ctx.connection().is_connected());
    wait_for_state(&mut rx, ConnectionState::Authenticated).await;
    assert_eq!(ctx.connection().rooms(), vec![room]);

    // The new socket works end to end.
    ctx.send(&conv, "back online").unwrap();
    wait_for(&mut rx, |e| {
        matches!(
            e,
            ChatEvent::StatusChanged {
                status: MessageStatus::Sent,
                ..
            }
        )
    })
    .await;

    ctx.shutdown();
}

#[tokio::test]
async fn relay_down_exhausts_retries() {
    let relay = TestRelay::start("127.0.0.1:0").await;
    let url = relay.url();
    let (ctx, mut rx, sink) = client(&url, Duration::from_millis(20), 2);
    ctx.start();
    wait_for_state(&mut rx, ConnectionState::Authenticated).await;

    relay.stop().await;
    wait_for_state(&mut rx, ConnectionState::Connecting).await;

    eventually(|| {
        sink.toasts()
            .iter()
            .any(|t| t.kind == ToastKind::Error && t.title == "Connection lost")
    })
    .await;
    assert_eq!(ctx.connection().state(), ConnectionState::Disconnected);
    assert_eq!(ctx.connection().retries(), 2);

    ctx.shutdown();
}

#[tokio::test]
async fn relay_restart_on_same_address_is_picked_up() {
    let relay = TestRelay::start("127.0.0.1:0").await;
    let url = relay.url();
    let (ctx, mut rx, _sink) = client(&url, Duration::from_millis(200), 5);
    ctx.start();
    wait_for_state(&mut rx, ConnectionState::Authenticated).await;

    let addr = relay.stop().await;
    wait_for_state(&mut rx, ConnectionState::Connecting).await;

    let restarted = TestRelay::start(&addr.to_string()).await;
    wait_for_state(&mut rx, ConnectionState::Authenticated).await;
    assert!(ctx.connection().is_connected());
    assert!(restarted.state.is_online(&PartyRef::new("7", PartyType::User)).await);

    ctx.shutdown();
}
