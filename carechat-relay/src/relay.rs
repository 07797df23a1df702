//! Relay core: shared state, WebSocket handler, room registry, and event
//! routing.
//!
//! Each WebSocket connection gets a numeric connection id. A connection
//! becomes bound to a party by `authenticate`, which also puts it in the
//! party's personal room. Messages go to the recipient's personal room and
//! to the conversation room; the sending connection gets `message_sent`
//! instead. Nothing is stored: a party with no open connection simply
//! misses the event.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use carechat_proto::codec::{self, Violations};
use carechat_proto::conversation::ConversationId;
use carechat_proto::event::{ClientEvent, ServerEvent};
use carechat_proto::message::{MAX_CONTENT_SIZE, MessageId, Timestamp};
use carechat_proto::party::PartyRef;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};

/// One open WebSocket.
struct Peer {
    sender: mpsc::UnboundedSender<Message>,
    party: Option<PartyRef>,
    rooms: HashSet<String>,
}

/// Limits and access rules applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Largest accepted message content, in bytes.
    pub max_content_len: usize,
    /// Let any authenticated party join any room.
    pub open_rooms: bool,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            max_content_len: MAX_CONTENT_SIZE,
            open_rooms: false,
        }
    }
}

/// Shared relay state: connections, their parties and their rooms.
pub struct RelayState {
    connections: RwLock<HashMap<u64, Peer>>,
    next_connection: AtomicU64,
    next_message_id: AtomicU64,
    policy: RelayPolicy,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Empty state with the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(RelayPolicy::default())
    }

    /// Empty state that applies `policy` to every connection.
    #[must_use]
    pub fn with_policy(policy: RelayPolicy) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
            policy,
        }
    }

    /// Register a new connection and return its id.
    pub async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(
            id,
            Peer {
                sender,
                party: None,
                rooms: HashSet::new(),
            },
        );
        id
    }

    /// Remove a connection. Returns its party if that was the party's last
    /// open connection.
    pub async fn unregister(&self, connection: u64) -> Option<PartyRef> {
        let mut conns = self.connections.write().await;
        let party = conns.remove(&connection)?.party?;
        let still_online = conns.values().any(|p| p.party.as_ref() == Some(&party));
        (!still_online).then_some(party)
    }

    /// Bind a connection to `party` and put it in the party's personal
    /// room. Returns whether the party already had another connection.
    async fn bind_party(&self, connection: u64, party: &PartyRef) -> bool {
        let mut conns = self.connections.write().await;
        let already_online = conns
            .iter()
            .any(|(id, p)| *id != connection && p.party.as_ref() == Some(party));
        if let Some(peer) = conns.get_mut(&connection) {
            if let Some(previous) = peer.party.replace(party.clone()) {
                peer.rooms.remove(&previous.room());
            }
            peer.rooms.insert(party.room());
        }
        already_online
    }

    async fn party_of(&self, connection: u64) -> Option<PartyRef> {
        self.connections
            .read()
            .await
            .get(&connection)
            .and_then(|p| p.party.clone())
    }

    async fn join(&self, connection: u64, room: &str) {
        if let Some(peer) = self.connections.write().await.get_mut(&connection) {
            peer.rooms.insert(room.to_string());
        }
    }

    async fn leave(&self, connection: u64, room: &str) -> bool {
        self.connections
            .write()
            .await
            .get_mut(&connection)
            .is_some_and(|p| p.rooms.remove(room))
    }

    /// Whether any connection is bound to `party`.
    pub async fn is_online(&self, party: &PartyRef) -> bool {
        self.connections
            .read()
            .await
            .values()
            .any(|p| p.party.as_ref() == Some(party))
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn send_to(&self, connection: u64, event: &ServerEvent) {
        let Some(frame) = encode(event) else {
            return;
        };
        if let Some(peer) = self.connections.read().await.get(&connection) {
            let _ = peer.sender.send(frame);
        }
    }

    /// Send to every connection in any of `rooms`, once per connection.
    /// Returns how many connections were reached.
    async fn send_to_rooms(&self, rooms: &[String], event: &ServerEvent, exclude: u64) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let conns = self.connections.read().await;
        let mut reached = 0;
        for (id, peer) in conns.iter() {
            if *id == exclude || !rooms.iter().any(|r| peer.rooms.contains(r)) {
                continue;
            }
            if peer.sender.send(frame.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Send to every authenticated connection except `exclude`.
    async fn broadcast(&self, event: &ServerEvent, exclude: u64) {
        let Some(frame) = encode(event) else {
            return;
        };
        let conns = self.connections.read().await;
        for (id, peer) in conns.iter() {
            if *id != exclude && peer.party.is_some() {
                let _ = peer.sender.send(frame.clone());
            }
        }
    }

    /// Send a WebSocket Close frame to every connection.
    ///
    /// Each writer task forwards the close, which the client sees as the
    /// server going away. Used for graceful shutdown and testing.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (id, peer) in conns.iter() {
            tracing::info!(connection = id, "sending close frame");
            let _ = peer.sender.send(Message::Close(None));
        }
    }
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match codec::encode_server(event) {
        Ok(frame) => Some(Message::Text(frame.into())),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server event");
            None
        }
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Register the connection (unauthenticated).
/// 2. Route client events until either side closes.
/// 3. Unregister, and announce the party offline if it has no other
///    connection left.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(tx).await;
    tracing::info!(connection, "connection opened");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(connection, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_frame(connection, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(connection, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if let Some(party) = state.unregister(connection).await {
        tracing::info!(connection, party = %party, "party offline");
        state
            .broadcast(&ServerEvent::UserOffline { party }, connection)
            .await;
    }
    tracing::info!(connection, "connection closed");
}

async fn handle_text_frame(connection: u64, frame: &str, state: &Arc<RelayState>) {
    match codec::decode_client(frame) {
        Ok(event) => handle_client_event(connection, event, state).await,
        Err(e) => {
            tracing::warn!(connection, error = %e, "failed to decode client event");
            let err = ServerEvent::Error {
                message: "unrecognised event".to_string(),
            };
            state.send_to(connection, &err).await;
        }
    }
}

async fn handle_client_event(connection: u64, event: ClientEvent, state: &Arc<RelayState>) {
    if let ClientEvent::Authenticate { party, credential } = event {
        authenticate(connection, party, &credential, state).await;
        return;
    }

    let Some(party) = state.party_of(connection).await else {
        tracing::warn!(connection, "event before authentication");
        let err = ServerEvent::Error {
            message: "not authenticated".to_string(),
        };
        state.send_to(connection, &err).await;
        return;
    };

    match event {
        ClientEvent::Authenticate { .. } => {}
        ClientEvent::Join { room } => {
            if !state.policy.open_rooms && !may_join(&party, &room) {
                tracing::warn!(connection, party = %party, room = %room, "join refused");
                let err = ServerEvent::Error {
                    message: format!("cannot join room {room}"),
                };
                state.send_to(connection, &err).await;
                return;
            }
            state.join(connection, &room).await;
            tracing::debug!(connection, room = %room, "joined room");
            state
                .send_to(connection, &ServerEvent::JoinedRoom { room })
                .await;
        }
        ClientEvent::Leave { room } => {
            let was_member = state.leave(connection, &room).await;
            tracing::debug!(connection, room = %room, was_member, "left room");
        }
        ClientEvent::SendMessage(raw) => route_message(connection, &party, &raw, state).await,
        ClientEvent::Typing { contact } => {
            let event = ServerEvent::UserTyping { party };
            state
                .send_to_rooms(&[contact.room()], &event, connection)
                .await;
        }
        ClientEvent::StopTyping { contact } => {
            let event = ServerEvent::UserStoppedTyping { party };
            state
                .send_to_rooms(&[contact.room()], &event, connection)
                .await;
        }
        ClientEvent::MarkRead {
            contact,
            conversation_id,
        } => {
            let event = ServerEvent::MessageRead {
                reader: party,
                conversation_id,
                read_at: Some(Timestamp::now()),
            };
            state
                .send_to_rooms(&[contact.room()], &event, connection)
                .await;
        }
    }
}

async fn authenticate(connection: u64, party: PartyRef, credential: &str, state: &Arc<RelayState>) {
    if credential.trim().is_empty() || party.id.is_empty() {
        tracing::warn!(connection, party = %party, "authentication rejected");
        let err = ServerEvent::AuthError {
            reason: "missing credential".to_string(),
        };
        state.send_to(connection, &err).await;
        return;
    }

    let already_online = state.bind_party(connection, &party).await;
    tracing::info!(connection, party = %party, "authenticated");
    state
        .send_to(
            connection,
            &ServerEvent::Authenticated {
                party: party.clone(),
            },
        )
        .await;
    if !already_online {
        state
            .broadcast(&ServerEvent::UserOnline { party }, connection)
            .await;
    }
}

/// A party may join its own personal room and conversation rooms it is
/// one end of.
fn may_join(party: &PartyRef, room: &str) -> bool {
    room == party.room() || ConversationId::from_raw(room).involves(party)
}

/// Validate a `send_message` payload, assign it a server id, and deliver
/// it.
///
/// The sender is always the authenticated party, whatever the payload
/// says.
async fn route_message(connection: u64, party: &PartyRef, raw: &Value, state: &Arc<RelayState>) {
    let mut draft = codec::normalize(raw);
    draft.sender_id = Some(party.id.clone());
    draft.sender_type = party.kind.as_str().to_string();

    let limit = state.policy.max_content_len;
    if draft.content.len() > limit {
        let err = ServerEvent::Error {
            message: format!(
                "message content too large: {} bytes (max {} bytes)",
                draft.content.len(),
                limit
            ),
        };
        state.send_to(connection, &err).await;
        return;
    }
    let violations = codec::validate(&draft);
    if !violations.is_empty() {
        let reason = Violations(violations).to_string();
        tracing::warn!(connection, reason = %reason, "message rejected");
        state
            .send_to(connection, &ServerEvent::Error { message: reason })
            .await;
        return;
    }

    let id = state.next_message_id.fetch_add(1, Ordering::Relaxed);
    draft.message_id = Some(MessageId::Assigned(id.to_string()));
    draft.created_at = Timestamp::now();
    if let (Some(sender), Some(recipient)) = (draft.sender(), draft.recipient()) {
        draft.conversation_id = Some(ConversationId::between(&sender, &recipient).to_string());
    }

    let wire = draft.to_wire();
    let message = match draft.into_message() {
        Ok(m) => m,
        Err(violations) => {
            let err = ServerEvent::Error {
                message: violations.to_string(),
            };
            state.send_to(connection, &err).await;
            return;
        }
    };

    let rooms = [message.recipient.room(), message.conversation_id.to_string()];
    let reached = state
        .send_to_rooms(&rooms, &ServerEvent::NewMessage(wire.clone()), connection)
        .await;
    tracing::debug!(
        id,
        from = %message.sender,
        to = %message.recipient,
        reached,
        "message routed"
    );
    state
        .send_to(connection, &ServerEvent::MessageSent(wire))
        .await;
}

/// Starts the relay on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay with a pre-configured [`RelayState`].
///
/// Keep a clone of the `Arc` to inspect or close connections from tests.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
