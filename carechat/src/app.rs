//! Application context.
//!
//! One [`AppContext`] is built at startup and shared by reference. It owns
//! the connection manager, the history client, the notification
//! dispatcher and the chat session registry, and runs the single event
//! loop that feeds socket events into them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use carechat_proto::codec::{self, OutgoingOptions, Violations};
use carechat_proto::contact::ContactResolver;
use carechat_proto::conversation::ConversationId;
use carechat_proto::event::{ClientEvent, ServerEvent};
use carechat_proto::identity::{LocalParty, resolve_local_party};
use carechat_proto::message::{MessageId, MessageKind, Timestamp};
use carechat_proto::party::{PartyRef, PartyType};
use serde_json::Value;

use crate::chat::session::SessionState;
use crate::chat::typing::TypingSignal;
use crate::chat::{ChatError, ChatEvent, ChatService, Delivery, OpenOutcome, SendError};
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, Connector};
use crate::history::{ConversationSummary, HistoryApi, HistoryError, Page};
use crate::notify::{NotificationDispatcher, NotificationSink, PageState};
use crate::storage::LocalStore;

/// Reason recorded on messages the server never confirmed.
pub const ACK_TIMEOUT_REASON: &str = "no confirmation from server";

/// How often idle typing indicators are checked.
const TYPING_POLL: Duration = Duration::from_millis(500);

/// Everything the chat client needs, built once.
pub struct AppContext<C: Connector, H: HistoryApi, S: NotificationSink> {
    config: ClientConfig,
    store: Arc<LocalStore>,
    resolver: ContactResolver,
    connection: ConnectionManager<C>,
    history: H,
    notifier: NotificationDispatcher<S>,
    chat: Mutex<ChatService>,
    connection_events: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector, H: HistoryApi, S: NotificationSink> AppContext<C, H, S> {
    /// Build the context. Nothing connects until [`start`](Self::start).
    pub fn new(
        config: ClientConfig,
        store: Arc<LocalStore>,
        connector: C,
        history: H,
        sink: S,
    ) -> (Arc<Self>, mpsc::Receiver<ChatEvent>) {
        let (connection, connection_events) = ConnectionManager::new(
            connector,
            config.reconnect.clone(),
            Arc::clone(&store),
            config.identity.party_precedence.clone(),
            config.event_buffer,
        );
        let (chat, chat_events) = ChatService::new(config.chat.typing_timeout, config.event_buffer);
        let notifier =
            NotificationDispatcher::new(sink, Arc::clone(&store), config.notifications.clone());

        let ctx = Arc::new(Self {
            resolver: config.identity.resolver(),
            config,
            store,
            connection,
            history,
            notifier,
            chat: Mutex::new(chat),
            connection_events: Mutex::new(Some(connection_events)),
            event_loop: Mutex::new(None),
        });
        (ctx, chat_events)
    }

    /// Connect and start the event loop. Later calls only reconnect.
    pub fn start(self: &Arc<Self>) {
        if let Some(mut events) = self.connection_events.lock().take() {
            let ctx = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut tick = tokio::time::interval(TYPING_POLL);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => ctx.handle_connection_event(event),
                            None => break,
                        },
                        _ = tick.tick() => ctx.expire_typing(),
                    }
                }
                tracing::debug!("event loop finished");
            });
            *self.event_loop.lock() = Some(handle);
        }
        self.connection.connect();
    }

    /// Disconnect and stop the event loop.
    pub fn shutdown(&self) {
        self.connection.disconnect();
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
    }

    /// Resolved configuration.
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Local persisted store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Connection manager.
    pub const fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    /// Notification dispatcher.
    pub const fn notifier(&self) -> &NotificationDispatcher<S> {
        &self.notifier
    }

    /// Read the session registry.
    pub fn with_chat<R>(&self, f: impl FnOnce(&ChatService) -> R) -> R {
        f(&self.chat.lock())
    }

    /// The signed-in party, per the configured precedence.
    pub fn local_party(&self) -> Option<LocalParty> {
        resolve_local_party(self.store.as_ref(), &self.config.identity.party_precedence)
    }

    /// Open (or reveal) a conversation from a contact token.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Contact`] for a blank token and
    /// [`ChatError::NoLocalParty`] when nobody is signed in.
    pub fn open(
        self: &Arc<Self>,
        token: &str,
        explicit: Option<PartyType>,
    ) -> Result<ConversationId, ChatError> {
        let contact = self.resolver.resolve(token, explicit)?;
        self.open_party(&contact)
    }

    /// Open (or reveal) a conversation with `contact`.
    ///
    /// A new session joins its room and fetches a history page in the
    /// background. The result is dropped if the session closes first.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoLocalParty`] when nobody is signed in.
    pub fn open_party(self: &Arc<Self>, contact: &PartyRef) -> Result<ConversationId, ChatError> {
        let local = self.local_party().ok_or(ChatError::NoLocalParty)?;
        let outcome = self.chat.lock().open(&local.party, contact);

        let conversation_id = match outcome {
            OpenOutcome::Revealed { conversation_id } => conversation_id,
            OpenOutcome::Created {
                conversation_id,
                room,
                liveness,
            } => {
                self.connection.join(&room);

                let ctx = Arc::clone(self);
                let contact = contact.clone();
                let id = conversation_id.clone();
                tokio::spawn(async move {
                    let page = Page::first(ctx.config.chat.history_page_size);
                    let result = ctx
                        .history
                        .fetch_messages(&local, &contact, page)
                        .await
                        .map_err(|e| e.to_string());
                    if let Err(reason) = &result
                        && liveness.is_alive()
                    {
                        ctx.notifier.notify_error("History unavailable", reason);
                    }
                    ctx.chat.lock().apply_history(&id, &liveness, result);
                });
                conversation_id
            }
        };

        if let Err(e) = self.mark_read(&conversation_id) {
            tracing::debug!(err = %e, "mark read after open skipped");
        }
        Ok(conversation_id)
    }

    /// Close a conversation and leave its room.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoSession`] if it is not open.
    pub fn close(&self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        let (session, stop_typing) = {
            let mut chat = self.chat.lock();
            let stop_typing = chat.typing_stop(conversation_id);
            let session = chat
                .close(conversation_id)
                .ok_or_else(|| ChatError::NoSession(conversation_id.clone()))?;
            (session, stop_typing)
        };
        if let Some(contact) = stop_typing {
            self.emit_quietly(&ClientEvent::StopTyping { contact });
        }
        self.connection.leave(session.room());
        Ok(())
    }

    /// Minimize or restore a conversation.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoSession`] if it is not open.
    pub fn toggle_minimize(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<SessionState, ChatError> {
        let state = self
            .chat
            .lock()
            .toggle_minimize(conversation_id)
            .ok_or_else(|| ChatError::NoSession(conversation_id.clone()))?;
        if state == SessionState::Open {
            self.mark_read(conversation_id)?;
        }
        Ok(state)
    }

    /// Bring a conversation to the foreground and mark it read.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoSession`] if it is not open.
    pub fn focus(&self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        self.chat.lock().focus(conversation_id)?;
        self.mark_read(conversation_id).map(|_| ())
    }

    /// Mark a conversation read locally and tell the server.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoSession`] if it is not open.
    pub fn mark_read(&self, conversation_id: &ConversationId) -> Result<usize, ChatError> {
        let (changed, contact) = {
            let mut chat = self.chat.lock();
            let changed = chat.mark_read(conversation_id)?;
            let contact = chat
                .session(conversation_id)
                .map(|s| s.contact().clone())
                .ok_or_else(|| ChatError::NoSession(conversation_id.clone()))?;
            (changed, contact)
        };
        if changed > 0 {
            self.emit_quietly(&ClientEvent::MarkRead {
                contact,
                conversation_id: conversation_id.clone(),
            });
        }
        Ok(changed)
    }

    /// Send a text message in an open conversation.
    ///
    /// Validation runs first, then the connection is checked; either
    /// failure rejects the send before anything reaches the socket and
    /// shows an error toast. On success the message is shown as pending
    /// and fails on its own if the server does not confirm it in time.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] describing why nothing was sent.
    pub fn send(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<MessageId, SendError> {
        self.send_kind(conversation_id, content, MessageKind::Text)
    }

    /// Send a message of a given kind.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn send_kind(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        content: &str,
        kind: MessageKind,
    ) -> Result<MessageId, SendError> {
        let result = self.try_send(conversation_id, content, kind);
        if let Err(e) = &result {
            tracing::warn!(conversation = %conversation_id, err = %e, "send rejected");
            self.notifier.notify_error("Message not sent", &e.to_string());
        }
        result
    }

    fn try_send(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        content: &str,
        kind: MessageKind,
    ) -> Result<MessageId, SendError> {
        let contact = self
            .chat
            .lock()
            .session(conversation_id)
            .map(|s| s.contact().clone())
            .ok_or_else(|| SendError::NoSession(conversation_id.clone()))?;

        let draft = codec::build_outgoing(
            self.store.as_ref(),
            &self.config.identity.party_precedence,
            &contact,
            content,
            &OutgoingOptions { kind },
        )?;
        let violations = codec::validate(&draft);
        if !violations.is_empty() {
            return Err(Violations(violations).into());
        }
        if !self.connection.is_connected() {
            return Err(SendError::NotConnected);
        }

        let wire = draft.to_wire();
        let message = draft.into_message()?;
        let id = message.id.clone();
        if message.conversation_id != *conversation_id {
            return Err(SendError::NoSession(message.conversation_id));
        }

        let stop_typing = {
            let mut chat = self.chat.lock();
            let stop_typing = chat.typing_stop(conversation_id);
            chat.append_outgoing(message)
                .map_err(|_| SendError::NoSession(conversation_id.clone()))?;
            stop_typing
        };
        if let Some(contact) = stop_typing {
            self.emit_quietly(&ClientEvent::StopTyping { contact });
        }

        if let Err(e) = self.connection.emit(&ClientEvent::SendMessage(wire)) {
            self.chat
                .lock()
                .expire_pending(conversation_id, &id, &e.to_string());
            return Err(e.into());
        }
        tracing::debug!(conversation = %conversation_id, id = %id, "message emitted");

        let ctx = Arc::clone(self);
        let conversation_id = conversation_id.clone();
        let pending = id.clone();
        let timeout = self.config.chat.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = ctx
                .chat
                .lock()
                .expire_pending(&conversation_id, &pending, ACK_TIMEOUT_REASON);
            if expired {
                ctx.notifier
                    .notify_error("Message not confirmed", ACK_TIMEOUT_REASON);
            }
        });
        Ok(id)
    }

    /// The local party typed in a conversation.
    pub fn typing(&self, conversation_id: &ConversationId) {
        let signal = self
            .chat
            .lock()
            .typing_input(conversation_id, Instant::now());
        if let Some((contact, TypingSignal::Start)) = signal {
            self.emit_quietly(&ClientEvent::Typing { contact });
        }
    }

    /// Page visibility/focus changed. Becoming active marks the
    /// foreground conversation read.
    pub fn set_page_state(&self, state: PageState) {
        let was_active = self.notifier.page_state().is_active();
        self.notifier.set_page_state(state);
        if state.is_active() && !was_active {
            let foreground = self.chat.lock().foreground().cloned();
            if let Some(conversation_id) = foreground
                && let Err(e) = self.mark_read(&conversation_id)
            {
                tracing::debug!(err = %e, "mark read on focus skipped");
            }
        }
    }

    /// Conversations the local party takes part in.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if the request fails; nobody signed in
    /// yields an empty list.
    pub async fn conversations(&self, page: Page) -> Result<Vec<ConversationSummary>, HistoryError> {
        let Some(local) = self.local_party() else {
            return Ok(Vec::new());
        };
        self.history.fetch_conversations(&local, page).await
    }

    /// Fetch the server-side unread total and show it on the badge.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if the request fails.
    pub async fn refresh_unread(&self) -> Result<u64, HistoryError> {
        let Some(local) = self.local_party() else {
            return Ok(0);
        };
        let count = self.history.fetch_unread_count(&local).await?;
        self.notifier
            .update_badge(usize::try_from(count).unwrap_or(usize::MAX));
        Ok(count)
    }

    fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                self.chat.lock().connection_changed(state);
            }
            ConnectionEvent::AuthFailed(reason) => {
                self.notifier.notify_error("Authentication failed", &reason);
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                tracing::debug!(attempt, ?delay, "waiting to reconnect");
            }
            ConnectionEvent::RetriesExhausted { attempts } => {
                self.notifier.notify_error(
                    "Connection lost",
                    &format!("could not reach the chat server after {attempts} retries"),
                );
            }
            ConnectionEvent::Server(event) => self.handle_server_event(event),
        }
    }

    fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(raw) => self.on_incoming(&raw),
            ServerEvent::MessageSent(raw) => {
                let draft = codec::normalize(&raw);
                let client_id = draft.client_id.clone();
                match draft.into_message() {
                    Ok(message) => {
                        self.chat.lock().confirm_sent(&message, client_id.as_ref());
                    }
                    Err(violations) => {
                        tracing::warn!(reason = %violations, "unusable send confirmation");
                    }
                }
            }
            ServerEvent::UserTyping { party } => {
                self.chat.lock().set_typing(&party, true);
            }
            ServerEvent::UserStoppedTyping { party } => {
                self.chat.lock().set_typing(&party, false);
            }
            ServerEvent::MessageRead {
                reader,
                conversation_id,
                read_at,
            } => {
                self.chat.lock().mark_read_by_peer(
                    &conversation_id,
                    &reader,
                    read_at.unwrap_or_else(Timestamp::now),
                );
            }
            ServerEvent::UserOnline { party } => self.chat.lock().set_presence(&party, true),
            ServerEvent::UserOffline { party } => self.chat.lock().set_presence(&party, false),
            ServerEvent::Error { message } => {
                self.notifier.notify_error("Chat server error", &message);
            }
            ServerEvent::Authenticated { .. }
            | ServerEvent::AuthError { .. }
            | ServerEvent::JoinedRoom { .. } => {}
        }
    }

    fn on_incoming(&self, raw: &Value) {
        let message = match codec::normalize(raw).into_message() {
            Ok(message) => message,
            Err(violations) => {
                tracing::warn!(reason = %violations, "dropping invalid incoming message");
                return;
            }
        };
        let Some(local) = self.local_party() else {
            tracing::warn!("incoming message while signed out");
            return;
        };

        let page_active = self.notifier.page_state().is_active();
        let (delivery, total) = {
            let mut chat = self.chat.lock();
            let delivery = chat.receive(message.clone(), &local.party, page_active);
            (delivery, chat.total_unread())
        };
        tracing::debug!(
            conversation = %message.conversation_id,
            from = %message.sender,
            ?delivery,
            "message received"
        );

        if message.is_from(&local.party) || !message.is_addressed_to(&local.party) {
            return;
        }
        match delivery {
            Delivery::Appended { foreground: true } => {
                self.emit_quietly(&ClientEvent::MarkRead {
                    contact: message.sender.clone(),
                    conversation_id: message.conversation_id.clone(),
                });
            }
            Delivery::Appended { foreground: false } | Delivery::Unmatched { .. } => {
                self.notifier.notify_message(&message);
                self.notifier.update_badge(total);
            }
        }
    }

    fn expire_typing(&self) {
        let idle = self.chat.lock().typing_expired(Instant::now());
        for contact in idle {
            self.emit_quietly(&ClientEvent::StopTyping { contact });
        }
    }

    /// Emit a best-effort event; dropped when offline.
    fn emit_quietly(&self, event: &ClientEvent) {
        if let Err(e) = self.connection.emit(event) {
            tracing::debug!(err = %e, "best-effort event dropped");
        }
    }
}
