//! Chat session registry.
//!
//! [`ChatService`] holds one [`ChatSession`] per open conversation, routes
//! incoming messages by conversation id, keeps unread counts and reports
//! every visible change as a [`ChatEvent`]. It does no I/O; the
//! application context drives the socket and the history API around it.

pub mod session;
pub mod typing;

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use carechat_proto::codec::{CodecError, Violations};
use carechat_proto::contact::ContactError;
use carechat_proto::conversation::ConversationId;
use carechat_proto::message::{Message, MessageId, MessageStatus, Timestamp};
use carechat_proto::party::PartyRef;

use crate::connection::{ConnectionError, ConnectionState};

use session::{ChatSession, Liveness, SessionState};
use typing::TypingSignal;

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// No signed-in party could be resolved from local storage.
    #[error("not signed in")]
    NoLocalParty,

    /// No session is open for the conversation.
    #[error("no open session for {0}")]
    NoSession(ConversationId),

    /// The contact reference could not be resolved.
    #[error(transparent)]
    Contact(#[from] ContactError),
}

/// Errors that reject a send before anything reaches the socket.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The message failed validation.
    #[error("message rejected: {0}")]
    Validation(#[from] Violations),

    /// The socket is not open.
    #[error("not connected to the chat server")]
    NotConnected,

    /// No session is open for the conversation.
    #[error("no open session for {0}")]
    NoSession(ConversationId),

    /// The message could not be built or encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<ConnectionError> for SendError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::NotConnected => Self::NotConnected,
            ConnectionError::Codec(e) => Self::Codec(e),
        }
    }
}

/// Visible changes, for whatever renders the conversations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A new session was created.
    SessionOpened {
        /// Conversation.
        conversation_id: ConversationId,
        /// The other party.
        contact: PartyRef,
    },
    /// An existing session was brought forward.
    SessionRevealed {
        /// Conversation.
        conversation_id: ConversationId,
    },
    /// A session was minimized or restored.
    SessionMinimized {
        /// Conversation.
        conversation_id: ConversationId,
        /// Whether it is now minimized.
        minimized: bool,
    },
    /// A session was closed and discarded.
    SessionClosed {
        /// Conversation.
        conversation_id: ConversationId,
    },
    /// The history page landed.
    HistoryLoaded {
        /// Conversation.
        conversation_id: ConversationId,
        /// Messages added.
        count: usize,
    },
    /// The history page could not be fetched.
    HistoryFailed {
        /// Conversation.
        conversation_id: ConversationId,
        /// Why.
        reason: String,
    },
    /// A message was appended to a session.
    MessageAppended {
        /// The message.
        message: Message,
        /// Its status.
        status: MessageStatus,
    },
    /// A provisional id was replaced by the server's.
    IdReconciled {
        /// Conversation.
        conversation_id: ConversationId,
        /// The client-generated id.
        provisional: MessageId,
        /// The server-assigned id.
        assigned: MessageId,
    },
    /// A held message changed status.
    StatusChanged {
        /// Conversation.
        conversation_id: ConversationId,
        /// The message.
        message_id: MessageId,
        /// New status.
        status: MessageStatus,
    },
    /// A remote party started or stopped typing.
    TypingChanged {
        /// Conversation.
        conversation_id: ConversationId,
        /// Who.
        party: PartyRef,
        /// Whether they are typing now.
        typing: bool,
    },
    /// Unread counts changed.
    UnreadChanged {
        /// The session whose count changed, or `None` for messages with no
        /// open session.
        conversation_id: Option<ConversationId>,
        /// Unread total across all conversations.
        total: usize,
    },
    /// A party came online or went offline.
    PresenceChanged {
        /// Who.
        party: PartyRef,
        /// Whether online now.
        online: bool,
    },
    /// The chat socket changed state.
    Connection(ConnectionState),
}

/// Result of [`ChatService::open`].
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// A new session was created; join `room` and fetch history.
    Created {
        /// Conversation.
        conversation_id: ConversationId,
        /// Room to join.
        room: String,
        /// Guard for the history fetch.
        liveness: Liveness,
    },
    /// The session already existed and was revealed.
    Revealed {
        /// Conversation.
        conversation_id: ConversationId,
    },
}

/// Where an incoming message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Appended to its session.
    Appended {
        /// Whether the session was in the foreground (message read on arrival).
        foreground: bool,
    },
    /// No open session matched.
    Unmatched {
        /// Whether the global unread count went up.
        counted: bool,
    },
}

/// Registry of open chat sessions.
pub struct ChatService {
    sessions: HashMap<ConversationId, ChatSession>,
    foreground: Option<ConversationId>,
    global_unread: usize,
    online: BTreeSet<PartyRef>,
    typing_timeout: Duration,
    events: mpsc::Sender<ChatEvent>,
}

impl ChatService {
    /// Create an empty registry reporting to a new event channel.
    /// A zero `event_buffer` is treated as one.
    #[must_use]
    pub fn new(typing_timeout: Duration, event_buffer: usize) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (events, rx) = mpsc::channel(event_buffer.max(1));
        let service = Self {
            sessions: HashMap::new(),
            foreground: None,
            global_unread: 0,
            online: BTreeSet::new(),
            typing_timeout,
            events,
        };
        (service, rx)
    }

    /// Open a conversation with `contact`, or reveal it if already open.
    /// Either way it becomes the foreground session.
    pub fn open(&mut self, local: &PartyRef, contact: &PartyRef) -> OpenOutcome {
        let conversation_id = ConversationId::between(local, contact);
        self.foreground = Some(conversation_id.clone());

        if let Some(session) = self.sessions.get_mut(&conversation_id) {
            session.reveal();
            tracing::debug!(conversation = %conversation_id, "session revealed");
            self.emit(ChatEvent::SessionRevealed {
                conversation_id: conversation_id.clone(),
            });
            return OpenOutcome::Revealed { conversation_id };
        }

        let session = ChatSession::new(local.clone(), contact.clone(), self.typing_timeout);
        let room = session.room().to_string();
        let liveness = session.liveness();
        self.sessions.insert(conversation_id.clone(), session);
        tracing::info!(conversation = %conversation_id, contact = %contact, "session opened");
        self.emit(ChatEvent::SessionOpened {
            conversation_id: conversation_id.clone(),
            contact: contact.clone(),
        });
        OpenOutcome::Created {
            conversation_id,
            room,
            liveness,
        }
    }

    /// Close and discard a session. Returns it so the caller can leave its
    /// room.
    pub fn close(&mut self, conversation_id: &ConversationId) -> Option<ChatSession> {
        let mut session = self.sessions.remove(conversation_id)?;
        session.close();
        if self.foreground.as_ref() == Some(conversation_id) {
            self.foreground = None;
        }
        tracing::info!(conversation = %conversation_id, "session closed");
        self.emit(ChatEvent::SessionClosed {
            conversation_id: conversation_id.clone(),
        });
        Some(session)
    }

    /// Toggle minimized. Returns the new state.
    pub fn toggle_minimize(&mut self, conversation_id: &ConversationId) -> Option<SessionState> {
        let session = self.sessions.get_mut(conversation_id)?;
        let state = session.toggle_minimized();
        if state == SessionState::Opening {
            return Some(state);
        }
        self.emit(ChatEvent::SessionMinimized {
            conversation_id: conversation_id.clone(),
            minimized: state == SessionState::Minimized,
        });
        Some(state)
    }

    /// Make a session the foreground one, restoring it if minimized.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoSession`] if it is not open.
    pub fn focus(&mut self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        let session = self
            .sessions
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::NoSession(conversation_id.clone()))?;
        session.reveal();
        self.foreground = Some(conversation_id.clone());
        Ok(())
    }

    /// A session by conversation id.
    #[must_use]
    pub fn session(&self, conversation_id: &ConversationId) -> Option<&ChatSession> {
        self.sessions.get(conversation_id)
    }

    /// Every open session.
    pub fn sessions(&self) -> impl Iterator<Item = &ChatSession> {
        self.sessions.values()
    }

    /// The foreground session, if any.
    #[must_use]
    pub const fn foreground(&self) -> Option<&ConversationId> {
        self.foreground.as_ref()
    }

    /// Unread messages that matched no open session.
    #[must_use]
    pub const fn global_unread(&self) -> usize {
        self.global_unread
    }

    /// Unread messages across everything.
    #[must_use]
    pub fn total_unread(&self) -> usize {
        self.global_unread + self.sessions.values().map(ChatSession::unread).sum::<usize>()
    }

    /// Whether `party` was last reported online.
    #[must_use]
    pub fn is_online(&self, party: &PartyRef) -> bool {
        self.online.contains(party)
    }

    /// Land a history page (or its failure).
    ///
    /// Results for a session closed in the meantime are discarded.
    pub fn apply_history(
        &mut self,
        conversation_id: &ConversationId,
        liveness: &Liveness,
        page: Result<Vec<Message>, String>,
    ) -> bool {
        if !liveness.is_alive() {
            tracing::debug!(conversation = %conversation_id, "discarding history for closed session");
            return false;
        }
        let Some(session) = self.sessions.get_mut(conversation_id) else {
            return false;
        };

        match page {
            Ok(page) => {
                let count = session.apply_history(page);
                tracing::debug!(conversation = %conversation_id, count, "history loaded");
                self.emit(ChatEvent::HistoryLoaded {
                    conversation_id: conversation_id.clone(),
                    count,
                });
            }
            Err(reason) => {
                session.history_unavailable();
                tracing::warn!(conversation = %conversation_id, reason = %reason, "history unavailable");
                self.emit(ChatEvent::HistoryFailed {
                    conversation_id: conversation_id.clone(),
                    reason,
                });
            }
        }
        true
    }

    /// Append an optimistic outgoing message as pending.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoSession`] if its conversation is not open.
    pub fn append_outgoing(&mut self, message: Message) -> Result<(), ChatError> {
        let session = self
            .sessions
            .get_mut(&message.conversation_id)
            .ok_or_else(|| ChatError::NoSession(message.conversation_id.clone()))?;
        session.push_outgoing(message.clone());
        self.emit(ChatEvent::MessageAppended {
            message,
            status: MessageStatus::Pending,
        });
        Ok(())
    }

    /// Reconcile a `message_sent` confirmation.
    pub fn confirm_sent(&mut self, message: &Message, client_id: Option<&MessageId>) -> bool {
        let conversation_id = &message.conversation_id;
        let Some(session) = self.sessions.get_mut(conversation_id) else {
            return false;
        };
        let Some(provisional) = session.confirm(client_id, message) else {
            tracing::debug!(conversation = %conversation_id, id = %message.id, "confirmation matched nothing");
            return false;
        };

        tracing::debug!(provisional = %provisional, assigned = %message.id, "message confirmed");
        if provisional != message.id {
            self.emit(ChatEvent::IdReconciled {
                conversation_id: conversation_id.clone(),
                provisional,
                assigned: message.id.clone(),
            });
        }
        self.emit(ChatEvent::StatusChanged {
            conversation_id: conversation_id.clone(),
            message_id: message.id.clone(),
            status: MessageStatus::Sent,
        });
        true
    }

    /// Mark a still-pending message failed.
    pub fn expire_pending(
        &mut self,
        conversation_id: &ConversationId,
        id: &MessageId,
        reason: &str,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(conversation_id) else {
            return false;
        };
        if !session.fail(id, reason) {
            return false;
        }
        tracing::warn!(conversation = %conversation_id, id = %id, reason, "message failed");
        self.emit(ChatEvent::StatusChanged {
            conversation_id: conversation_id.clone(),
            message_id: id.clone(),
            status: MessageStatus::Failed(reason.to_string()),
        });
        true
    }

    /// Route an incoming message.
    ///
    /// `page_active` says whether the page is visible and focused; a
    /// session only counts as foreground while it does.
    pub fn receive(&mut self, message: Message, local: &PartyRef, page_active: bool) -> Delivery {
        let conversation_id = message.conversation_id.clone();
        let is_foreground = page_active && self.foreground.as_ref() == Some(&conversation_id);

        let Some(session) = self.sessions.get_mut(&conversation_id) else {
            let counted = message.is_addressed_to(local);
            if counted {
                self.global_unread += 1;
                tracing::debug!(conversation = %conversation_id, "message for unopened conversation");
                self.emit(ChatEvent::UnreadChanged {
                    conversation_id: None,
                    total: self.total_unread(),
                });
            }
            return Delivery::Unmatched { counted };
        };

        let foreground = is_foreground && session.state() != SessionState::Minimized;
        let before = session.unread();
        let was_typing = session.is_typing(&message.sender);
        let sender = message.sender.clone();
        session.push_incoming(message, foreground);
        let unread_changed = session.unread() != before;

        if was_typing {
            self.emit(ChatEvent::TypingChanged {
                conversation_id: conversation_id.clone(),
                party: sender,
                typing: false,
            });
        }
        let appended = self
            .sessions
            .get(&conversation_id)
            .and_then(|s| s.messages().last())
            .cloned();
        if let Some(held) = appended {
            self.emit(ChatEvent::MessageAppended {
                message: held.message,
                status: held.status,
            });
        }
        if unread_changed {
            self.emit(ChatEvent::UnreadChanged {
                conversation_id: Some(conversation_id),
                total: self.total_unread(),
            });
        }
        Delivery::Appended { foreground }
    }

    /// Mark a session's incoming messages read. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NoSession`] if it is not open.
    pub fn mark_read(&mut self, conversation_id: &ConversationId) -> Result<usize, ChatError> {
        let session = self
            .sessions
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::NoSession(conversation_id.clone()))?;
        let had_unread = session.unread() > 0;
        let changed = session.mark_all_read(Timestamp::now());
        if had_unread {
            self.emit(ChatEvent::UnreadChanged {
                conversation_id: Some(conversation_id.clone()),
                total: self.total_unread(),
            });
        }
        Ok(changed)
    }

    /// The contact read our messages in a conversation.
    pub fn mark_read_by_peer(
        &mut self,
        conversation_id: &ConversationId,
        reader: &PartyRef,
        at: Timestamp,
    ) -> usize {
        let Some(session) = self.sessions.get_mut(conversation_id) else {
            return 0;
        };
        let ids = session.mark_read_by_peer(reader, at);
        let count = ids.len();
        for message_id in ids {
            self.emit(ChatEvent::StatusChanged {
                conversation_id: conversation_id.clone(),
                message_id,
                status: MessageStatus::Read,
            });
        }
        count
    }

    /// A remote party started or stopped typing. Applies to every session
    /// with that contact.
    pub fn set_typing(&mut self, party: &PartyRef, typing: bool) -> bool {
        let mut changed = Vec::new();
        for (conversation_id, session) in &mut self.sessions {
            if session.contact() == party && session.set_typing(party, typing) {
                changed.push(conversation_id.clone());
            }
        }
        let any = !changed.is_empty();
        for conversation_id in changed {
            self.emit(ChatEvent::TypingChanged {
                conversation_id,
                party: party.clone(),
                typing,
            });
        }
        any
    }

    /// A party came online or went offline.
    pub fn set_presence(&mut self, party: &PartyRef, online: bool) {
        let changed = if online {
            self.online.insert(party.clone())
        } else {
            self.online.remove(party)
        };
        if changed {
            self.emit(ChatEvent::PresenceChanged {
                party: party.clone(),
                online,
            });
        }
    }

    /// The local party typed in a session. Returns the contact to signal
    /// and the signal, if one is due.
    pub fn typing_input(
        &mut self,
        conversation_id: &ConversationId,
        now: Instant,
    ) -> Option<(PartyRef, TypingSignal)> {
        let session = self.sessions.get_mut(conversation_id)?;
        let signal = session.typing_input(now)?;
        Some((session.contact().clone(), signal))
    }

    /// Stop the local typing indicator in a session. Returns the contact
    /// to send `stop_typing` to, if one was showing.
    pub fn typing_stop(&mut self, conversation_id: &ConversationId) -> Option<PartyRef> {
        let session = self.sessions.get_mut(conversation_id)?;
        session.typing_stop()?;
        Some(session.contact().clone())
    }

    /// Report a connection state change.
    pub fn connection_changed(&self, state: ConnectionState) {
        self.emit(ChatEvent::Connection(state));
    }

    /// Typing indicators that went idle by `now`.
    pub fn typing_expired(&mut self, now: Instant) -> Vec<PartyRef> {
        self.sessions
            .values_mut()
            .filter_map(|s| {
                s.typing_poll(now)
                    .filter(|signal| *signal == TypingSignal::Stop)
                    .map(|_| s.contact().clone())
            })
            .collect()
    }

    fn emit(&self, event: ChatEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::warn!(err = %e, "chat event dropped");
        }
    }
}
