//! State of one open conversation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use carechat_proto::contact::ContactResolver;
use carechat_proto::conversation::ConversationId;
use carechat_proto::message::{Message, MessageId, MessageStatus, Timestamp};
use carechat_proto::party::PartyRef;
use tokio::time::Instant;

use super::typing::{TypingDebouncer, TypingSignal};

/// Visible state of a session. A closed session no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, history not yet loaded.
    Opening,
    /// Shown and interactive.
    Open,
    /// Collapsed; messages still arrive but count as unread.
    Minimized,
}

/// Shared flag telling background work whether its session still exists.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether the session is still open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A message as a session holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    /// The message.
    pub message: Message,
    /// Delivery status.
    pub status: MessageStatus,
}

/// One open conversation between the local party and a contact.
///
/// The message list is append-only apart from the history page, which is
/// placed before anything that arrived while it was loading.
#[derive(Debug)]
pub struct ChatSession {
    local: PartyRef,
    contact: PartyRef,
    conversation_id: ConversationId,
    room: String,
    state: SessionState,
    messages: Vec<SessionMessage>,
    typing: BTreeSet<PartyRef>,
    unread: usize,
    liveness: Liveness,
    outbound_typing: TypingDebouncer,
}

impl ChatSession {
    /// Create a session in the `Opening` state.
    #[must_use]
    pub fn new(local: PartyRef, contact: PartyRef, typing_timeout: Duration) -> Self {
        let conversation_id = ConversationId::between(&local, &contact);
        let room = ContactResolver::conversation_room(&local, &contact);
        Self {
            local,
            contact,
            conversation_id,
            room,
            state: SessionState::Opening,
            messages: Vec::new(),
            typing: BTreeSet::new(),
            unread: 0,
            liveness: Liveness::new(),
            outbound_typing: TypingDebouncer::new(typing_timeout),
        }
    }

    /// The signed-in party.
    #[must_use]
    pub const fn local(&self) -> &PartyRef {
        &self.local
    }

    /// The other party.
    #[must_use]
    pub const fn contact(&self) -> &PartyRef {
        &self.contact
    }

    /// Conversation id.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Room joined for this conversation.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Messages in display order (oldest first).
    #[must_use]
    pub fn messages(&self) -> &[SessionMessage] {
        &self.messages
    }

    /// Unread incoming messages.
    #[must_use]
    pub const fn unread(&self) -> usize {
        self.unread
    }

    /// Whether `party` is currently typing.
    #[must_use]
    pub fn is_typing(&self, party: &PartyRef) -> bool {
        self.typing.contains(party)
    }

    /// Remote parties currently typing.
    pub fn typing(&self) -> impl Iterator<Item = &PartyRef> {
        self.typing.iter()
    }

    /// Handle for background work that must not outlive the session.
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Place a history page before any live messages.
    ///
    /// `page` is most-recent-first. Messages from other conversations and
    /// ids already present are skipped. Returns how many were added.
    pub fn apply_history(&mut self, page: Vec<Message>) -> usize {
        let mut older: Vec<SessionMessage> = page
            .into_iter()
            .rev()
            .filter(|m| m.conversation_id == self.conversation_id)
            .filter(|m| !self.messages.iter().any(|held| held.message.id == m.id))
            .map(|message| SessionMessage {
                status: history_status(&message, &self.local),
                message,
            })
            .collect();
        let added = older.len();

        older.append(&mut self.messages);
        self.messages = older;
        if self.state == SessionState::Opening {
            self.state = SessionState::Open;
        }
        added
    }

    /// History could not be loaded; show the session empty.
    pub fn history_unavailable(&mut self) {
        if self.state == SessionState::Opening {
            self.state = SessionState::Open;
        }
    }

    /// Append a locally built message as pending.
    pub fn push_outgoing(&mut self, message: Message) {
        self.messages.push(SessionMessage {
            message,
            status: MessageStatus::Pending,
        });
    }

    /// Reconcile a server confirmation with the optimistic copy.
    ///
    /// Matches on `client_id` when the server echoed it, else on the
    /// oldest pending message with the same content. Returns the
    /// provisional id that was replaced.
    pub fn confirm(&mut self, client_id: Option<&MessageId>, server: &Message) -> Option<MessageId> {
        let index = client_id
            .and_then(|id| self.messages.iter().position(|m| &m.message.id == id))
            .or_else(|| {
                self.messages.iter().position(|m| {
                    m.message.id.is_provisional()
                        && m.message.is_from(&self.local)
                        && m.message.content == server.content
                })
            })?;

        let held = &mut self.messages[index];
        let provisional = held.message.id.clone();
        held.message.reconcile_id(server.id.clone());
        if matches!(held.status, MessageStatus::Pending | MessageStatus::Failed(_)) {
            held.status = MessageStatus::Sent;
        }
        Some(provisional)
    }

    /// Mark a pending message failed. Confirmed messages are left alone.
    pub fn fail(&mut self, id: &MessageId, reason: &str) -> bool {
        match self.messages.iter_mut().find(|m| &m.message.id == id) {
            Some(held) if held.status == MessageStatus::Pending => {
                held.status = MessageStatus::Failed(reason.to_string());
                true
            }
            _ => false,
        }
    }

    /// Status of a message, if held.
    #[must_use]
    pub fn status_of(&self, id: &MessageId) -> Option<&MessageStatus> {
        self.messages
            .iter()
            .find(|m| &m.message.id == id)
            .map(|m| &m.status)
    }

    /// Append an incoming message.
    ///
    /// Returns `false` if it belongs to another conversation. In the
    /// foreground the message is marked read on arrival; otherwise it
    /// counts as unread.
    pub fn push_incoming(&mut self, mut message: Message, foreground: bool) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        self.typing.remove(&message.sender);

        let incoming = !message.is_from(&self.local);
        if incoming {
            if foreground {
                message.mark_read(Timestamp::now());
            } else if message.read_at.is_none() {
                self.unread += 1;
            }
        }
        let status = history_status(&message, &self.local);
        self.messages.push(SessionMessage { message, status });
        true
    }

    /// Mark every incoming message read. Returns how many changed.
    pub fn mark_all_read(&mut self, at: Timestamp) -> usize {
        let mut changed = 0;
        for held in &mut self.messages {
            if !held.message.is_from(&self.local) && held.message.mark_read(at) {
                changed += 1;
            }
        }
        self.unread = 0;
        changed
    }

    /// The contact read our messages. Returns the ids now `Read`.
    pub fn mark_read_by_peer(&mut self, reader: &PartyRef, at: Timestamp) -> Vec<MessageId> {
        if reader != &self.contact {
            return Vec::new();
        }
        self.messages
            .iter_mut()
            .filter(|m| m.message.is_from(&self.local) && m.status == MessageStatus::Sent)
            .map(|m| {
                m.message.mark_read(at);
                m.status = MessageStatus::Read;
                m.message.id.clone()
            })
            .collect()
    }

    /// Update a remote typing flag. Returns whether it changed.
    pub fn set_typing(&mut self, party: &PartyRef, typing: bool) -> bool {
        if typing {
            self.typing.insert(party.clone())
        } else {
            self.typing.remove(party)
        }
    }

    /// Switch between open and minimized. No effect while opening.
    pub fn toggle_minimized(&mut self) -> SessionState {
        self.state = match self.state {
            SessionState::Open => SessionState::Minimized,
            SessionState::Minimized => SessionState::Open,
            SessionState::Opening => SessionState::Opening,
        };
        self.state
    }

    /// Bring a minimized session back.
    pub fn reveal(&mut self) {
        if self.state == SessionState::Minimized {
            self.state = SessionState::Open;
        }
    }

    /// The local party pressed a key.
    pub fn typing_input(&mut self, now: Instant) -> Option<TypingSignal> {
        self.outbound_typing.on_input(now)
    }

    /// Check the typing idle timeout.
    pub fn typing_poll(&mut self, now: Instant) -> Option<TypingSignal> {
        self.outbound_typing.poll(now)
    }

    /// Stop the typing indicator now.
    pub fn typing_stop(&mut self) -> Option<TypingSignal> {
        self.outbound_typing.stop()
    }

    /// Tear down: pending history fetches will be discarded.
    pub fn close(&mut self) {
        self.liveness.kill();
    }
}

fn history_status(message: &Message, local: &PartyRef) -> MessageStatus {
    if message.is_from(local) && message.read_at.is_some() {
        MessageStatus::Read
    } else {
        MessageStatus::Sent
    }
}

#[cfg(test)]
mod tests {
    use carechat_proto::message::MessageKind;
    use carechat_proto::party::PartyType;

    use super::*;

    fn local() -> PartyRef {
        PartyRef::new("7", PartyType::User)
    }

    fn contact() -> PartyRef {
        PartyRef::new("42", PartyType::Caregiver)
    }

    fn msg(id: &str, from: &PartyRef, to: &PartyRef, content: &str) -> Message {
        Message {
            id: MessageId::parse(id),
            sender: from.clone(),
            sender_name: None,
            recipient: to.clone(),
            content: content.into(),
            kind: MessageKind::Text,
            created_at: Timestamp::from_millis(1_700_000_000_000),
            read_at: None,
            conversation_id: ConversationId::between(from, to),
        }
    }

    fn session() -> ChatSession {
        ChatSession::new(local(), contact(), Duration::from_secs(3))
    }

    #[test]
    fn history_is_reversed_and_placed_before_live() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Opening);
        assert_eq!(s.room(), "caregiver_42_user_7");

        s.push_incoming(msg("live", &contact(), &local(), "live"), true);
        let page = vec![
            msg("3", &contact(), &local(), "newest"),
            msg("live", &contact(), &local(), "live"),
            msg("1", &local(), &contact(), "oldest"),
            msg("x", &contact(), &PartyRef::new("9", PartyType::User), "elsewhere"),
        ];
        assert_eq!(s.apply_history(page), 2);
        assert_eq!(s.state(), SessionState::Open);

        let contents: Vec<&str> = s.messages().iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(contents, vec!["oldest", "newest", "live"]);
    }

    #[test]
    fn confirm_reconciles_by_client_id() {
        let mut s = session();
        let mut out = msg("ignored", &local(), &contact(), "hi");
        out.id = MessageId::provisional();
        let provisional = out.id.clone();
        s.push_outgoing(out);
        assert_eq!(s.status_of(&provisional), Some(&MessageStatus::Pending));

        let server = msg("srv-1", &local(), &contact(), "hi");
        assert_eq!(s.confirm(Some(&provisional), &server), Some(provisional.clone()));
        assert_eq!(s.status_of(&provisional), None);
        assert_eq!(
            s.status_of(&MessageId::parse("srv-1")),
            Some(&MessageStatus::Sent)
        );
    }

    #[test]
    fn confirm_falls_back_to_content() {
        let mut s = session();
        let mut out = msg("ignored", &local(), &contact(), "hello");
        out.id = MessageId::provisional();
        s.push_outgoing(out);

        let server = msg("srv-2", &local(), &contact(), "hello");
        assert!(s.confirm(None, &server).is_some());
        assert_eq!(s.messages()[0].message.id, MessageId::parse("srv-2"));
        assert!(s.confirm(None, &msg("srv-3", &local(), &contact(), "other")).is_none());
    }

    #[test]
    fn fail_only_touches_pending() {
        let mut s = session();
        let mut out = msg("ignored", &local(), &contact(), "hi");
        out.id = MessageId::provisional();
        let id = out.id.clone();
        s.push_outgoing(out);

        assert!(s.fail(&id, "no confirmation from server"));
        assert!(!s.fail(&id, "again"));
        assert_eq!(
            s.status_of(&id),
            Some(&MessageStatus::Failed("no confirmation from server".into()))
        );

        // A late confirmation still wins.
        s.confirm(Some(&id), &msg("srv", &local(), &contact(), "hi"));
        assert_eq!(
            s.status_of(&MessageId::parse("srv")),
            Some(&MessageStatus::Sent)
        );
    }

    #[test]
    fn incoming_outside_conversation_is_ignored() {
        let mut s = session();
        let stranger = PartyRef::new("1", PartyType::Admin);
        assert!(!s.push_incoming(msg("a", &stranger, &local(), "hey"), false));
        assert!(s.messages().is_empty());
        assert_eq!(s.unread(), 0);
    }

    #[test]
    fn background_messages_count_as_unread() {
        let mut s = session();
        s.set_typing(&contact(), true);
        assert!(s.push_incoming(msg("a", &contact(), &local(), "one"), false));
        assert!(s.push_incoming(msg("b", &contact(), &local(), "two"), false));
        assert_eq!(s.unread(), 2);
        assert!(!s.is_typing(&contact()));

        assert!(s.push_incoming(msg("c", &contact(), &local(), "three"), true));
        assert_eq!(s.unread(), 2);
        assert!(s.messages()[2].message.read_at.is_some());

        assert_eq!(s.mark_all_read(Timestamp::now()), 2);
        assert_eq!(s.unread(), 0);
    }

    #[test]
    fn peer_read_receipt_marks_sent_messages() {
        let mut s = session();
        s.push_incoming(msg("srv-1", &local(), &contact(), "mine"), true);
        let mut pending = msg("x", &local(), &contact(), "pending");
        pending.id = MessageId::provisional();
        s.push_outgoing(pending);

        let stranger = PartyRef::new("1", PartyType::Admin);
        assert!(s.mark_read_by_peer(&stranger, Timestamp::now()).is_empty());

        let read = s.mark_read_by_peer(&contact(), Timestamp::from_millis(5));
        assert_eq!(read, vec![MessageId::parse("srv-1")]);
        assert_eq!(s.messages()[0].status, MessageStatus::Read);
        assert_eq!(s.messages()[1].status, MessageStatus::Pending);
    }

    #[test]
    fn minimize_toggles_and_close_kills_liveness() {
        let mut s = session();
        assert_eq!(s.toggle_minimized(), SessionState::Opening);
        s.history_unavailable();
        assert_eq!(s.toggle_minimized(), SessionState::Minimized);
        s.reveal();
        assert_eq!(s.state(), SessionState::Open);

        let liveness = s.liveness();
        assert!(liveness.is_alive());
        s.close();
        assert!(!liveness.is_alive());
    }
}
