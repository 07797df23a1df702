//! Notification dispatcher.
//!
//! Turns an incoming message into some combination of an in-page toast,
//! a desktop notification, a tone and a vibration. The toast always
//! shows; the rest depend on permission and on the sound/vibration
//! preferences, which are read from the local store on every dispatch so
//! a toggle applies to the next event. Nothing is queued or retried.
//!
//! Output goes through a [`NotificationSink`]:
//! - [`terminal::TerminalSink`]: stderr toasts and the terminal bell
//! - [`RecordingSink`]: records everything, for tests

pub mod terminal;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use carechat_proto::message::Message;

use crate::config::NotificationConfig;
use crate::storage::LocalStore;

/// Desktop notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    /// Never asked.
    #[default]
    Default,
    /// Granted by the user.
    Granted,
    /// Refused by the user.
    Denied,
}

/// Visibility and focus of the page hosting the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageState {
    /// The page is visible.
    pub visible: bool,
    /// The window has input focus.
    pub focused: bool,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            visible: true,
            focused: true,
        }
    }
}

impl PageState {
    /// Visible and focused: the user is looking at it.
    #[must_use]
    pub const fn is_active(self) -> bool {
        self.visible && self.focused
    }
}

/// Toast styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    /// Something failed.
    Error,
    /// An incoming chat message.
    Message,
}

/// In-page transient notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    /// Heading.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Styling.
    pub kind: ToastKind,
    /// How long it stays up.
    pub duration: Duration,
}

/// Native desktop notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopNotification {
    /// Heading.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Replacement tag; a newer notification with the same tag replaces
    /// the older one.
    pub tag: String,
}

/// Short synthesized tone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tone {
    /// Frequencies played in sequence.
    pub frequencies_hz: Vec<u32>,
    /// Duration of each frequency.
    pub step: Duration,
}

/// Where notifications end up.
///
/// Methods returning `bool` report whether the output was actually
/// produced; `false` means the device does not support it.
pub trait NotificationSink: Send + Sync + 'static {
    /// Show an in-page toast.
    fn toast(&self, toast: &Toast);

    /// Show a desktop notification.
    fn desktop(&self, notification: &DesktopNotification) -> bool;

    /// Play a tone.
    fn tone(&self, tone: &Tone) -> bool;

    /// Vibrate with an on/off pattern in milliseconds.
    fn vibrate(&self, pattern: &[u32]) -> bool;

    /// Show the unread badge count.
    fn badge(&self, count: usize);

    /// Remove every toast still showing.
    fn clear_toasts(&self) {}
}

/// Which outputs a dispatch would use, given current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    /// In-page toast (always).
    pub toast: bool,
    /// Desktop notification (permission granted).
    pub desktop: bool,
    /// Tone (sound preference on).
    pub tone: bool,
    /// Vibration (vibration preference on).
    pub vibrate: bool,
}

/// What a dispatch actually produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dispatched {
    /// Toast shown.
    pub toast: bool,
    /// Desktop notification shown.
    pub desktop: bool,
    /// Tone played.
    pub tone: bool,
    /// Device vibrated.
    pub vibrated: bool,
}

/// Decides and delivers notifications.
pub struct NotificationDispatcher<S: NotificationSink> {
    sink: S,
    store: Arc<LocalStore>,
    config: NotificationConfig,
    permission: Mutex<Permission>,
    page: Mutex<PageState>,
}

impl<S: NotificationSink> NotificationDispatcher<S> {
    /// Create a dispatcher. Permission starts as [`Permission::Default`].
    pub fn new(sink: S, store: Arc<LocalStore>, config: NotificationConfig) -> Self {
        Self {
            sink,
            store,
            config,
            permission: Mutex::new(Permission::Default),
            page: Mutex::new(PageState::default()),
        }
    }

    /// The sink.
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Current desktop permission.
    pub fn permission(&self) -> Permission {
        *self.permission.lock()
    }

    /// Record the outcome of a permission prompt.
    pub fn set_permission(&self, permission: Permission) {
        tracing::debug!(?permission, "notification permission set");
        *self.permission.lock() = permission;
    }

    /// Current page state.
    pub fn page_state(&self) -> PageState {
        *self.page.lock()
    }

    /// Update page visibility/focus. Becoming visible clears stale toasts.
    pub fn set_page_state(&self, state: PageState) {
        let previous = std::mem::replace(&mut *self.page.lock(), state);
        if !previous.visible && state.visible {
            self.sink.clear_toasts();
        }
    }

    /// What a dispatch would do right now.
    pub fn plan(&self) -> DispatchPlan {
        DispatchPlan {
            toast: true,
            desktop: self.permission() == Permission::Granted,
            tone: self.store.sound_enabled(),
            vibrate: self.store.vibration_enabled(),
        }
    }

    /// Notify about an incoming message that is not in the foreground.
    pub fn notify_message(&self, message: &Message) -> Dispatched {
        let sender = message
            .sender_name
            .clone()
            .unwrap_or_else(|| message.sender.to_string());
        let title = format!("{sender} sent a message");
        let plan = self.plan();

        self.sink.toast(&Toast {
            title: title.clone(),
            body: message.content.clone(),
            kind: ToastKind::Message,
            duration: self.config.toast_duration,
        });

        let mut out = Dispatched {
            toast: true,
            ..Dispatched::default()
        };
        if plan.desktop {
            out.desktop = self.sink.desktop(&DesktopNotification {
                title,
                body: message.content.clone(),
                tag: format!("message_{}", message.sender.id),
            });
        }
        if plan.tone {
            out.tone = self.sink.tone(&Tone {
                frequencies_hz: self.config.tone_frequencies_hz.clone(),
                step: self.config.tone_step,
            });
        }
        if plan.vibrate {
            out.vibrated = self.sink.vibrate(&self.config.vibration_pattern);
        }

        tracing::debug!(
            sender = %message.sender,
            desktop = out.desktop,
            tone = out.tone,
            vibrated = out.vibrated,
            "message notification dispatched"
        );
        out
    }

    /// Show an error toast.
    pub fn notify_error(&self, title: &str, body: &str) {
        self.system_toast(title, body, ToastKind::Error);
    }

    /// Update the unread badge.
    pub fn update_badge(&self, count: usize) {
        self.sink.badge(count);
    }

    fn system_toast(&self, title: &str, body: &str, kind: ToastKind) {
        self.sink.toast(&Toast {
            title: title.to_string(),
            body: body.to_string(),
            kind,
            duration: self.config.system_toast_duration,
        });
    }
}

/// One call recorded by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// A toast.
    Toast(Toast),
    /// A desktop notification.
    Desktop(DesktopNotification),
    /// A tone.
    Tone(Tone),
    /// A vibration pattern.
    Vibrate(Vec<u32>),
    /// A badge count.
    Badge(usize),
    /// Toasts cleared.
    ClearToasts,
}

/// Sink that records every call. Clones share the record.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<Recorded>>>,
    supports_desktop: bool,
    supports_vibration: bool,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl RecordingSink {
    /// Create a sink with the given device capabilities.
    #[must_use]
    pub fn new(supports_desktop: bool, supports_vibration: bool) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            supports_desktop,
            supports_vibration,
        }
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<Recorded> {
        self.records.lock().clone()
    }

    /// Recorded toasts.
    #[must_use]
    pub fn toasts(&self) -> Vec<Toast> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Toast(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn push(&self, record: Recorded) {
        self.records.lock().push(record);
    }
}

impl NotificationSink for RecordingSink {
    fn toast(&self, toast: &Toast) {
        self.push(Recorded::Toast(toast.clone()));
    }

    fn desktop(&self, notification: &DesktopNotification) -> bool {
        if self.supports_desktop {
            self.push(Recorded::Desktop(notification.clone()));
        }
        self.supports_desktop
    }

    fn tone(&self, tone: &Tone) -> bool {
        self.push(Recorded::Tone(tone.clone()));
        true
    }

    fn vibrate(&self, pattern: &[u32]) -> bool {
        if self.supports_vibration {
            self.push(Recorded::Vibrate(pattern.to_vec()));
        }
        self.supports_vibration
    }

    fn badge(&self, count: usize) {
        self.push(Recorded::Badge(count));
    }

    fn clear_toasts(&self) {
        self.push(Recorded::ClearToasts);
    }
}

#[cfg(test)]
mod tests {
    use carechat_proto::conversation::ConversationId;
    use carechat_proto::message::{MessageId, MessageKind, Timestamp};
    use carechat_proto::party::{PartyRef, PartyType};

    use super::*;

    fn message() -> Message {
        let sender = PartyRef::new("42", PartyType::Caregiver);
        let recipient = PartyRef::new("7", PartyType::User);
        Message {
            id: MessageId::parse("1"),
            conversation_id: ConversationId::between(&sender, &recipient),
            sender,
            sender_name: Some("Cara".into()),
            recipient,
            content: "on my way".into(),
            kind: MessageKind::Text,
            created_at: Timestamp::now(),
            read_at: None,
        }
    }

    fn dispatcher(sink: RecordingSink) -> (NotificationDispatcher<RecordingSink>, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::in_memory());
        let d = NotificationDispatcher::new(sink, Arc::clone(&store), NotificationConfig::default());
        (d, store)
    }

    #[test]
    fn toast_always_desktop_only_when_granted() {
        let sink = RecordingSink::default();
        let (d, _store) = dispatcher(sink.clone());

        let out = d.notify_message(&message());
        assert!(out.toast);
        assert!(!out.desktop);
        assert!(
            !sink
                .records()
                .iter()
                .any(|r| matches!(r, Recorded::Desktop(_)))
        );

        d.set_permission(Permission::Granted);
        let out = d.notify_message(&message());
        assert!(out.desktop);
        let desktop = sink.records().into_iter().find_map(|r| match r {
            Recorded::Desktop(n) => Some(n),
            _ => None,
        });
        assert_eq!(desktop.unwrap().tag, "message_42");

        let toasts = sink.toasts();
        assert_eq!(toasts.len(), 2);
        assert_eq!(toasts[0].title, "Cara sent a message");
        assert_eq!(toasts[0].kind, ToastKind::Message);
        assert_eq!(toasts[0].duration, Duration::from_millis(5000));
    }

    #[test]
    fn preferences_are_read_at_dispatch_time() {
        let sink = RecordingSink::default();
        let (d, store) = dispatcher(sink.clone());

        let out = d.notify_message(&message());
        assert!(out.tone && out.vibrated);

        store.set_sound_enabled(false).unwrap();
        let out = d.notify_message(&message());
        assert!(!out.tone);
        assert!(out.vibrated);

        store.set_vibration_enabled(false).unwrap();
        let out = d.notify_message(&message());
        assert!(!out.vibrated);
        assert_eq!(
            d.plan(),
            DispatchPlan {
                toast: true,
                desktop: false,
                tone: false,
                vibrate: false
            }
        );
    }

    #[test]
    fn unsupported_outputs_are_not_retried() {
        let sink = RecordingSink::new(false, false);
        let (d, _store) = dispatcher(sink.clone());
        d.set_permission(Permission::Granted);

        let out = d.notify_message(&message());
        assert!(!out.desktop);
        assert!(!out.vibrated);
        assert!(out.tone);
        assert_eq!(
            sink.records()
                .iter()
                .filter(|r| matches!(r, Recorded::Tone(_)))
                .count(),
            1
        );
    }

    #[test]
    fn error_toasts_use_system_duration() {
        let sink = RecordingSink::default();
        let (d, _store) = dispatcher(sink.clone());
        d.notify_error("Send failed", "not connected to the chat server");
        let toasts = sink.toasts();
        assert_eq!(toasts[0].kind, ToastKind::Error);
        assert_eq!(toasts[0].duration, Duration::from_millis(8000));
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn becoming_visible_clears_toasts() {
        let sink = RecordingSink::default();
        let (d, _store) = dispatcher(sink.clone());
        d.set_page_state(PageState {
            visible: false,
            focused: false,
        });
        assert!(!d.page_state().is_active());
        d.set_page_state(PageState::default());
        assert_eq!(sink.records(), vec![Recorded::ClearToasts]);
    }
}
