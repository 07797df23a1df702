//! Terminal notification sink.
//!
//! Toasts print to stderr, the tone is the terminal bell. Desktop
//! notifications and vibration are not available in a terminal.

use std::io::Write;

use super::{DesktopNotification, NotificationSink, Toast, ToastKind, Tone};

/// Writes notifications to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalSink;

impl TerminalSink {
    fn write(line: &str) {
        let mut err = std::io::stderr().lock();
        if let Err(e) = writeln!(err, "{line}") {
            tracing::debug!(err = %e, "failed to write notification");
        }
    }
}

const fn marker(kind: ToastKind) -> &'static str {
    match kind {
        ToastKind::Error => "[error]",
        ToastKind::Message => "[new]",
    }
}

impl NotificationSink for TerminalSink {
    fn toast(&self, toast: &Toast) {
        Self::write(&format!("{} {}: {}", marker(toast.kind), toast.title, toast.body));
    }

    fn desktop(&self, _notification: &DesktopNotification) -> bool {
        false
    }

    fn tone(&self, _tone: &Tone) -> bool {
        let mut err = std::io::stderr().lock();
        err.write_all(b"\x07").and_then(|()| err.flush()).is_ok()
    }

    fn vibrate(&self, _pattern: &[u32]) -> bool {
        false
    }

    fn badge(&self, count: usize) {
        if count > 0 {
            Self::write(&format!("[unread] {count}"));
        }
    }
}
