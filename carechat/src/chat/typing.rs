//! Outbound typing indicator debounce.
//!
//! Emits one `typing` when the local party starts typing and one
//! `stop_typing` once input has been idle for the configured timeout, or
//! when the message is sent.

use std::time::Duration;

use tokio::time::Instant;

/// What to tell the contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    /// Emit `typing`.
    Start,
    /// Emit `stop_typing`.
    Stop,
}

/// Debounces keystrokes into start/stop signals.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    timeout: Duration,
    last_input: Option<Instant>,
}

impl TypingDebouncer {
    /// Create a debouncer that stops after `timeout` of idle input.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_input: None,
        }
    }

    /// Whether a `typing` has been signalled without a matching stop.
    #[must_use]
    pub const fn is_typing(&self) -> bool {
        self.last_input.is_some()
    }

    /// Record a keystroke at `now`.
    pub fn on_input(&mut self, now: Instant) -> Option<TypingSignal> {
        let started = self.last_input.is_none();
        self.last_input = Some(now);
        started.then_some(TypingSignal::Start)
    }

    /// Check the idle timeout at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        let last = self.last_input?;
        if now.saturating_duration_since(last) >= self.timeout {
            self.last_input = None;
            Some(TypingSignal::Stop)
        } else {
            None
        }
    }

    /// Stop immediately (message sent, session closed).
    pub fn stop(&mut self) -> Option<TypingSignal> {
        self.last_input.take().map(|_| TypingSignal::Stop)
    }
}
