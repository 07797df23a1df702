//! In-process connector for testing.
//!
//! Each [`LoopbackConnector::accept_next`] call queues one socket; the
//! next `connect()` hands out the client end and the test drives the
//! [`LoopbackServer`] end. With nothing queued, `connect()` fails as if
//! the server were down.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use carechat_proto::codec;
use carechat_proto::event::{ClientEvent, ServerEvent};

use super::{Connector, Link, TransportError};

#[derive(Default)]
struct Inner {
    pending: Mutex<VecDeque<LoopbackLink>>,
    attempts: Mutex<Vec<Instant>>,
}

/// Connector backed by in-memory channels. Clones share state.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    inner: Arc<Inner>,
}

impl LoopbackConnector {
    /// Create a connector with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one socket for the next connect attempt.
    #[must_use]
    pub fn accept_next(&self) -> LoopbackServer {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        self.inner.pending.lock().push_back(LoopbackLink {
            to_server,
            from_server,
        });
        LoopbackServer {
            to_client,
            from_client,
        }
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.inner.attempts.lock().len()
    }

    /// When each connect attempt happened.
    #[must_use]
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.inner.attempts.lock().clone()
    }
}

impl Connector for LoopbackConnector {
    type Link = LoopbackLink;

    async fn connect(&self) -> Result<LoopbackLink, TransportError> {
        self.inner.attempts.lock().push(Instant::now());
        self.inner
            .pending
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Unreachable("loopback: nothing accepting".to_string()))
    }
}

/// Client end of a loopback socket.
pub struct LoopbackLink {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

impl Link for LoopbackLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.to_server
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.from_server.close();
        // Swap in a dead sender so the server end sees the close.
        let (dead, _) = mpsc::unbounded_channel();
        self.to_server = dead;
    }
}

/// Server end of a loopback socket, driven by tests.
///
/// Dropping it closes the socket from the server side.
pub struct LoopbackServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl LoopbackServer {
    /// Push an event to the client. Returns `false` if the client is gone.
    pub fn send(&self, event: &ServerEvent) -> bool {
        match codec::encode_server(event) {
            Ok(frame) => self.send_raw(frame),
            Err(_) => false,
        }
    }

    /// Push a raw frame to the client.
    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(frame.into()).is_ok()
    }

    /// Next event from the client; `None` once the client closed.
    /// Undecodable frames are skipped.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            let frame = self.from_client.recv().await?;
            if let Ok(event) = codec::decode_client(&frame) {
                return Some(event);
            }
        }
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        while let Ok(frame) = self.from_client.try_recv() {
            if let Ok(event) = codec::decode_client(&frame) {
                return Some(event);
            }
        }
        None
    }
}
