//! Connection manager for the chat socket.
//!
//! Owns the one persistent socket to the chat server: connect, authenticate,
//! reconnect with exponential backoff, deliberate disconnect. A single
//! supervisor task holds the socket; everything else talks to it through
//! [`ConnectionManager`] methods and hears back through [`ConnectionEvent`]s.
//!
//! Connectors:
//! - [`ws::WsConnector`]: WebSocket via tokio-tungstenite
//! - [`loopback::LoopbackConnector`]: in-process channels for testing

pub mod loopback;
pub mod ws;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use carechat_proto::codec::{self, CodecError};
use carechat_proto::event::{ClientEvent, ServerEvent};
use carechat_proto::identity::{LocalParty, resolve_local_party};
use carechat_proto::party::PartyType;

use crate::config::ReconnectConfig;
use crate::storage::LocalStore;

/// Lifecycle of the chat socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket, and none being opened.
    Disconnected,
    /// Opening a socket (first attempt or retry).
    Connecting,
    /// Socket open, handshake not (yet) accepted.
    Connected,
    /// Handshake accepted by the server.
    Authenticated,
}

impl ConnectionState {
    /// Whether frames can be written.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Authenticated => write!(f, "authenticated"),
        }
    }
}

/// Errors that can occur at the socket level.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The socket URL is malformed or uses an unsupported scheme.
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),

    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned to callers of [`ConnectionManager`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The socket is not open; nothing was sent.
    #[error("not connected to the chat server")]
    NotConnected,

    /// The event could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// What the connection manager reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A server event arrived, in transport order.
    Server(ServerEvent),
    /// Authentication failed or could not be attempted. The socket stays open.
    AuthFailed(String),
    /// The socket dropped and a retry is scheduled.
    ReconnectScheduled {
        /// Retry number, starting at 1.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// Every retry failed; the manager is now terminally disconnected.
    RetriesExhausted {
        /// Number of retries made.
        attempts: u32,
    },
}

/// Opens sockets to the chat server.
///
/// Implementations only establish the connection; handshake, retry and
/// routing live in [`ConnectionManager`].
pub trait Connector: Send + Sync + 'static {
    /// The socket type produced by [`connect`](Self::connect).
    type Link: Link;

    /// Open a new socket.
    fn connect(&self) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// One open socket carrying JSON text frames.
pub trait Link: Send + 'static {
    /// Write one frame.
    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Read the next frame. `None` means the peer closed the socket.
    ///
    /// Must be cancel-safe: it is raced against outgoing frames.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    /// Close the socket.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    retries: u32,
    /// Rooms to (re)join after every successful handshake.
    rooms: BTreeSet<String>,
    /// Outgoing frames for the live supervisor; `None` when none runs.
    commands: Option<mpsc::UnboundedSender<String>>,
    /// Bumped on every connect/disconnect so stale supervisors go quiet.
    generation: u64,
}

/// The process-wide socket owner.
///
/// Created once by the application context and shared by reference with
/// every chat session.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    config: ReconnectConfig,
    store: Arc<LocalStore>,
    precedence: Arc<[PartyType]>,
    shared: Arc<Mutex<Shared>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager. Nothing connects until [`connect`](Self::connect).
    ///
    /// The credential and local party are read from `store` on every
    /// connect, walking `precedence` in order.
    pub fn new(
        connector: C,
        config: ReconnectConfig,
        store: Arc<LocalStore>,
        precedence: Vec<PartyType>,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(event_buffer.max(1));
        let manager = Self {
            connector: Arc::new(connector),
            config,
            store,
            precedence: precedence.into(),
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                retries: 0,
                rooms: BTreeSet::new(),
                commands: None,
                generation: 0,
            })),
            event_tx,
        };
        (manager, event_rx)
    }

    /// Start connecting. Returns `false` if a connection is already open or
    /// being opened, in which case nothing changes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> bool {
        let (generation, commands) = {
            let mut shared = self.shared.lock();
            if shared.commands.is_some() {
                tracing::debug!(state = %shared.state, "connect ignored, already active");
                return false;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            shared.commands = Some(tx);
            shared.generation += 1;
            shared.retries = 0;
            (shared.generation, rx)
        };

        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            precedence: Arc::clone(&self.precedence),
            shared: Arc::clone(&self.shared),
            event_tx: self.event_tx.clone(),
            generation,
            commands,
        };
        tokio::spawn(supervisor.run());
        true
    }

    /// Close the socket on purpose. No retry follows.
    pub fn disconnect(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.commands.take().is_none() && shared.state == ConnectionState::Disconnected {
                return;
            }
            shared.generation += 1;
            shared.state = ConnectionState::Disconnected;
            shared.retries = 0;
        }
        tracing::info!("disconnected by request");
        let event = ConnectionEvent::StateChanged(ConnectionState::Disconnected);
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            // Full: deliver once the consumer catches up.
            Err(mpsc::error::TrySendError::Full(event)) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let tx = self.event_tx.clone();
                        runtime.spawn(async move {
                            let _ = tx.send(event).await;
                        });
                    }
                    Err(_) => tracing::warn!("event channel full, disconnect not reported"),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("event channel closed, disconnect not reported");
            }
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Consecutive failed attempts since the last successful connect.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.shared.lock().retries
    }

    /// Whether frames can be written right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Write an event to the socket.
    ///
    /// Never waits: fails immediately when the socket is not open.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] if the socket is not open,
    /// or [`ConnectionError::Codec`] if the event cannot be encoded.
    pub fn emit(&self, event: &ClientEvent) -> Result<(), ConnectionError> {
        let commands = {
            let shared = self.shared.lock();
            if !shared.state.is_open() {
                return Err(ConnectionError::NotConnected);
            }
            shared
                .commands
                .clone()
                .ok_or(ConnectionError::NotConnected)?
        };
        let frame = codec::encode_client(event)?;
        commands
            .send(frame)
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Subscribe to `room`, now if authenticated and again after every
    /// future handshake.
    pub fn join(&self, room: &str) {
        let authenticated = {
            let mut shared = self.shared.lock();
            shared.rooms.insert(room.to_string());
            shared.state == ConnectionState::Authenticated
        };
        if authenticated
            && let Err(e) = self.emit(&ClientEvent::Join {
                room: room.to_string(),
            })
        {
            tracing::debug!(room, error = %e, "join deferred until next handshake");
        }
    }

    /// Unsubscribe from `room`.
    pub fn leave(&self, room: &str) {
        let (was_member, authenticated) = {
            let mut shared = self.shared.lock();
            (
                shared.rooms.remove(room),
                shared.state == ConnectionState::Authenticated,
            )
        };
        if was_member
            && authenticated
            && let Err(e) = self.emit(&ClientEvent::Leave {
                room: room.to_string(),
            })
        {
            tracing::debug!(room, error = %e, "leave not sent");
        }
    }

    /// Rooms currently subscribed (or pending subscription).
    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        self.shared.lock().rooms.iter().cloned().collect()
    }
}

/// How a live socket ended.
enum LinkEnd {
    Deliberate,
    Lost(String),
}

/// Background task owning the socket for one connect/disconnect cycle.
struct Supervisor<C: Connector> {
    connector: Arc<C>,
    config: ReconnectConfig,
    store: Arc<LocalStore>,
    precedence: Arc<[PartyType]>,
    shared: Arc<Mutex<Shared>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    generation: u64,
    commands: mpsc::UnboundedReceiver<String>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut exhausted = false;

        loop {
            self.set_state(ConnectionState::Connecting).await;

            let attempt =
                tokio::time::timeout(self.config.connect_timeout, self.connector.connect());
            let Some(result) = interruptible(&mut self.commands, attempt).await else {
                return;
            };

            match result {
                Ok(Ok(link)) => {
                    failures = 0;
                    self.update(|s| s.retries = 0);
                    match self.drive(link).await {
                        LinkEnd::Deliberate => return,
                        LinkEnd::Lost(reason) => {
                            tracing::warn!(reason = %reason, "chat socket lost");
                            self.set_state(ConnectionState::Connecting).await;
                        }
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "chat socket connect failed"),
                Err(_) => tracing::warn!("chat socket connect timed out"),
            }

            failures += 1;
            if failures > self.config.max_retries {
                exhausted = true;
                break;
            }

            let delay = self.config.delay_for(failures);
            if !self.update(|s| s.retries = failures) {
                return;
            }
            tracing::info!(
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnect scheduled"
            );
            self.emit(ConnectionEvent::ReconnectScheduled {
                attempt: failures,
                delay,
            })
            .await;

            if interruptible(&mut self.commands, tokio::time::sleep(delay))
                .await
                .is_none()
            {
                return;
            }
        }

        let current = self.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.commands = None;
        });
        if current && exhausted {
            tracing::error!(
                retries = self.config.max_retries,
                "giving up on chat server"
            );
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected))
                .await;
            self.emit(ConnectionEvent::RetriesExhausted {
                attempts: self.config.max_retries,
            })
            .await;
        }
    }

    /// Run one open socket until it drops or the manager lets go of it.
    async fn drive(&mut self, mut link: C::Link) -> LinkEnd {
        self.set_state(ConnectionState::Connected).await;

        if let Err(e) = self.authenticate(&mut link).await {
            return LinkEnd::Lost(e.to_string());
        }

        loop {
            tokio::select! {
                incoming = link.recv() => match incoming {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.on_frame(&mut link, &frame).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                    }
                    Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                    None => return LinkEnd::Lost("closed by server".to_string()),
                },
                outgoing = self.commands.recv() => match outgoing {
                    Some(frame) => {
                        if let Err(e) = link.send(frame).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                    }
                    None => {
                        link.close().await;
                        return LinkEnd::Deliberate;
                    }
                },
            }
        }
    }

    /// Send the `authenticate` handshake with the stored credential.
    ///
    /// Missing identity or credential is reported, not fatal.
    async fn authenticate(&self, link: &mut C::Link) -> Result<(), TransportError> {
        match resolve_local_party(self.store.as_ref(), &self.precedence) {
            Some(LocalParty {
                party,
                credential: Some(credential),
                ..
            }) => {
                tracing::debug!(party = %party, "sending authenticate");
                let frame = codec::encode_client(&ClientEvent::Authenticate { party, credential })
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                link.send(frame).await
            }
            Some(local) => {
                tracing::warn!(party = %local.party, "no credential stored, staying unauthenticated");
                self.emit(ConnectionEvent::AuthFailed(format!(
                    "no credential stored for {}",
                    local.party
                )))
                .await;
                Ok(())
            }
            None => {
                tracing::warn!("no signed-in party, staying unauthenticated");
                self.emit(ConnectionEvent::AuthFailed("not signed in".to_string()))
                    .await;
                Ok(())
            }
        }
    }

    async fn on_frame(&self, link: &mut C::Link, frame: &str) -> Result<(), TransportError> {
        let event = match codec::decode_server(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable server frame");
                return Ok(());
            }
        };

        match &event {
            ServerEvent::Authenticated { party } => {
                tracing::info!(party = %party, "authenticated with chat server");
                self.set_state(ConnectionState::Authenticated).await;
                let rooms: Vec<String> = self.shared.lock().rooms.iter().cloned().collect();
                for room in rooms {
                    let frame = codec::encode_client(&ClientEvent::Join { room })
                        .map_err(|e| TransportError::Protocol(e.to_string()))?;
                    link.send(frame).await?;
                }
            }
            ServerEvent::AuthError { reason } => {
                tracing::warn!(reason = %reason, "authentication rejected");
                self.emit(ConnectionEvent::AuthFailed(reason.clone())).await;
            }
            _ => {}
        }

        self.emit(ConnectionEvent::Server(event)).await;
        Ok(())
    }

    /// Apply `f` to the shared state if this supervisor is still current.
    fn update(&self, f: impl FnOnce(&mut Shared)) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != self.generation {
            return false;
        }
        f(&mut shared);
        true
    }

    async fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut shared = self.shared.lock();
            if shared.generation != self.generation || shared.state == state {
                false
            } else {
                shared.state = state;
                true
            }
        };
        if changed {
            tracing::debug!(state = %state, "connection state changed");
            self.emit(ConnectionEvent::StateChanged(state)).await;
        }
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("connection event receiver dropped");
        }
    }
}

/// Await `fut` while draining stray outgoing frames. Returns `None` once
/// the manager drops the command channel (deliberate disconnect).
async fn interruptible<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<String>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            cmd = commands.recv() => match cmd {
                Some(_) => tracing::debug!("dropping frame queued while offline"),
                None => return None,
            },
        }
    }
}
