//! WebSocket connector for the chat server.
//!
//! Text frames carry the JSON event envelope. Ping/pong is answered by
//! tungstenite itself; binary frames are ignored.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{Connector, Link, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections to a fixed `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// Create a connector for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the URL does not parse or
    /// is not `ws`/`wss`.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}', expected ws or wss"
            ))),
        }
    }

    /// The socket URL.
    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

impl Connector for WsConnector {
    type Link = WsLink;

    async fn connect(&self) -> Result<WsLink, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            tracing::warn!(url = %self.url, err = %e, "chat socket connect failed");
            map_ws_connect_error(e)
        })?;
        tracing::info!(url = %self.url, "chat socket open");
        Ok(WsLink { stream })
    }
}

/// An open WebSocket to the chat server.
pub struct WsLink {
    stream: WsStream,
}

impl Link for WsLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "server closed chat socket");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Protocol(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(err = %e, "error closing chat socket");
        }
    }
}

fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
        WsError::Http(response) => {
            TransportError::Unreachable(format!("HTTP status {}", response.status()))
        }
        other => TransportError::Protocol(other.to_string()),
    }
}
