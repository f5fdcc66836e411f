//! Duplex transport abstraction and the websocket implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

/// Errors produced by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Opening the transport did not finish in time.
    #[error("timed out opening transport after {0:?}")]
    OpenTimeout(Duration),

    /// The transport is already closed.
    #[error("transport is closed")]
    Closed,

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// Inbound notification from a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text message.
    Text(String),
    /// The peer closed the link, optionally with a reason.
    Closed(Option<CloseInfo>),
}

/// Close details supplied by the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// Human readable summary used in lifecycle reasons.
    pub fn describe(&self) -> String {
        if self.reason.is_empty() {
            format!("close code {}", self.code)
        } else {
            format!("close code {}: {}", self.code, self.reason)
        }
    }
}

/// Bidirectional message transport.
#[async_trait]
pub trait Transport: Send {
    /// Sends one text message.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Waits for the next inbound event.
    ///
    /// Returns `None` once the underlying link has ended without a close
    /// notification.
    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>>;

    /// Closes the link. Errors are informational; the transport is unusable
    /// afterwards either way.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (socket, _) = connect_async(endpoint).await?;
        Ok(Box::new(WebSocketTransport { socket }))
    }
}

/// Websocket link returned by [`WebSocketConnector`].
pub struct WebSocketTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.socket.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(TransportEvent::Text(text))),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(TransportEvent::Text(text))),
                    Err(err) => {
                        warn!(event = "frame_dropped", error = %err, "binary frame is not utf-8");
                    }
                },
                Ok(Message::Ping(payload)) => {
                    if let Err(err) = self.socket.send(Message::Pong(payload)).await {
                        return Some(Err(err.into()));
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    let info = frame.map(|frame| CloseInfo {
                        code: frame.code.into(),
                        reason: frame.reason.into_owned(),
                    });
                    return Some(Ok(TransportEvent::Closed(info)));
                }
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.socket.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
