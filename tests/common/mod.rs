#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use vitals_stream::stream::proto::{decode, encode, Frame, OpCode};
use vitals_stream::stream::transport::{
    CloseInfo, Connector, Transport, TransportError, TransportEvent,
};
use vitals_stream::{ConnectionState, StreamConfig};

pub const TEST_TOKEN: &str = "test-credential";

pub fn test_config() -> StreamConfig {
    StreamConfig::new(SecretString::new(TEST_TOKEN.to_string()))
        .with_endpoint("memory://vitals")
        .with_handshake_grace(Duration::from_secs(60))
}

/// Server side of one in-memory connection.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<Result<TransportEvent, TransportError>>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl ServerEnd {
    pub fn send_frame(&self, frame: &Frame) {
        self.send_text(&encode(frame));
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(Ok(TransportEvent::Text(text.to_string())));
    }

    pub fn send_hello(&self, interval_ms: i64) {
        self.send_frame(&Frame::hello(interval_ms));
    }

    pub fn send_ready(&self) {
        self.send_frame(&Frame::control(OpCode::Ready));
    }

    pub fn close_with(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(Ok(TransportEvent::Closed(Some(CloseInfo {
            code,
            reason: reason.to_string(),
        }))));
    }

    pub fn fail(&self, detail: &str) {
        let _ = self
            .to_client
            .send(Err(TransportError::Other(detail.to_string())));
    }

    /// Waits for the next frame sent by the client.
    pub async fn next_frame(&mut self) -> Frame {
        let text = timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client transport dropped");
        decode(&text).expect("client sent a malformed frame")
    }

    /// Returns every frame the client has sent so far.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            frames.push(decode(&text).expect("client sent a malformed frame"));
        }
        frames
    }

    pub fn heartbeats_sent(&mut self) -> usize {
        self.drain_frames()
            .iter()
            .filter(|frame| frame.op == OpCode::Heartbeat)
            .count()
    }

    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Consumes the auth frame and completes the handshake.
    pub async fn complete_handshake(&mut self, interval_ms: i64) {
        let identify = self.next_frame().await;
        assert_eq!(identify.op, OpCode::Identify);
        self.send_hello(interval_ms);
        self.send_ready();
    }
}

struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<Result<TransportEvent, TransportError>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector that hands each accepted connection's server end to the test.
pub struct ChannelConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    hang: bool,
}

impl ChannelConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accepted,
                hang: false,
            }),
            rx,
        )
    }

    /// Connector whose `open` never completes.
    pub fn hanging() -> Arc<Self> {
        let (accepted, _) = mpsc::unbounded_channel();
        Arc::new(Self {
            accepted,
            hang: true,
        })
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn open(&self, _endpoint: &str) -> Result<Box<dyn Transport>, TransportError> {
        if self.hang {
            std::future::pending::<()>().await;
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let server = ServerEnd {
            to_client,
            from_client,
            closed: Arc::clone(&closed),
        };
        self.accepted
            .send(server)
            .map_err(|_| TransportError::Other("test dropped the acceptor".to_string()))?;
        Ok(Box::new(ChannelTransport {
            outbound,
            inbound,
            closed,
        }))
    }
}

pub async fn accept(accepted: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    timeout(Duration::from_secs(5), accepted.recv())
        .await
        .expect("timed out waiting for connection")
        .expect("connector dropped")
}

pub async fn wait_for_state<F>(states: &mut watch::Receiver<ConnectionState>, predicate: F)
where
    F: FnMut(&ConnectionState) -> bool,
{
    timeout(Duration::from_secs(5), states.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}
