//! Stream client facade and connection worker.
//!
//! [`StreamClient`] is the only type presentation code needs. `connect` spawns
//! a background worker that owns the transport, runs the handshake, forwards
//! heartbeat ticks, and feeds inbound events to the dispatcher. Every state
//! change goes through the transition table in [`crate::stream::state`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::reconnect::with_timeout;
use crate::stream::dispatch::{EventDispatcher, LifecycleChange, MetricKind, MetricSample};
use crate::stream::heartbeat::HeartbeatScheduler;
use crate::stream::proto::{encode, EventFrame, Frame, ServerMessage};
use crate::stream::state::{
    ConnectionMachine, ConnectionState, ErrorReason, Input, SequenceCheck, SessionId,
};
use crate::stream::transport::{
    Connector, Transport, TransportError, TransportEvent, WebSocketConnector,
};

/// Production websocket endpoint for the vitals stream service.
pub const STREAM_ENDPOINT: &str = "wss://ws.tryterra.co/connect";
/// Time allowed between sending the auth frame and reaching `Streaming`.
pub const DEFAULT_HANDSHAKE_GRACE: Duration = Duration::from_secs(10);
/// Upper bound on opening the transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Value sent in the auth frame's `type` field.
pub const DEFAULT_AUTH_TYPE: u8 = 1;

/// Explicit client configuration.
#[derive(Clone)]
pub struct StreamConfig {
    endpoint: String,
    credential: SecretString,
    handshake_grace: Duration,
    connect_timeout: Duration,
    auth_type: u8,
}

impl StreamConfig {
    /// Creates a configuration for the production endpoint.
    pub fn new(credential: SecretString) -> Self {
        Self {
            endpoint: STREAM_ENDPOINT.to_string(),
            credential,
            handshake_grace: DEFAULT_HANDSHAKE_GRACE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_type: DEFAULT_AUTH_TYPE,
        }
    }

    /// Sets an explicit stream endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    pub fn with_credential(mut self, credential: SecretString) -> Self {
        self.credential = credential;
        self
    }

    /// Sets how long the handshake may take after the auth frame is sent.
    pub fn with_handshake_grace(mut self, grace: Duration) -> Self {
        self.handshake_grace = grace;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the opaque `type` value sent with the credential.
    pub fn with_auth_type(mut self, auth_type: u8) -> Self {
        self.auth_type = auth_type;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn handshake_grace(&self) -> Duration {
        self.handshake_grace
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn auth_type(&self) -> u8 {
        self.auth_type
    }

    /// Checks the configuration before a connection is attempted.
    pub fn validate(&self) -> Result<(), StreamClientError> {
        if self.endpoint.trim().is_empty() {
            return Err(StreamClientError::Configuration(
                "endpoint must not be empty".to_string(),
            ));
        }
        if self.handshake_grace.is_zero() {
            return Err(StreamClientError::Configuration(
                "handshake grace period must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(StreamClientError::Configuration(
                "connect timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("endpoint", &self.endpoint)
            .field("credential", &"[REDACTED]")
            .field("handshake_grace", &self.handshake_grace)
            .field("connect_timeout", &self.connect_timeout)
            .field("auth_type", &self.auth_type)
            .finish()
    }
}

/// Errors returned synchronously by the client API.
///
/// Connection-level failures are never returned from here; they surface as
/// [`ConnectionState::Errored`] through lifecycle observers.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Invalid configuration, including an unusable heartbeat interval.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The operation is not available in the current state.
    #[error("operation not allowed while {0}")]
    InvalidState(ConnectionState),
}

enum Command {
    Shutdown,
}

struct Shared {
    machine: Mutex<ConnectionMachine>,
    heartbeat: Mutex<HeartbeatScheduler>,
    dispatcher: EventDispatcher,
    state_tx: watch::Sender<ConnectionState>,
    sample_tx: watch::Sender<Option<MetricSample>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (sample_tx, _) = watch::channel(None);
        Self {
            machine: Mutex::new(ConnectionMachine::default()),
            heartbeat: Mutex::new(HeartbeatScheduler::new()),
            dispatcher: EventDispatcher::new(),
            state_tx,
            sample_tx,
        }
    }

    fn state(&self) -> ConnectionState {
        lock(&self.machine).state().clone()
    }

    /// Starts a new connection generation and enters `Connecting`.
    fn begin(&self, session: SessionId) -> Result<(), StreamClientError> {
        let mut machine = lock(&self.machine);
        let next = match machine.plan(&Input::Connect) {
            Ok(Some(next)) => next,
            Ok(None) | Err(_) => {
                return Err(StreamClientError::InvalidState(machine.state().clone()));
            }
        };
        lock(&self.heartbeat).disarm();
        machine.begin(session);
        self.commit(&mut machine, next, &Input::Connect);
        Ok(())
    }

    /// Applies `input` on behalf of `session`.
    ///
    /// Returns the new state when the input changed it. Inputs from stale
    /// sessions and inputs the current state does not accept are dropped.
    fn apply(&self, session: SessionId, input: Input) -> Option<ConnectionState> {
        let mut machine = lock(&self.machine);
        if !machine.is_current(session) {
            debug!(event = "stale_session_input_dropped", session = %session, input = input.name());
            return None;
        }

        let next = match machine.plan(&input) {
            Ok(Some(next)) => next,
            Ok(None) => return None,
            Err(err) => {
                warn!(event = "illegal_transition_rejected", session = %session, error = %err);
                return None;
            }
        };

        if matches!(next, ConnectionState::Closing | ConnectionState::Errored(_)) {
            lock(&self.heartbeat).disarm();
        }
        self.commit(&mut machine, next.clone(), &input);
        Some(next)
    }

    /// Handles the heartbeat directive: arms the scheduler and enters
    /// `Authenticating` under the same lock.
    fn enter_authenticating(
        &self,
        session: SessionId,
        interval_ms: i64,
        ticks: mpsc::UnboundedSender<()>,
    ) -> Option<ConnectionState> {
        let mut machine = lock(&self.machine);
        if !machine.is_current(session) {
            return None;
        }

        let input = Input::HeartbeatDirective { interval_ms };
        let next = match machine.plan(&input) {
            Ok(Some(next)) => next,
            Ok(None) => return None,
            Err(err) => {
                warn!(event = "illegal_transition_rejected", session = %session, error = %err);
                return None;
            }
        };

        let armed = lock(&self.heartbeat).arm(interval_ms, move || {
            let _ = ticks.send(());
        });
        match armed {
            Ok(()) => {
                self.commit(&mut machine, next.clone(), &input);
                Some(next)
            }
            Err(err) => {
                let failure = Input::Fail(ErrorReason::Configuration(err.to_string()));
                let next = machine.plan(&failure).ok().flatten()?;
                self.commit(&mut machine, next.clone(), &failure);
                Some(next)
            }
        }
    }

    /// Records an event and dispatches it while `Streaming`.
    fn deliver(&self, session: SessionId, event: &EventFrame) {
        let mut machine = lock(&self.machine);
        if !machine.is_current(session) {
            return;
        }
        if let Err(err) = machine.plan(&Input::Event { seq: event.seq }) {
            warn!(event = "event_outside_streaming_dropped", session = %session, error = %err);
            return;
        }

        if let SequenceCheck::Gap { expected, received } = machine.observe_seq(event.seq) {
            warn!(event = "sequence_gap", session = %session, expected, received);
        }

        if let Some(sample) = self.dispatcher.dispatch(event) {
            self.sample_tx.send_replace(Some(sample));
        }
    }

    fn commit(&self, machine: &mut ConnectionMachine, next: ConnectionState, input: &Input) {
        let previous = machine.commit(next.clone(), input);
        if previous == next {
            return;
        }
        info!(
            event = "connection_state_changed",
            session = ?machine.session().map(|id| id.0),
            from = %previous,
            to = %next
        );
        self.state_tx.send_replace(next.clone());
        self.dispatcher.lifecycle_changed(LifecycleChange {
            previous,
            current: next,
        });
    }
}

struct SessionHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
}

/// Public entry point for the vitals stream.
///
/// One client drives at most one connection at a time.
pub struct StreamClient {
    config: Mutex<StreamConfig>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    session: Mutex<Option<SessionHandle>>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("config", &*lock(&self.config))
            .field("state", &self.current_state())
            .finish()
    }
}

impl StreamClient {
    /// Creates a client that connects over websockets.
    pub fn new(config: StreamConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Creates a client using a custom transport.
    pub fn with_connector(config: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Mutex::new(config),
            connector,
            shared: Arc::new(Shared::new()),
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    /// Opens a connection with the configured credential.
    ///
    /// Returns immediately; progress is reported through lifecycle observers.
    /// While a connection is already in progress or streaming, its id is
    /// returned and nothing new is opened.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) -> Result<SessionId, StreamClientError> {
        let mut slot = lock(&self.session);
        if self.shared.state().is_active() {
            if let Some(handle) = slot.as_ref() {
                return Ok(handle.id);
            }
        }

        let config = lock(&self.config).clone();
        config.validate()?;

        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.shared.begin(id)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let connector = Arc::clone(&self.connector);
        tokio::spawn(async move {
            connection_worker(id, config, connector, shared, command_rx).await;
        });

        *slot = Some(SessionHandle {
            id,
            commands: command_tx,
        });
        Ok(id)
    }

    /// Replaces the credential and connects.
    ///
    /// The new credential is used for this and later connections. An active
    /// connection is left as is.
    pub fn connect_with_credential(
        &self,
        credential: SecretString,
    ) -> Result<SessionId, StreamClientError> {
        {
            let mut config = lock(&self.config);
            *config = config.clone().with_credential(credential);
        }
        self.connect()
    }

    /// Closes the connection. Safe to call from any state, any number of times.
    ///
    /// On return the state is [`ConnectionState::Closed`] and no heartbeat
    /// timer is armed. Transport teardown finishes in the background.
    pub fn disconnect(&self) {
        let mut slot = lock(&self.session);
        let handle = slot.take();

        let session = {
            let machine = lock(&self.shared.machine);
            machine.session()
        };
        let Some(session) = session else {
            // Never connected: walk Idle through Closing to Closed.
            let mut machine = lock(&self.shared.machine);
            for input in [Input::Disconnect, Input::TornDown] {
                if let Ok(Some(next)) = machine.plan(&input) {
                    lock(&self.shared.heartbeat).disarm();
                    self.shared.commit(&mut machine, next, &input);
                }
            }
            return;
        };

        self.shared.apply(session, Input::Disconnect);
        if let Some(handle) = handle {
            let _ = handle.commands.send(Command::Shutdown);
        }
        self.shared.apply(session, Input::TornDown);
    }

    /// Registers an observer for every recognised metric sample.
    pub fn on_sample<F>(&self, observer: F)
    where
        F: FnMut(MetricSample) + Send + 'static,
    {
        self.shared.dispatcher.on_sample(observer);
    }

    /// Registers an observer for one metric kind.
    pub fn on_metric<F>(&self, kind: MetricKind, observer: F)
    where
        F: FnMut(MetricSample) + Send + 'static,
    {
        self.shared.dispatcher.on_metric(kind, observer);
    }

    /// Registers an observer for connection state changes.
    pub fn on_lifecycle_change<F>(&self, observer: F)
    where
        F: FnMut(LifecycleChange) + Send + 'static,
    {
        self.shared.dispatcher.on_lifecycle_change(observer);
    }

    pub fn current_state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// True while the connection is streaming.
    pub fn is_connected(&self) -> bool {
        self.current_state() == ConnectionState::Streaming
    }

    /// Most recent sample received on any connection of this client.
    pub fn latest_sample(&self) -> Option<MetricSample> {
        self.shared.sample_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn watch_sample(&self) -> watch::Receiver<Option<MetricSample>> {
        self.shared.sample_tx.subscribe()
    }

    /// Interval announced by the server for the current connection.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        lock(&self.shared.machine).heartbeat_interval()
    }

    /// True while a keep-alive timer is armed.
    pub fn heartbeat_armed(&self) -> bool {
        lock(&self.shared.heartbeat).is_armed()
    }

    /// Id of the most recent connection, if any was opened.
    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.shared.machine).session()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum WorkerExit {
    /// The facade asked for shutdown; state is already handled there.
    Shutdown,
    /// The peer closed the link.
    PeerClosed(Option<String>),
    Failed(ErrorReason),
}

async fn connection_worker(
    session: SessionId,
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let opened = tokio::select! {
        result = with_timeout(config.connect_timeout(), connector.open(config.endpoint())) => {
            match result {
                Ok(Ok(transport)) => Ok(transport),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(TransportError::OpenTimeout(config.connect_timeout())),
            }
        }
        _ = commands.recv() => {
            debug!(event = "open_cancelled", session = %session);
            return;
        }
    };

    let mut transport = match opened {
        Ok(transport) => transport,
        Err(err) => {
            shared.apply(session, Input::Fail(ErrorReason::Transport(err.to_string())));
            return;
        }
    };

    let exit = run_session(session, &config, transport.as_mut(), &shared, &mut commands).await;

    // The transition disarms the heartbeat, so it must land before teardown.
    let closing = match exit {
        WorkerExit::Shutdown => false,
        WorkerExit::PeerClosed(reason) => {
            shared.apply(session, Input::TransportClosed(reason)) == Some(ConnectionState::Closing)
        }
        WorkerExit::Failed(reason) => {
            shared.apply(session, Input::Fail(reason));
            false
        }
    };

    if let Err(err) = transport.close().await {
        debug!(event = "transport_close_failed", session = %session, error = %err);
    }

    if closing {
        shared.apply(session, Input::TornDown);
    }
}

async fn run_session(
    session: SessionId,
    config: &StreamConfig,
    transport: &mut dyn Transport,
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> WorkerExit {
    if shared.apply(session, Input::TransportOpened).is_none() {
        return WorkerExit::Shutdown;
    }

    let identify = Frame::identify(config.credential.expose_secret(), config.auth_type());
    if let Err(err) = transport.send(encode(&identify)).await {
        return WorkerExit::Failed(ErrorReason::Transport(err.to_string()));
    }
    let handshake_deadline = Instant::now() + config.handshake_grace();

    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();

    loop {
        let streaming = shared.state() == ConnectionState::Streaming;
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Shutdown) | None => return WorkerExit::Shutdown,
                }
            }
            Some(()) = tick_rx.recv() => {
                if !shared.state().heartbeat_allowed() {
                    continue;
                }
                trace!(event = "heartbeat_sent", session = %session);
                if let Err(err) = transport.send(encode(&Frame::heartbeat())).await {
                    return WorkerExit::Failed(ErrorReason::Transport(err.to_string()));
                }
            }
            _ = tokio::time::sleep_until(handshake_deadline), if !streaming => {
                warn!(
                    event = "handshake_timeout",
                    session = %session,
                    grace_ms = config.handshake_grace().as_millis() as u64
                );
                return WorkerExit::Failed(ErrorReason::HandshakeTimeout);
            }
            inbound = transport.recv() => {
                match inbound {
                    Some(Ok(TransportEvent::Text(text))) => {
                        handle_text(session, &text, shared, &tick_tx);
                    }
                    Some(Ok(TransportEvent::Closed(info))) => {
                        return WorkerExit::PeerClosed(info.map(|info| info.describe()));
                    }
                    Some(Err(err)) => {
                        return WorkerExit::Failed(ErrorReason::Transport(err.to_string()));
                    }
                    None => return WorkerExit::PeerClosed(None),
                }
            }
        }

        if shared.state().is_terminal() {
            return WorkerExit::Shutdown;
        }
    }
}

fn handle_text(
    session: SessionId,
    text: &str,
    shared: &Shared,
    ticks: &mpsc::UnboundedSender<()>,
) {
    let message = match ServerMessage::from_text(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(event = "frame_dropped", session = %session, error = %err);
            return;
        }
    };

    match message {
        ServerMessage::Hello {
            heartbeat_interval_ms,
        } => {
            shared.enter_authenticating(session, heartbeat_interval_ms, ticks.clone());
        }
        ServerMessage::Ready => {
            shared.apply(session, Input::AuthAccepted);
        }
        ServerMessage::HeartbeatAck => {
            debug!(event = "heartbeat_ack", session = %session);
        }
        ServerMessage::Dispatch(event) => shared.deliver(session, &event),
    }
}
