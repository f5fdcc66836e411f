//! Connection lifecycle states and the transition table that drives them.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Identifies one connection attempt made by a client.
///
/// Ids increase monotonically per client, so inputs produced by a worker
/// belonging to an earlier connection can be recognised and ignored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection ended in [`ConnectionState::Errored`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ErrorReason {
    /// The underlying link failed.
    Transport(String),
    /// The server refused the credential, optionally with its close reason.
    AuthRejected(Option<String>),
    /// The handshake did not complete within the configured grace period.
    HandshakeTimeout,
    /// The server announced an unusable heartbeat interval.
    Configuration(String),
}

impl ErrorReason {
    /// Failures an external reconnect policy may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorReason::Transport(_) | ErrorReason::HandshakeTimeout)
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::Transport(detail) => write!(f, "transport error: {detail}"),
            ErrorReason::AuthRejected(Some(reason)) => write!(f, "auth rejected: {reason}"),
            ErrorReason::AuthRejected(None) => write!(f, "auth rejected"),
            ErrorReason::HandshakeTimeout => write!(f, "handshake timed out"),
            ErrorReason::Configuration(detail) => write!(f, "configuration error: {detail}"),
        }
    }
}

/// Lifecycle state of the stream connection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    AwaitingHeartbeatDirective,
    Authenticating,
    Streaming,
    Closing,
    Closed,
    Errored(ErrorReason),
}

impl ConnectionState {
    /// True while a worker owns a live or pending transport.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::AwaitingHeartbeatDirective
                | ConnectionState::Authenticating
                | ConnectionState::Streaming
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored(_))
    }

    /// True once the server has announced the heartbeat cadence.
    pub fn heartbeat_allowed(&self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating | ConnectionState::Streaming
        )
    }

    /// Computes the state reached by applying `input`.
    ///
    /// `Ok(None)` means the input is accepted without a state change.
    pub fn next(&self, input: &Input) -> Result<Option<ConnectionState>, IllegalTransition> {
        use ConnectionState as S;

        let next = match (self, input) {
            (S::Idle | S::Closed | S::Errored(_), Input::Connect) => S::Connecting,
            (S::Connecting, Input::TransportOpened) => S::AwaitingHeartbeatDirective,
            (S::AwaitingHeartbeatDirective, Input::HeartbeatDirective { .. }) => S::Authenticating,
            (S::Authenticating, Input::AuthAccepted) => S::Streaming,
            (S::Authenticating, Input::AuthRejected(reason)) => {
                S::Errored(ErrorReason::AuthRejected(reason.clone()))
            }
            (S::Streaming, Input::Event { .. }) => return Ok(None),
            (S::Authenticating, Input::TransportClosed(Some(reason))) => {
                S::Errored(ErrorReason::AuthRejected(Some(reason.clone())))
            }
            // No close frame: the link dropped, the server refused nothing.
            (S::Authenticating, Input::TransportClosed(None)) => S::Errored(
                ErrorReason::Transport("link dropped during authentication".to_string()),
            ),
            (
                S::Connecting | S::AwaitingHeartbeatDirective | S::Streaming,
                Input::TransportClosed(_),
            ) => S::Closing,
            (S::Closing | S::Closed, Input::Disconnect) => return Ok(None),
            (_, Input::Disconnect) => S::Closing,
            (S::Closing, Input::TornDown) => S::Closed,
            (state, Input::Fail(reason)) if state.is_active() => S::Errored(reason.clone()),
            (state, input) => {
                return Err(IllegalTransition {
                    from: state.clone(),
                    input: input.name(),
                })
            }
        };
        Ok(Some(next))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::AwaitingHeartbeatDirective => {
                f.write_str("awaiting_heartbeat_directive")
            }
            ConnectionState::Authenticating => f.write_str("authenticating"),
            ConnectionState::Streaming => f.write_str("streaming"),
            ConnectionState::Closing => f.write_str("closing"),
            ConnectionState::Closed => f.write_str("closed"),
            ConnectionState::Errored(reason) => write!(f, "errored ({reason})"),
        }
    }
}

/// Signals accepted by the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Connect,
    TransportOpened,
    HeartbeatDirective { interval_ms: i64 },
    AuthAccepted,
    AuthRejected(Option<String>),
    Event { seq: Option<u64> },
    TransportClosed(Option<String>),
    Disconnect,
    TornDown,
    Fail(ErrorReason),
}

impl Input {
    pub fn name(&self) -> &'static str {
        match self {
            Input::Connect => "connect",
            Input::TransportOpened => "transport_opened",
            Input::HeartbeatDirective { .. } => "heartbeat_directive",
            Input::AuthAccepted => "auth_accepted",
            Input::AuthRejected(_) => "auth_rejected",
            Input::Event { .. } => "event",
            Input::TransportClosed(_) => "transport_closed",
            Input::Disconnect => "disconnect",
            Input::TornDown => "torn_down",
            Input::Fail(_) => "fail",
        }
    }
}

/// An input that the current state does not accept.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("illegal transition: `{input}` in state {from}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub input: &'static str,
}

/// Per-client connection record: current state plus negotiated parameters.
#[derive(Debug, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    session: Option<SessionId>,
    heartbeat_interval: Option<Duration>,
    last_seq: Option<u64>,
}

/// Outcome of a sequence number check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SequenceCheck {
    InOrder,
    Gap { expected: u64, received: u64 },
    Untracked,
}

impl ConnectionMachine {
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// True when `session` identifies the connection currently tracked.
    pub fn is_current(&self, session: SessionId) -> bool {
        self.session == Some(session)
    }

    /// Resolves `input` against the transition table without committing.
    pub fn plan(&self, input: &Input) -> Result<Option<ConnectionState>, IllegalTransition> {
        self.state.next(input)
    }

    /// Commits a planned state, updating negotiated parameters.
    ///
    /// Returns the previous state.
    pub fn commit(&mut self, next: ConnectionState, input: &Input) -> ConnectionState {
        match input {
            Input::HeartbeatDirective { interval_ms } if *interval_ms > 0 => {
                self.heartbeat_interval = Some(Duration::from_millis(*interval_ms as u64));
            }
            _ => {}
        }
        std::mem::replace(&mut self.state, next)
    }

    /// Starts tracking a new connection generation.
    pub fn begin(&mut self, session: SessionId) {
        self.session = Some(session);
        self.heartbeat_interval = None;
        self.last_seq = None;
    }

    /// Records an inbound sequence number.
    pub fn observe_seq(&mut self, seq: Option<u64>) -> SequenceCheck {
        let Some(received) = seq else {
            return SequenceCheck::Untracked;
        };
        let check = match self.last_seq {
            Some(last) if received > last.saturating_add(1) => SequenceCheck::Gap {
                expected: last + 1,
                received,
            },
            _ => SequenceCheck::InOrder,
        };
        self.last_seq = Some(received);
        check
    }
}
