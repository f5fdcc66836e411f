//! Wire frames exchanged with the vitals stream service.
//!
//! Every text message is a JSON object of the form
//! `{"op": <u8>, "d": <payload?>, "t": "<event type?>", "seq": <u64?>}`.
//! [`Frame`] is the transport-level view of that object and [`ServerMessage`]
//! is the typed view of frames the server is allowed to send.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Operation code carried in the `op` field of every frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OpCode {
    /// Client keep-alive.
    Heartbeat,
    /// Server acknowledgement of a keep-alive.
    HeartbeatAck,
    /// Server heartbeat directive announcing the expected interval.
    Hello,
    /// Client authentication frame.
    Identify,
    /// Server acknowledgement of a successful authentication.
    Ready,
    /// Server event carrying a metric update.
    Dispatch,
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Heartbeat => 0,
            OpCode::HeartbeatAck => 1,
            OpCode::Hello => 2,
            OpCode::Identify => 3,
            OpCode::Ready => 4,
            OpCode::Dispatch => 5,
        }
    }

    pub fn from_u64(raw: u64) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(OpCode::Heartbeat),
            1 => Ok(OpCode::HeartbeatAck),
            2 => Ok(OpCode::Hello),
            3 => Ok(OpCode::Identify),
            4 => Ok(OpCode::Ready),
            5 => Ok(OpCode::Dispatch),
            other => Err(DecodeError::UnknownOpCode(other)),
        }
    }

    /// Returns true for op codes the server may legitimately send.
    pub fn is_server_op(self) -> bool {
        matches!(
            self,
            OpCode::HeartbeatAck | OpCode::Hello | OpCode::Ready | OpCode::Dispatch
        )
    }
}

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The message is not JSON or a field has the wrong type.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The required `op` field is absent.
    #[error("frame is missing the op code")]
    MissingOpCode,

    /// The op code is not assigned by the protocol.
    #[error("unknown op code {0}")]
    UnknownOpCode(u64),

    /// The op code is only valid in the client to server direction.
    #[error("op code {0:?} is not sent by the server")]
    UnexpectedOpCode(OpCode),

    /// A field required by the op code is absent.
    #[error("frame is missing required field `{0}`")]
    MissingField(&'static str),

    /// A field is present but cannot be interpreted.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// One decoded wire unit.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub op: OpCode,
    pub event_type: Option<String>,
    pub payload: Option<Value>,
    pub seq: Option<u64>,
}

impl Frame {
    /// Creates a frame with no payload, tag, or sequence number.
    pub fn control(op: OpCode) -> Self {
        Self {
            op,
            event_type: None,
            payload: None,
            seq: None,
        }
    }

    /// Client keep-alive frame.
    pub fn heartbeat() -> Self {
        Self::control(OpCode::Heartbeat)
    }

    /// Client authentication frame.
    ///
    /// `auth_type` is forwarded verbatim; the service treats it as an opaque
    /// client-kind marker.
    pub fn identify(token: &str, auth_type: u8) -> Self {
        let payload = IdentifyPayload {
            token: token.to_string(),
            auth_type,
        };
        Self {
            payload: serde_json::to_value(payload).ok(),
            ..Self::control(OpCode::Identify)
        }
    }

    /// Server heartbeat directive. Mostly useful for mock servers.
    pub fn hello(heartbeat_interval_ms: i64) -> Self {
        Self {
            payload: Some(serde_json::json!({ "heartbeat_interval": heartbeat_interval_ms })),
            ..Self::control(OpCode::Hello)
        }
    }

    /// Server event frame carrying a single numeric reading.
    pub fn dispatch(event_type: impl Into<String>, value: f64, seq: Option<u64>) -> Self {
        Self {
            op: OpCode::Dispatch,
            event_type: Some(event_type.into()),
            payload: Some(serde_json::json!({ "val": value })),
            seq,
        }
    }
}

/// Authentication payload carried by [`OpCode::Identify`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyPayload {
    pub token: String,
    #[serde(rename = "type")]
    pub auth_type: u8,
}

#[derive(Debug, Deserialize)]
struct HelloPayload {
    heartbeat_interval: Option<i64>,
}

/// Numeric reading carried by a dispatch frame.
#[derive(Debug, Deserialize)]
pub(crate) struct ReadingPayload {
    #[serde(alias = "value")]
    pub val: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    op: Option<u64>,
    #[serde(default)]
    d: Option<Value>,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    seq: Option<u64>,
}

/// Encodes a frame into its text wire form.
pub fn encode(frame: &Frame) -> String {
    let mut object = Map::new();
    object.insert("op".to_string(), Value::from(frame.op.as_u8()));
    if let Some(payload) = &frame.payload {
        object.insert("d".to_string(), payload.clone());
    }
    if let Some(event_type) = &frame.event_type {
        object.insert("t".to_string(), Value::from(event_type.as_str()));
    }
    if let Some(seq) = frame.seq {
        object.insert("seq".to_string(), Value::from(seq));
    }
    Value::Object(object).to_string()
}

/// Decodes a text wire message into a frame.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    let wire: WireFrame = serde_json::from_str(text)?;
    let op = OpCode::from_u64(wire.op.ok_or(DecodeError::MissingOpCode)?)?;
    Ok(Frame {
        op,
        event_type: wire.t,
        payload: wire.d.filter(|payload| !payload.is_null()),
        seq: wire.seq,
    })
}

/// Event frame forwarded to the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct EventFrame {
    pub event_type: String,
    pub payload: Option<Value>,
    pub seq: Option<u64>,
}

impl EventFrame {
    /// Extracts the numeric reading from the payload.
    pub fn reading(&self) -> Result<f64, DecodeError> {
        let payload = self.payload.clone().ok_or(DecodeError::MissingField("d"))?;
        let reading: ReadingPayload =
            serde_json::from_value(payload).map_err(|err| DecodeError::InvalidField {
                field: "d.val",
                reason: err.to_string(),
            })?;
        let value = reading.val.ok_or(DecodeError::MissingField("d.val"))?;
        if !value.is_finite() {
            return Err(DecodeError::InvalidField {
                field: "d.val",
                reason: "reading must be a finite number".to_string(),
            });
        }
        Ok(value)
    }
}

/// Typed frames the server may send.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Hello { heartbeat_interval_ms: i64 },
    HeartbeatAck,
    Ready,
    Dispatch(EventFrame),
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, DecodeError> {
        Self::try_from(decode(text)?)
    }
}

impl TryFrom<Frame> for ServerMessage {
    type Error = DecodeError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        match frame.op {
            OpCode::Hello => {
                let payload = frame.payload.ok_or(DecodeError::MissingField("d"))?;
                let hello: HelloPayload = serde_json::from_value(payload).map_err(|err| {
                    DecodeError::InvalidField {
                        field: "d.heartbeat_interval",
                        reason: err.to_string(),
                    }
                })?;
                let heartbeat_interval_ms = hello
                    .heartbeat_interval
                    .ok_or(DecodeError::MissingField("d.heartbeat_interval"))?;
                Ok(ServerMessage::Hello {
                    heartbeat_interval_ms,
                })
            }
            OpCode::HeartbeatAck => Ok(ServerMessage::HeartbeatAck),
            OpCode::Ready => Ok(ServerMessage::Ready),
            OpCode::Dispatch => {
                let event_type = frame.event_type.ok_or(DecodeError::MissingField("t"))?;
                Ok(ServerMessage::Dispatch(EventFrame {
                    event_type,
                    payload: frame.payload,
                    seq: frame.seq,
                }))
            }
            op @ (OpCode::Heartbeat | OpCode::Identify) => Err(DecodeError::UnexpectedOpCode(op)),
        }
    }
}
